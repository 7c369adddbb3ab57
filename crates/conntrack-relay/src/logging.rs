//! Tracing subscriber setup for the relay binary.
//!
//! Log lines go to stderr so stdout stays clean for `config show`.
//! `CONNTRACK_LOG` takes a full `EnvFilter` directive string and replaces
//! the level picked by `-v`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "CONNTRACK_LOG";

/// Filter directives for a `-v` count.
///
/// Other crates stay at `warn`; only the tracker and relay get louder.
pub fn default_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,conntrack={level},conntrack_relay={level}")
}

/// Install the global subscriber.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose >= 2)
                .with_filter(filter),
        )
        .init();
}
