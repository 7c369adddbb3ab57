use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use conntrack::{ShutdownFlag, Tracker, TracingLogger};
use conntrack_settings::{ConfigLoader, ConntrackConfig};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::relay::{Relay, RelayConfig};

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        ConntrackConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(ref extra) = args.extra_config {
        config = config.merge(ConntrackConfig::load(extra)?);
    }

    // 2. CLI flags win over files.
    if args.listen.is_some() {
        config.relay.listen = args.listen;
    }
    if args.upstream.is_some() {
        config.relay.upstream = args.upstream;
    }
    if args.upstream_label.is_some() {
        config.relay.upstream_label = args.upstream_label;
    }
    if args.idle_timeout.is_some() {
        config.tracker.idle_timeout_secs = args.idle_timeout;
    }
    if args.drain_timeout.is_some() {
        config.relay.drain_timeout_secs = args.drain_timeout;
    }

    let listen: SocketAddr = config
        .relay
        .listen
        .as_deref()
        .ok_or_else(|| CliError::Other("no listen address configured (use --listen)".to_string()))?
        .parse()
        .map_err(|e| CliError::Other(format!("invalid listen address: {e}")))?;
    let upstream = config
        .relay
        .upstream
        .clone()
        .ok_or_else(|| CliError::Other("no upstream configured (use --upstream)".to_string()))?;

    // 3. Tracker shared by every relay; the flag is flipped on Ctrl-C.
    let shutdown = ShutdownFlag::new();
    let tracker = Tracker::new(
        config.tracker.idle_timeout(),
        None,
        Some(Arc::new(TracingLogger)),
        shutdown.clone(),
    );
    let reporter = config
        .tracker
        .report_idle()
        .then(|| tracker.spawn_idle_reporter(config.relay.idle_check_interval()));

    let relay_config = RelayConfig {
        upstream_label: config
            .relay
            .upstream_label
            .clone()
            .unwrap_or_else(|| upstream.clone()),
        upstream,
        connect_timeout: config.relay.connect_timeout(),
        idle_check_interval: config.relay.idle_check_interval(),
        drain_timeout: config.relay.drain_timeout(),
    };

    // 4. Serve until Ctrl-C, then drain.
    let listener = Relay::bind(listen).await?;
    let bound = listener.local_addr()?;
    info!(
        listen = %bound,
        upstream = %relay_config.upstream,
        idle_timeout_secs = config.tracker.idle_timeout().as_secs(),
        "Relay listening"
    );
    eprintln!("conntrack-relay: listening on {bound}");

    let relay = Relay::new(relay_config, tracker.clone());
    let drained = relay
        .run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C; shutting down");
            }
        })
        .await;

    if let Some(handle) = reporter {
        handle.abort();
    }

    if !drained {
        match tracker.snapshot_json() {
            Ok(json) => warn!(open = %json, "Exiting with connections still open"),
            Err(e) => warn!(error = %e, "Exiting with connections still open"),
        }
    }

    Ok(())
}
