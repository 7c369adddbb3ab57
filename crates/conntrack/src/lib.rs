//! Connection instrumentation for an egress TCP proxy.
//!
//! `conntrack` wraps the raw streams a proxy accepts or dials so that every
//! byte read and written is counted, the time since the last transfer is
//! observable, and every live connection is registered in a [`Tracker`]
//! that can be enumerated (for example while draining on shutdown).
//!
//! # Architecture
//!
//! ```text
//! proxy accept / dial
//!       |
//!       v
//! Tracker::new_instrumented_conn(stream, role, remote_host)
//!       |
//!       +-- registry: id --> Arc<TrackedConn>   (enumeration, drain, stats)
//!       |
//!       v
//! InstrumentedConn<S>  (AsyncRead + AsyncWrite, drop-in for S)
//!       |
//!       +-- poll_read  --> bytes_in  += n, last_activity = now
//!       +-- poll_write --> bytes_out += n, last_activity = now
//!       +-- close()    --> deregister once, log close event
//! ```
//!
//! The layer never decides whether a connection is allowed and never closes
//! idle connections itself. It reports idleness; the caller decides.
//!
//! # Usage
//!
//! ```ignore
//! use conntrack::{ShutdownFlag, Tracker, TracingLogger};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let shutdown = ShutdownFlag::new();
//! let tracker = Tracker::new(
//!     Duration::from_secs(300),
//!     None,
//!     Some(Arc::new(TracingLogger)),
//!     shutdown.clone(),
//! );
//!
//! let (stream, peer) = listener.accept().await?;
//! let mut conn = tracker.new_instrumented_conn(stream, "client", peer.to_string());
//! // ... use `conn` exactly like the raw TcpStream ...
//! conn.close().await?;
//! ```

mod conn;
mod logger;
mod record;
mod tracker;

pub use conn::InstrumentedConn;
pub use logger::{ConnEvent, ConnLogger, NoopLogger, TracingLogger};
pub use record::{ConnSnapshot, TrackedConn};
pub use tracker::{Tracker, TrackerExtensions, MIN_IDLE_REPORT_INTERVAL};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Errors returned by tracker operations.
///
/// The data path never produces these; stream errors are always the
/// underlying `std::io::Error`, untouched.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The tracker is draining and refuses new registrations.
    #[error("tracker is shutting down; refused {role} connection to {remote_host}")]
    ShuttingDown { role: String, remote_host: String },
}

/// Shared "shutting down" signal.
///
/// Cloning shares the same flag, so process-lifecycle code can keep one
/// clone and flip it while the tracker observes the change.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process as shutting down.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear the flag (mostly useful in tests).
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns true once [`ShutdownFlag::set`] has been called on any clone.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
