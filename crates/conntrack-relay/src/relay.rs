//! Instrumented TCP relay.
//!
//! Accepts clients, dials one fixed upstream per client and copies bytes
//! both ways. Both legs are wrapped by the shared [`Tracker`], so byte
//! counts and idleness are visible while the relay runs.
//!
//! # Connection Flow
//!
//! ```text
//! accept client --> wrap as "client"
//!         |
//!         v
//! dial upstream (connect timeout) --> wrap as "upstream"
//!         |
//!         v
//! copy_bidirectional  <-- raced against -->  both legs idle?
//!         |                                        |
//!         +------------------+---------------------+
//!                            v
//!                 close both legs (deregister)
//! ```
//!
//! On shutdown the listener stops accepting, the tracker's shutdown flag is
//! set, and the relay waits up to the drain timeout for open relays.

use conntrack::{TrackedConn, Tracker, MIN_IDLE_REPORT_INTERVAL};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind the listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Upstream connection failed.
    #[error("TCP connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Upstream did not accept within the connect timeout.
    #[error("TCP connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Relay I/O failed for a reason other than the peer going away.
    #[error("Relay error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a single relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both sides finished (EOF or reset).
    Finished,
    /// Both legs went idle and the relay closed them.
    Idle,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address every client is relayed to (`host:port`).
    pub upstream: String,

    /// Remote-host label for the upstream leg.
    pub upstream_label: String,

    /// Upstream connect timeout.
    pub connect_timeout: Duration,

    /// How often to check whether both legs went idle.
    pub idle_check_interval: Duration,

    /// Grace period for open relays on shutdown.
    pub drain_timeout: Duration,
}

/// TCP relay whose connections are registered with a [`Tracker`].
pub struct Relay {
    config: Arc<RelayConfig>,
    tracker: Tracker,
}

impl Relay {
    pub fn new(config: RelayConfig, tracker: Tracker) -> Self {
        Self {
            config: Arc::new(config),
            tracker,
        }
    }

    /// Bind the listen address.
    ///
    /// # Errors
    /// * `RelayError::Bind` - If binding fails (e.g. address in use).
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Bind { addr, source: e })
    }

    /// Accept and relay clients until `shutdown` resolves, then drain.
    ///
    /// Returns true if every relay finished within the drain timeout.
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, client_addr) = match accepted {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "TCP accept error");
                            continue;
                        }
                    };
                    self.spawn_relay(client, client_addr);
                }
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        self.tracker.shutdown_flag().set();
        info!(
            open = self.tracker.len(),
            drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
            "Shutting down, draining open connections"
        );
        self.tracker.wait_for_drain(self.config.drain_timeout).await
    }

    fn spawn_relay(&self, client: TcpStream, client_addr: SocketAddr) {
        let tracker = self.tracker.clone();
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            match relay_client(&tracker, &config, client, client_addr).await {
                Ok(outcome) => debug!(client = %client_addr, ?outcome, "Relay ended"),
                Err(e) => debug!(client = %client_addr, error = %e, "Relay error"),
            }
        });
    }
}

/// Relay one client to the upstream until both sides finish or go idle.
async fn relay_client(
    tracker: &Tracker,
    config: &RelayConfig,
    client: TcpStream,
    client_addr: SocketAddr,
) -> Result<RelayOutcome, RelayError> {
    let mut client = tracker.new_instrumented_conn(client, "client", client_addr.to_string());

    let connect = TcpStream::connect(config.upstream.as_str());
    let upstream = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| RelayError::ConnectTimeout {
            addr: config.upstream.clone(),
            timeout: config.connect_timeout,
        })?
        .map_err(|e| RelayError::Connect {
            addr: config.upstream.clone(),
            source: e,
        })?;
    let mut upstream =
        tracker.new_instrumented_conn(upstream, "upstream", config.upstream_label.clone());

    let client_record = Arc::clone(client.record());
    let upstream_record = Arc::clone(upstream.record());

    let result = tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match copied {
            Ok(_) => Ok(RelayOutcome::Finished),
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionReset
                    || e.kind() == std::io::ErrorKind::BrokenPipe =>
            {
                // Normal connection close
                Ok(RelayOutcome::Finished)
            }
            Err(e) => Err(RelayError::Io(e)),
        },
        _ = both_idle(&client_record, &upstream_record, config.idle_check_interval) => {
            debug!(
                client = %client_addr,
                idle_ms = client_record.since_last_activity().as_millis() as u64,
                "Closing idle relay"
            );
            Ok(RelayOutcome::Idle)
        }
    };

    // Best-effort; the peer may already be gone.
    let _ = client.close().await;
    let _ = upstream.close().await;
    result
}

/// Resolves once both records report idle.
///
/// The check interval never drops below [`MIN_IDLE_REPORT_INTERVAL`].
async fn both_idle(a: &TrackedConn, b: &TrackedConn, interval: Duration) {
    let interval = interval.max(MIN_IDLE_REPORT_INTERVAL);
    loop {
        tokio::time::sleep(interval).await;
        if a.idle() && b.idle() {
            return;
        }
    }
}
