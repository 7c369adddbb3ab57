//! Lifecycle event sink.
//!
//! The tracker reports connection lifecycle events through the
//! [`ConnLogger`] trait instead of a global logger, so callers can plug in
//! their own sink or silence it entirely with [`NoopLogger`].

use std::time::Duration;
use tracing::{debug, info};

/// A connection lifecycle event.
#[derive(Debug, Clone, Copy)]
pub enum ConnEvent<'a> {
    /// A connection was instrumented and registered.
    Opened {
        conn_id: u64,
        role: &'a str,
        remote_host: &'a str,
        shutting_down: bool,
    },

    /// A connection was closed (explicitly or by drop) and deregistered.
    Closed {
        conn_id: u64,
        role: &'a str,
        remote_host: &'a str,
        bytes_in: u64,
        bytes_out: u64,
        duration: Duration,
    },

    /// A connection has carried no data for at least the idle timeout.
    Idle {
        conn_id: u64,
        role: &'a str,
        remote_host: &'a str,
        idle_for: Duration,
    },
}

/// Structured sink for [`ConnEvent`]s.
///
/// Implementations must not block; they are called inline from
/// registration and close.
pub trait ConnLogger: Send + Sync {
    fn log(&self, event: &ConnEvent<'_>);
}

/// Emits events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ConnLogger for TracingLogger {
    fn log(&self, event: &ConnEvent<'_>) {
        match *event {
            ConnEvent::Opened {
                conn_id,
                role,
                remote_host,
                shutting_down,
            } => {
                debug!(
                    conn_id,
                    role,
                    remote_host,
                    shutting_down,
                    "Connection opened"
                );
            }
            ConnEvent::Closed {
                conn_id,
                role,
                remote_host,
                bytes_in,
                bytes_out,
                duration,
            } => {
                info!(
                    conn_id,
                    role,
                    remote_host,
                    bytes_in,
                    bytes_out,
                    duration_ms = duration.as_millis() as u64,
                    "Connection closed"
                );
            }
            ConnEvent::Idle {
                conn_id,
                role,
                remote_host,
                idle_for,
            } => {
                info!(
                    conn_id,
                    role,
                    remote_host,
                    idle_ms = idle_for.as_millis() as u64,
                    "Connection idle"
                );
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl ConnLogger for NoopLogger {
    fn log(&self, _event: &ConnEvent<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loggers_accept_every_event() {
        let events = [
            ConnEvent::Opened {
                conn_id: 1,
                role: "client",
                remote_host: "localhost",
                shutting_down: false,
            },
            ConnEvent::Closed {
                conn_id: 1,
                role: "client",
                remote_host: "localhost",
                bytes_in: 10,
                bytes_out: 20,
                duration: Duration::from_millis(5),
            },
            ConnEvent::Idle {
                conn_id: 1,
                role: "client",
                remote_host: "localhost",
                idle_for: Duration::from_secs(1),
            },
        ];
        for event in &events {
            TracingLogger.log(event);
            NoopLogger.log(event);
        }
    }

    #[test]
    fn test_logger_is_object_safe() {
        let loggers: Vec<Box<dyn ConnLogger>> = vec![Box::new(TracingLogger), Box::new(NoopLogger)];
        assert_eq!(loggers.len(), 2);
    }
}
