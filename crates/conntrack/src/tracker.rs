//! Connection registry and factory.
//!
//! # Lifecycle
//!
//! ```text
//! Tracker::new(idle_timeout, extensions, logger, shutdown)
//!       |
//!       v
//! new_instrumented_conn(stream, role, remote_host)
//!       |                                   |
//!       | insert id --> Arc<TrackedConn>    | log Opened
//!       v                                   |
//! InstrumentedConn used for I/O <-----------+
//!       |
//!       v
//! close() / drop  --> remove id (once), log Closed
//! ```
//!
//! The registry lock is only held for the map operation itself, never
//! across I/O or logger calls.

use crate::logger::{ConnEvent, ConnLogger};
use crate::record::{ConnSnapshot, TrackedConn};
use crate::{InstrumentedConn, ShutdownFlag, TrackerError};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single sleep while waiting for the registry to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest period accepted by [`Tracker::spawn_idle_reporter`].
pub const MIN_IDLE_REPORT_INTERVAL: Duration = Duration::from_millis(10);

/// Reserved extension slot for tracker construction.
///
/// Carries no settings yet and is never read; it exists so new optional
/// collaborators can be added without changing [`Tracker::new`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TrackerExtensions {}

/// Factory and registry for [`InstrumentedConn`]s.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

pub(crate) struct TrackerInner {
    idle_timeout: Duration,

    #[allow(dead_code)]
    extensions: Option<TrackerExtensions>,

    logger: Option<Arc<dyn ConnLogger>>,

    shutdown: ShutdownFlag,

    /// Live connections keyed by tracker-assigned id.
    registry: RwLock<HashMap<u64, Arc<TrackedConn>>>,

    next_id: AtomicU64,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("has_logger", &self.inner.logger.is_some())
            .field("shutting_down", &self.inner.shutdown.is_set())
            .field("active", &self.len())
            .finish()
    }
}

impl Tracker {
    /// Create a tracker.
    ///
    /// # Arguments
    /// * `idle_timeout` - Inactivity threshold for [`TrackedConn::idle`];
    ///   zero is allowed
    /// * `extensions` - Reserved, pass `None`
    /// * `logger` - Lifecycle event sink; `None` disables event logging
    /// * `shutdown` - Shared flag; the tracker observes later changes to it
    pub fn new(
        idle_timeout: Duration,
        extensions: Option<TrackerExtensions>,
        logger: Option<Arc<dyn ConnLogger>>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                idle_timeout,
                extensions,
                logger,
                shutdown,
                registry: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Configured idle threshold.
    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// The shared shutdown flag this tracker observes.
    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.inner.shutdown
    }

    /// True once the shared shutdown flag has been set.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_set()
    }

    /// Wrap `stream` and register it.
    ///
    /// Never fails. While shutting down the connection is still registered,
    /// so drain logic waits for it, and the open event is flagged.
    pub fn new_instrumented_conn<S>(
        &self,
        stream: S,
        role: impl Into<String>,
        remote_host: impl Into<String>,
    ) -> InstrumentedConn<S> {
        let record = self.inner.register(role.into(), remote_host.into());
        InstrumentedConn::new(stream, record, Arc::downgrade(&self.inner))
    }

    /// Like [`Tracker::new_instrumented_conn`], but refuses new connections
    /// once the shutdown flag is set.
    ///
    /// # Errors
    /// * `TrackerError::ShuttingDown` - The flag is set. The stream is
    ///   dropped, which closes it.
    pub fn try_new_instrumented_conn<S>(
        &self,
        stream: S,
        role: impl Into<String>,
        remote_host: impl Into<String>,
    ) -> Result<InstrumentedConn<S>, TrackerError> {
        let role = role.into();
        let remote_host = remote_host.into();
        if self.is_shutting_down() {
            debug!(role = %role, remote_host = %remote_host, "Refusing connection during shutdown");
            return Err(TrackerError::ShuttingDown { role, remote_host });
        }
        Ok(self.new_instrumented_conn(stream, role, remote_host))
    }

    /// Snapshot of every registered connection, ordered by id.
    ///
    /// Later registrations and removals do not affect the returned vector.
    pub fn active_connections(&self) -> Vec<Arc<TrackedConn>> {
        let mut conns: Vec<_> = self.inner.read_registry().values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.read_registry().len()
    }

    /// Returns true if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read_registry().is_empty()
    }

    /// Registered connections that are currently idle.
    pub fn idle_connections(&self) -> Vec<Arc<TrackedConn>> {
        self.active_connections()
            .into_iter()
            .filter(|c| c.idle())
            .collect()
    }

    /// Log an idle event for each idle connection not yet reported in its
    /// current idle period, and return every idle connection.
    ///
    /// Closing them is the caller's decision.
    pub fn report_idle(&self) -> Vec<Arc<TrackedConn>> {
        let idle = self.idle_connections();
        for conn in &idle {
            if conn.mark_idle_reported() {
                self.inner.emit(&ConnEvent::Idle {
                    conn_id: conn.id(),
                    role: conn.role(),
                    remote_host: conn.remote_host(),
                    idle_for: conn.since_last_activity(),
                });
            }
        }
        idle
    }

    /// Longest time until every registered connection has been inactive
    /// for at least `d`.
    ///
    /// Returns zero when the registry is empty or everything already is.
    pub fn maybe_idle_in(&self, d: Duration) -> Duration {
        self.active_connections()
            .iter()
            .map(|c| d.saturating_sub(c.since_last_activity()))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Serializable view of every registered connection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnSnapshot> {
        self.active_connections()
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }

    /// [`Tracker::snapshot`] encoded as a JSON array.
    ///
    /// # Errors
    /// Returns the serializer error; not expected for these plain fields.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }

    /// Wait until the registry is empty or `timeout` elapses.
    ///
    /// Returns true if the registry drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.len();
            if remaining == 0 {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(remaining, "Drain timed out with connections still open");
                return false;
            }
            let idle_in = self.maybe_idle_in(self.inner.idle_timeout);
            debug!(
                remaining,
                idle_in_ms = idle_in.as_millis() as u64,
                "Waiting for connections to drain"
            );
            let step = idle_in
                .clamp(Duration::from_millis(10), DRAIN_POLL_INTERVAL)
                .min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }

    /// Spawn a task that calls [`Tracker::report_idle`] every `interval`.
    ///
    /// Intervals shorter than [`MIN_IDLE_REPORT_INTERVAL`] (including zero)
    /// are raised to it.
    /// The task stops on its own once every `Tracker` clone is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn_idle_reporter(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = interval.max(MIN_IDLE_REPORT_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                Tracker { inner }.report_idle();
            }
        })
    }
}

impl TrackerInner {
    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Arc<TrackedConn>>> {
        // Recover from a poisoned lock: entries are plain Arcs and stay valid.
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, role: String, remote_host: String) -> Arc<TrackedConn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(TrackedConn::new(id, role, remote_host, self.idle_timeout));
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&record));

        self.emit(&ConnEvent::Opened {
            conn_id: id,
            role: record.role(),
            remote_host: record.remote_host(),
            shutting_down: self.shutdown.is_set(),
        });
        record
    }

    /// Deregister a closed connection and log it. Missing ids are ignored.
    pub(crate) fn release(&self, record: &TrackedConn) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.id());

        self.emit(&ConnEvent::Closed {
            conn_id: record.id(),
            role: record.role(),
            remote_host: record.remote_host(),
            bytes_in: record.bytes_in(),
            bytes_out: record.bytes_out(),
            duration: record.age(),
        });
    }

    /// Hand an event to the logger, if any. A panicking logger is contained
    /// so observability failures never reach the data path.
    fn emit(&self, event: &ConnEvent<'_>) {
        let Some(logger) = self.logger.as_ref() else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| logger.log(event))).is_err() {
            warn!(?event, "Connection logger panicked; event dropped");
        }
    }
}

/// Weak handle used by connections to deregister themselves.
pub(crate) type TrackerRef = Weak<TrackerInner>;
