//! Shared per-connection accounting record.
//!
//! A [`TrackedConn`] is owned jointly by the [`crate::InstrumentedConn`]
//! that mutates it on the data path and by the tracker registry that
//! enumerates it. Every field is either immutable or atomic, so readers
//! (metrics exporters, drain logic) never need the registry lock to inspect
//! a connection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Byte counters, activity timestamp and labels for one connection.
#[derive(Debug)]
pub struct TrackedConn {
    id: u64,
    role: String,
    remote_host: String,

    /// Monotonic origin for `last_activity`.
    created: Instant,

    /// Wall-clock creation time, reported in snapshots.
    created_at: SystemTime,

    /// Threshold used by [`TrackedConn::idle`].
    idle_timeout: Duration,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    /// Nanoseconds between `created` and the last completed transfer.
    /// Advanced with `fetch_max`, so it never moves backwards.
    last_activity: AtomicU64,

    closed: AtomicBool,

    /// Set once an idle event was logged; cleared by new activity.
    idle_reported: AtomicBool,
}

impl TrackedConn {
    pub(crate) fn new(id: u64, role: String, remote_host: String, idle_timeout: Duration) -> Self {
        Self {
            id,
            role,
            remote_host,
            created: Instant::now(),
            created_at: SystemTime::now(),
            idle_timeout,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            idle_reported: AtomicBool::new(false),
        }
    }

    /// Tracker-assigned identity, unique for the tracker's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical purpose of the connection, e.g. `"client"` or `"upstream"`.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Peer label supplied at registration.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Wall-clock time the connection was registered.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time since the connection was registered.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Bytes successfully read from the stream.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Acquire)
    }

    /// Bytes successfully written to the stream.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Acquire)
    }

    /// Idle threshold inherited from the tracker.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Monotonic instant of the last completed read or write
    /// (the creation instant if nothing has been transferred yet).
    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_activity.load(Ordering::Acquire))
    }

    /// Time elapsed since the last completed read or write.
    pub fn since_last_activity(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// True when no data has moved for at least the idle timeout.
    ///
    /// A zero timeout makes every connection idle as soon as any time
    /// has passed since its last transfer.
    pub fn idle(&self) -> bool {
        self.since_last_activity() >= self.idle_timeout
    }

    /// True once the owning connection was closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Point-in-time copy of this record for reporting.
    pub fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            id: self.id,
            role: self.role.clone(),
            remote_host: self.remote_host.clone(),
            created_at_ms: self
                .created_at
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            secs_since_last_activity: self.since_last_activity().as_secs_f64(),
            idle: self.idle(),
            closed: self.is_closed(),
        }
    }

    pub(crate) fn record_read(&self, n: usize) {
        if n == 0 || self.is_closed() {
            return;
        }
        self.bytes_in.fetch_add(n as u64, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn record_write(&self, n: usize) {
        if n == 0 || self.is_closed() {
            return;
        }
        self.bytes_out.fetch_add(n as u64, Ordering::AcqRel);
        self.touch();
    }

    fn touch(&self) {
        let offset = self.created.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_activity.fetch_max(offset, Ordering::AcqRel);
        self.idle_reported.store(false, Ordering::Release);
    }

    /// Returns true only for the call that actually closed the record.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Returns true only for the first report within an idle period.
    pub(crate) fn mark_idle_reported(&self) -> bool {
        !self.idle_reported.swap(true, Ordering::AcqRel)
    }
}

/// Serializable view of a [`TrackedConn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnSnapshot {
    pub id: u64,
    pub role: String,
    pub remote_host: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub secs_since_last_activity: f64,
    pub idle: bool,
    pub closed: bool,
}

impl ConnSnapshot {
    /// Bytes transferred in both directions.
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }
}
