//! Byte-counting stream wrapper.
//!
//! [`InstrumentedConn`] is a transparent `AsyncRead + AsyncWrite` wrapper:
//! every poll is forwarded to the inner stream unchanged, and only after a
//! poll completes with data does it bump the shared counters. Errors, EOF,
//! partial transfers and `Pending` are passed through as-is.
//!
//! After [`InstrumentedConn::close`] the wrapper no longer touches the inner
//! stream: reads report EOF and writes fail with `NotConnected`, so nothing
//! can move through it uncounted.

use crate::record::TrackedConn;
use crate::tracker::TrackerRef;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// A stream registered with a [`crate::Tracker`].
///
/// Created by [`crate::Tracker::new_instrumented_conn`]. Dropping it, or
/// calling [`InstrumentedConn::close`], removes it from the tracker.
#[derive(Debug)]
pub struct InstrumentedConn<S> {
    inner: S,
    record: Arc<TrackedConn>,
    tracker: TrackerRef,
}

impl<S> InstrumentedConn<S> {
    pub(crate) fn new(inner: S, record: Arc<TrackedConn>, tracker: TrackerRef) -> Self {
        Self {
            inner,
            record,
            tracker,
        }
    }

    /// The shared accounting record, as seen by the tracker.
    pub fn record(&self) -> &Arc<TrackedConn> {
        &self.record
    }

    pub fn id(&self) -> u64 {
        self.record.id()
    }

    pub fn role(&self) -> &str {
        self.record.role()
    }

    pub fn remote_host(&self) -> &str {
        self.record.remote_host()
    }

    /// Bytes successfully read so far.
    pub fn bytes_in(&self) -> u64 {
        self.record.bytes_in()
    }

    /// Bytes successfully written so far.
    pub fn bytes_out(&self) -> u64 {
        self.record.bytes_out()
    }

    pub fn last_activity(&self) -> Instant {
        self.record.last_activity()
    }

    pub fn since_last_activity(&self) -> Duration {
        self.record.since_last_activity()
    }

    /// True when no data has moved for at least the tracker's idle timeout.
    pub fn idle(&self) -> bool {
        self.record.idle()
    }

    pub fn is_closed(&self) -> bool {
        self.record.is_closed()
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the wrapped stream.
    ///
    /// I/O done directly through this reference is not counted.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Mark closed, deregister and log. Only the first call does anything.
    fn finish(&self) {
        if !self.record.mark_closed() {
            return;
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.release(&self.record);
        }
    }
}

impl<S: AsyncWrite + Unpin> InstrumentedConn<S> {
    /// Shut the stream down and remove the connection from its tracker.
    ///
    /// Counters stay readable afterwards. Further reads return EOF and
    /// further writes fail with `ErrorKind::NotConnected`. Calling this again is a no-op
    /// that returns `Ok(())`. The stream's own shutdown error, if any, is
    /// returned after deregistration.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.record.is_closed() {
            return Ok(());
        }
        let result = self.inner.shutdown().await;
        self.finish();
        result
    }
}

impl<S> Drop for InstrumentedConn<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.record.is_closed() {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.record.record_read(buf.filled().len().saturating_sub(before));
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.record.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.record.record_write(n);
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if self.record.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = poll {
            self.record.record_write(n);
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.record.is_closed() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    /// Half-close only; the connection stays registered until
    /// [`InstrumentedConn::close`] or drop.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.record.is_closed() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::{ShutdownFlag, Tracker, TracingLogger};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_tracker() -> Tracker {
        Tracker::new(
            Duration::from_millis(500),
            None,
            Some(Arc::new(TracingLogger)),
            ShutdownFlag::new(),
        )
    }

    async fn tcp_listener_or_skip() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP localhost for test: {err}"),
        }
    }

    // ========================================================================
    // Byte counting
    // ========================================================================

    #[tokio::test]
    async fn test_byte_counting_over_tcp() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let tracker = test_tracker();
        let sent = b"X-Smokescreen-Test".to_vec();

        let writer_tracker = tracker.clone();
        let writer_payload = sent.clone();
        let writer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = writer_tracker.new_instrumented_conn(socket, "test", "localhost");
            let n = conn.write(&writer_payload).await.unwrap();
            conn.close().await.unwrap();

            assert_eq!(n, writer_payload.len());
            assert_eq!(conn.bytes_out(), writer_payload.len() as u64);
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut reader = tracker.new_instrumented_conn(socket, "testBytesInOut", "localhost");

        let mut received = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            let offset = received.len();
            assert_eq!(&chunk[..n], &sent[offset..offset + n]);
            received.extend_from_slice(&chunk[..n]);
        }

        writer.await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(reader.bytes_in(), sent.len() as u64);
        assert_eq!(reader.bytes_out(), 0);
    }

    #[tokio::test]
    async fn test_single_write_counts_payload() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        let payload = b"X-Smokescreen-Test";
        let n = conn.write(payload).await.unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(conn.bytes_out(), payload.len() as u64);
    }

    #[tokio::test]
    async fn test_write_sequence_is_exact_and_monotonic() {
        let tracker = test_tracker();
        let (a, mut b) = tokio::io::duplex(4096);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        let mut total = 0u64;
        for size in [1usize, 7, 64, 300, 2] {
            let chunk = vec![0xAB; size];
            conn.write_all(&chunk).await.unwrap();
            total += size as u64;
            assert_eq!(conn.bytes_out(), total);
        }
        conn.shutdown().await.unwrap();

        let mut drained = Vec::new();
        b.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained.len() as u64, total);
    }

    #[tokio::test]
    async fn test_partial_write_counts_accepted_bytes_only() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(8);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        let n = conn.write(&[1u8; 32]).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(conn.bytes_out(), 8);
    }

    #[tokio::test]
    async fn test_read_sequence_is_exact() {
        let tracker = test_tracker();
        let (a, mut b) = tokio::io::duplex(4096);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        b.write_all(&[7u8; 1000]).await.unwrap();
        b.shutdown().await.unwrap();

        let mut buf = [0u8; 128];
        let mut seen = 0u64;
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen += n as u64;
            assert_eq!(conn.bytes_in(), seen);
        }
        assert_eq!(conn.bytes_in(), 1000);
    }

    #[tokio::test]
    async fn test_eof_is_not_counted() {
        let tracker = test_tracker();
        let (a, b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");
        drop(b);

        let before = conn.last_activity();
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(conn.bytes_in(), 0);
        assert_eq!(conn.last_activity(), before);
    }

    #[tokio::test]
    async fn test_errors_pass_through_unchanged() {
        let tracker = test_tracker();
        let (a, b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");
        drop(b);

        let err = conn.write(b"lost").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(conn.bytes_out(), 0);
    }

    #[tokio::test]
    async fn test_vectored_write_counts() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        let bufs = [std::io::IoSlice::new(b"ab"), std::io::IoSlice::new(b"cde")];
        let n = conn.write_vectored(&bufs).await.unwrap();
        assert!(n > 0);
        assert_eq!(conn.bytes_out(), n as u64);
    }

    // ========================================================================
    // Idle detection
    // ========================================================================

    #[tokio::test]
    async fn test_idle_after_timeout() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "testIdle", "localhost");

        conn.write_all(b"egress").await.unwrap();
        assert!(!conn.idle());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(conn.idle());
    }

    #[tokio::test]
    async fn test_activity_resets_idle() {
        let tracker = Tracker::new(Duration::from_millis(50), None, None, ShutdownFlag::new());
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.idle());

        conn.write_all(b"x").await.unwrap();
        assert!(!conn.idle());
    }

    #[tokio::test]
    async fn test_idle_readable_from_other_task() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");
        let record = Arc::clone(conn.record());

        conn.write_all(b"ping").await.unwrap();
        let observed = tokio::spawn(async move { (record.idle(), record.bytes_out()) })
            .await
            .unwrap();
        assert_eq!(observed, (false, 4));
    }

    // ========================================================================
    // Close
    // ========================================================================

    #[tokio::test]
    async fn test_close_keeps_counters_and_is_idempotent() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        conn.write_all(b"bye").await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.bytes_out(), 3);
        assert!(tracker.is_empty());

        conn.close().await.unwrap();
        assert_eq!(conn.bytes_out(), 3);
    }

    #[tokio::test]
    async fn test_read_after_close_returns_eof() {
        let tracker = test_tracker();
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        conn.close().await.unwrap();
        b.write_all(b"after close").await.unwrap();

        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(conn.bytes_in(), n as u64);
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let tracker = test_tracker();
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        conn.write_all(b"last").await.unwrap();
        conn.close().await.unwrap();

        let err = conn.write(b"more").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        assert_eq!(conn.bytes_out(), 4);
        conn.flush().await.unwrap();
        conn.shutdown().await.unwrap();

        let mut drained = Vec::new();
        b.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained, b"last");
    }

    #[tokio::test]
    async fn test_shutdown_is_half_close_only() {
        let tracker = test_tracker();
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "test", "localhost");

        conn.shutdown().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(tracker.len(), 1);

        b.write_all(b"late reply").await.unwrap();
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late reply");
        assert_eq!(conn.bytes_in(), n as u64);
    }

    #[tokio::test]
    async fn test_close_unblocks_peer() {
        let Some(listener) = tcp_listener_or_skip().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let tracker = test_tracker();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 8];
            socket.read(&mut buf).await.unwrap()
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = tracker.new_instrumented_conn(socket, "client", "localhost");
        conn.close().await.unwrap();

        assert_eq!(client.await.unwrap(), 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_accessors_and_get_ref() {
        let tracker = test_tracker();
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = tracker.new_instrumented_conn(a, "upstream", "example.com");
        assert_eq!(conn.role(), "upstream");
        assert_eq!(conn.remote_host(), "example.com");
        assert_eq!(conn.record().id(), conn.id());
        let _ = conn.get_ref();
        let _ = conn.get_mut();
        assert!(conn.since_last_activity() < Duration::from_secs(1));
    }
}
