//! Bidirectional byte relay between a client leg and a backend leg.
//!
//! Each direction copies through a fixed buffer and does not read again until
//! the previous chunk has been written to the other leg, so a slow peer stalls
//! its sender instead of growing memory.
//!
//! Teardown rules:
//! - Backend EOF: shut down the client write half after the last bytes are
//!   written, then discard client input until the client's EOF (bounded by
//!   [`DRAIN_LINGER`]). Closing a socket with unread input resets it, and a
//!   reset throws away response bytes the client has not read yet.
//! - Client EOF: shut down the backend write half and keep relaying the
//!   backend's response until it closes (or the idle timeout fires).
//! - Any I/O error or idle timeout: drop both legs.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::session::READ_CHUNK;

/// Upper bound on draining a client after the backend closed.
pub const DRAIN_LINGER: Duration = Duration::from_secs(5);

/// Why a relay ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Backend closed first; client was closed after writing.
    BackendClosed,
    /// Client closed first; backend then finished its side.
    ClientClosed,
    /// No bytes moved in either direction for the idle timeout.
    IdleTimeout,
    /// Read or write error on either leg.
    Error(io::Error),
}

impl CloseReason {
    /// Whether the relay ended without an error or timeout.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::BackendClosed | Self::ClientClosed)
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes copied client -> backend.
    pub bytes_to_backend: u64,
    /// Bytes copied backend -> client.
    pub bytes_from_backend: u64,
    pub reason: CloseReason,
}

/// Relay bytes between `client` and `backend` until the session ends.
///
/// Both streams are dropped before this returns. Pass `&mut` streams to keep
/// ownership of a leg.
pub async fn relay<C, B>(client: C, backend: B, idle_timeout: Option<Duration>) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let last_activity = Activity::new();
    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let reason = {
        let upstream = pump(&mut client_read, &mut backend_write, &last_activity, &to_backend);
        let downstream = pump(
            &mut backend_read,
            &mut client_write,
            &last_activity,
            &from_backend,
        );
        let idle = idle_expiry(&last_activity, idle_timeout);
        tokio::pin!(upstream, downstream, idle);

        let mut client_done = false;
        loop {
            tokio::select! {
                result = &mut downstream => {
                    break match result {
                        Ok(()) if client_done => CloseReason::ClientClosed,
                        Ok(()) => CloseReason::BackendClosed,
                        Err(e) => CloseReason::Error(e),
                    };
                }
                result = &mut upstream, if !client_done => {
                    match result {
                        Ok(()) => client_done = true,
                        Err(e) => break CloseReason::Error(e),
                    }
                }
                _ = &mut idle => break CloseReason::IdleTimeout,
            }
        }
    };

    if matches!(reason, CloseReason::BackendClosed) {
        let linger = idle_timeout.map_or(DRAIN_LINGER, |t| t.min(DRAIN_LINGER));
        drain(&mut client_read, linger).await;
    }

    RelayOutcome {
        bytes_to_backend: to_backend.into_inner(),
        bytes_from_backend: from_backend.into_inner(),
        reason,
    }
}

/// Time of the last byte moved in either direction.
struct Activity {
    origin: Instant,
    last_nanos: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_nanos: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let nanos = self.origin.elapsed().as_nanos() as u64;
        self.last_nanos.store(nanos, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed))
    }
}

/// Copy `reader` into `writer` until EOF, then shut `writer` down.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    last_activity: &Activity,
    total: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
        last_activity.touch();
    }
    writer.shutdown().await
}

/// Read and discard until EOF, an error, or `linger` elapses.
async fn drain<R>(reader: &mut R, linger: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut discarded = 0u64;
    let finished = timeout(linger, async {
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n as u64,
            }
        }
    })
    .await
    .is_ok();

    debug!(discarded, finished, "Drained client after backend close");
}

/// Resolve once nothing has moved for `idle_timeout`. Never resolves when
/// the timeout is disabled.
async fn idle_expiry(last_activity: &Activity, idle_timeout: Option<Duration>) {
    let Some(timeout) = idle_timeout else {
        return std::future::pending().await;
    };

    loop {
        tokio::time::sleep_until(last_activity.last() + timeout).await;
        if last_activity.last() + timeout <= Instant::now() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_both_directions_then_backend_close() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay = tokio::spawn(relay(client, backend, None));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_peer.write_all(b"pong!").await.unwrap();
        drop(backend_peer);

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong!");

        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::BackendClosed));
        assert_eq!(outcome.bytes_to_backend, 4);
        assert_eq!(outcome.bytes_from_backend, 5);
    }

    #[tokio::test]
    async fn test_client_input_after_backend_close_is_drained() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay = tokio::spawn(relay(client, backend, None));

        backend_peer.write_all(b"bye").await.unwrap();
        drop(backend_peer);

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"bye");

        // The client leg stays readable until the client finishes sending.
        client_peer.write_all(b"late upload").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::BackendClosed));
        assert_eq!(outcome.bytes_to_backend, 0);
        assert_eq!(outcome.bytes_from_backend, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_bounded_by_idle_timeout() {
        let (client, _client_peer) = duplex(64);
        let (backend, backend_peer) = duplex(64);
        drop(backend_peer);

        let started = Instant::now();
        let outcome = relay(client, backend, Some(Duration::from_secs(1))).await;
        assert!(matches!(outcome.reason, CloseReason::BackendClosed));
        assert!(started.elapsed() < DRAIN_LINGER);
    }

    #[tokio::test]
    async fn test_client_close_propagates_to_backend() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay = tokio::spawn(relay(client, backend, None));

        client_peer.write_all(b"request").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // Response after the client half-closed still reaches it.
        backend_peer.write_all(b"response").await.unwrap();
        drop(backend_peer);

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::ClientClosed));
        assert!(outcome.reason.is_clean());
    }

    #[tokio::test]
    async fn test_large_payload_with_small_buffers() {
        let (client, mut client_peer) = duplex(16);
        let (backend, mut backend_peer) = duplex(16);

        let relay = tokio::spawn(relay(client, backend, None));

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&payload).await.unwrap();
            client_peer.shutdown().await.unwrap();
            client_peer
        });

        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(backend_peer);
        let _client_peer = writer.await.unwrap();
        let outcome = relay.await.unwrap();
        assert_eq!(outcome.bytes_to_backend, expected.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_relay() {
        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);

        let outcome = relay(client, backend, Some(Duration::from_secs(30))).await;
        assert!(matches!(outcome.reason, CloseReason::IdleTimeout));
        assert!(!outcome.reason.is_clean());
    }
}
