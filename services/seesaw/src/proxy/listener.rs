//! TCP listener and session handling.
//!
//! Accepts client connections, waits for the first bytes from each one,
//! picks a destination port, connects to it and relays until either leg
//! closes. Backend selection is data-triggered: a client that connects and
//! leaves without sending anything never consumes a rotation slot.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::connector::BackendConnector;
use super::relay::CloseReason;
use super::selector::DestinationSelector;
use super::session::{Session, SessionError};
use crate::config::ProxyConfig;

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently open.
    pub connections_active: AtomicU64,
    /// Sessions fully torn down.
    pub connections_closed: AtomicU64,
    /// Connections refused because the session cap was reached.
    pub connections_rejected: AtomicU64,
    /// Sessions whose client left before sending data.
    pub closed_before_data: AtomicU64,
    /// Backend connections established.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// Accepts client connections and runs one session per connection.
pub struct Listener {
    listener: TcpListener,
    selector: Arc<DestinationSelector>,
    connector: BackendConnector,
    idle_timeout: Option<Duration>,
    conn_semaphore: Arc<Semaphore>,
    max_connections: usize,
    next_session_id: AtomicU64,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the configured listen address.
    pub async fn bind(config: &ProxyConfig, selector: Arc<DestinationSelector>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            selector,
            connector: BackendConnector::new(config),
            idle_timeout: config.idle_timeout,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            next_session_id: AtomicU64::new(1),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(bind_addr = %local_addr, "Listener stopping");
                        return Ok(());
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                max_connections = self.max_connections,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            let session = Session::new(session_id, stream, peer_addr);
                            if let Err(e) = listener.handle_session(session).await {
                                debug!(error = %e, "Session error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "session",
                            id = session_id,
                            peer = %peer_addr
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Back off on persistent errors (e.g. fd exhaustion)
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Drive one session from first byte to teardown.
    async fn handle_session(&self, mut session: Session) -> Result<(), SessionError> {
        let client_port = session.client_addr().port();

        let has_data = match session.await_first_chunk(self.idle_timeout).await {
            Ok(has_data) => has_data,
            Err(e) => {
                teardown(&mut session, client_port).await;
                return Err(e);
            }
        };
        if !has_data {
            self.stats.closed_before_data.fetch_add(1, Ordering::Relaxed);
            debug!(client_eof = session.client_eof(), "Client sent no data");
            teardown(&mut session, client_port).await;
            return Ok(());
        }

        let port = self.selector.next_destination();
        session.assign_destination(port);
        info!(destination_port = port, "...bind to :{}", port);

        let backend = match self.connector.connect(&mut session).await {
            Ok(backend) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                backend
            }
            Err(e) => {
                if matches!(e, SessionError::Dial { .. } | SessionError::DialTimeout { .. }) {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(destination_port = port, error = %e, "Backend connection failed");
                } else {
                    debug!(destination_port = port, error = %e, "Session ended while connecting");
                }
                teardown(&mut session, client_port).await;
                return Err(e);
            }
        };

        let forwarded = session.forwarded();
        let outcome = session.relay(backend, self.idle_timeout).await;
        session.close().await;
        let bytes_to_backend = forwarded + outcome.bytes_to_backend;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(outcome.bytes_from_backend, Ordering::Relaxed);

        if outcome.reason.is_clean() {
            debug!(reason = ?outcome.reason, "Relay finished");
        } else if let CloseReason::Error(e) = &outcome.reason {
            debug!(error = %e, "Relay ended with error");
        } else {
            debug!("Relay idle timeout");
        }

        info!(
            client_port,
            destination_port = port,
            bytes_to_backend,
            bytes_from_backend = outcome.bytes_from_backend,
            "...unbind from :{}",
            client_port
        );

        Ok(())
    }
}

/// Close a session that never reached the relay and log its teardown.
async fn teardown(session: &mut Session, client_port: u16) {
    session.close().await;
    info!(client_port, "...unbind from :{}", client_port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config(dport: u16, pool_size: u16) -> ProxyConfig {
        ProxyConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, dport, pool_size).unwrap()
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = local_config(9100, 3);
        let selector = Arc::new(DestinationSelector::new(9100, 3));
        let listener = Listener::bind(&config, selector).await.unwrap();

        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.stats().connections_accepted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = local_config(9100, 1);
        config.listen_port = port;
        let selector = Arc::new(DestinationSelector::new(9100, 1));
        assert!(Listener::bind(&config, selector).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = local_config(9100, 1);
        let selector = Arc::new(DestinationSelector::new(9100, 1));
        let listener = Arc::new(Listener::bind(&config, selector).await.unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&listener).run(rx));
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
