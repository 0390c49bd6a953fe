//! Backend connection establishment.
//!
//! The dial to the chosen destination runs concurrently with reads from the
//! client, so bytes sent while the backend is still connecting are queued in
//! arrival order and written to the backend ahead of anything relayed later.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::session::{Session, SessionError, SessionState};
use crate::config::ProxyConfig;

/// Opens backend connections for sessions.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    /// Host every destination port lives on.
    destination_ip: IpAddr,
    /// Dial timeout (None waits for the OS).
    connect_timeout: Option<Duration>,
    /// Pre-connect buffer bound.
    max_pending_bytes: usize,
}

impl BackendConnector {
    /// Create a connector from proxy configuration.
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            destination_ip: config.destination_ip,
            connect_timeout: config.connect_timeout,
            max_pending_bytes: config.max_pending_bytes,
        }
    }

    /// Address a destination port resolves to.
    pub fn destination_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.destination_ip, port)
    }

    /// Connect the session to its destination and forward everything the
    /// client has sent so far.
    ///
    /// The returned stream has already received the buffered client bytes.
    pub async fn connect(&self, session: &mut Session) -> Result<TcpStream, SessionError> {
        let port = session
            .destination()
            .ok_or_else(|| SessionError::Client(io::Error::other("no destination assigned")))?;
        let addr = self.destination_addr(port);

        session.transition(SessionState::BackendConnecting);
        debug!(backend_addr = %addr, "Connecting to backend");

        let dial = self.dial(addr);
        tokio::pin!(dial);

        let mut backend = loop {
            tokio::select! {
                result = &mut dial => break result?,
                result = session.buffer_client_bytes(self.max_pending_bytes) => result?,
            }
        };

        if let Err(e) = backend.set_nodelay(true) {
            debug!(backend_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let flushed = session
            .flush_pending(&mut backend)
            .await
            .map_err(SessionError::Relay)?;

        debug!(
            backend_addr = %addr,
            initial_bytes = flushed,
            client_eof = session.client_eof(),
            "Connected to backend"
        );

        Ok(backend)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, SessionError> {
        let Some(connect_timeout) = self.connect_timeout else {
            return TcpStream::connect(addr)
                .await
                .map_err(|source| SessionError::Dial { addr, source });
        };

        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result.map_err(|source| SessionError::Dial { addr, source }),
            Err(_) => Err(SessionError::DialTimeout {
                addr,
                timeout: connect_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpSocket};

    fn connector(max_pending_bytes: usize) -> BackendConnector {
        let mut config =
            ProxyConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1, 1).unwrap();
        config.max_pending_bytes = max_pending_bytes;
        BackendConnector::new(&config)
    }

    async fn session_with(first: &[u8]) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        client.write_all(first).await.unwrap();

        let mut session = Session::new(7, accepted, peer);
        assert!(session.await_first_chunk(None).await.unwrap());
        (session, client)
    }

    #[tokio::test]
    async fn test_initial_payload_sent_on_connect() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();

        let (mut session, _client) = session_with(b"GET / HTTP/1.0\r\n\r\n").await;
        session.assign_destination(port);

        let connector = connector(1024);
        let accept = tokio::spawn(async move { backend.accept().await.unwrap().0 });
        let _stream = connector.connect(&mut session).await.unwrap();

        let mut accepted = accept.await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.0\r\n\r\n");
        assert!(session.pending().is_empty());
        assert_eq!(session.state(), SessionState::BackendConnecting);
    }

    #[tokio::test]
    async fn test_refused_dial_is_session_error() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);

        let (mut session, _client) = session_with(b"x").await;
        session.assign_destination(port);

        let err = connector(1024).connect(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::Dial { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unanswered_dial_times_out_and_client_is_closed() {
        // A listener that never accepts stops answering SYNs once its
        // accept queue is full.
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let backlog = socket.listen(1).unwrap();
        let backlog_addr = backlog.local_addr().unwrap();
        let mut fillers = Vec::new();
        for _ in 0..8 {
            if let Ok(Ok(stream)) =
                timeout(Duration::from_millis(100), TcpStream::connect(backlog_addr)).await
            {
                fillers.push(stream);
            }
        }

        let (mut session, mut client) = session_with(b"x").await;
        session.assign_destination(backlog_addr.port());

        let mut connector = connector(1024);
        connector.connect_timeout = Some(Duration::from_millis(200));
        let err = connector.connect(&mut session).await.unwrap_err();
        assert!(
            matches!(err, SessionError::DialTimeout { addr, .. } if addr == backlog_addr),
            "got {err:?}"
        );

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_destination_addr_uses_destination_ip() {
        let connector = connector(16);
        assert_eq!(
            connector.destination_addr(9101),
            "127.0.0.1:9101".parse::<SocketAddr>().unwrap()
        );
    }
}
