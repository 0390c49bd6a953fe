//! Per-connection session state.
//!
//! A [`Session`] owns the client leg from accept until teardown. The backend
//! leg is handed to [`Session::relay`], which drops it when relaying ends.
//! Every teardown path finishes with [`Session::close`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::relay::{self, RelayOutcome};

/// Read buffer size for client and backend legs.
pub const READ_CHUNK: usize = 8192;

/// Lifecycle of one proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, nothing read yet.
    Accepted,
    /// Waiting for the first client bytes.
    AwaitingData,
    /// Destination port assigned.
    DestinationChosen,
    /// Backend dial in flight; client bytes are buffered.
    BackendConnecting,
    /// Bytes flow in both directions.
    Relaying,
    /// Legs are being shut down.
    Closing,
    /// Both legs closed.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AwaitingData => "awaiting_data",
            Self::DestinationChosen => "destination_chosen",
            Self::BackendConnecting => "backend_connecting",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors local to a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend {addr} refused or unreachable: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("backend {addr} did not accept within {timeout:?}")]
    DialTimeout { addr: SocketAddr, timeout: Duration },

    #[error("client leg failed: {0}")]
    Client(#[source] io::Error),

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
}

/// One accepted client connection and everything buffered for it.
#[derive(Debug)]
pub struct Session {
    id: u64,
    client: TcpStream,
    client_addr: SocketAddr,
    state: SessionState,
    destination: Option<u16>,
    pending: Vec<u8>,
    forwarded: u64,
    client_eof: bool,
}

impl Session {
    /// Wrap a freshly accepted client socket.
    pub fn new(id: u64, client: TcpStream, client_addr: SocketAddr) -> Self {
        Self {
            id,
            client,
            client_addr,
            state: SessionState::Accepted,
            destination: None,
            pending: Vec::new(),
            forwarded: 0,
            client_eof: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Destination port, once chosen.
    pub fn destination(&self) -> Option<u16> {
        self.destination
    }

    /// Client bytes not yet forwarded to the backend.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Client bytes already written to the backend before relaying began.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Whether the client has closed its sending side.
    pub fn client_eof(&self) -> bool {
        self.client_eof
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    /// Wait for the first chunk of client data.
    ///
    /// Returns `false` if the client closed without sending anything, or sent
    /// nothing within `idle_timeout`.
    pub async fn await_first_chunk(
        &mut self,
        idle_timeout: Option<Duration>,
    ) -> Result<bool, SessionError> {
        self.transition(SessionState::AwaitingData);

        let mut buf = vec![0u8; READ_CHUNK];
        let read = self.client.read(&mut buf);
        let n = match idle_timeout {
            Some(limit) => match timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout = ?limit, "No client data before idle timeout");
                    return Ok(false);
                }
            },
            None => read.await,
        }
        .map_err(SessionError::Client)?;
        if n == 0 {
            self.client_eof = true;
            return Ok(false);
        }

        self.pending.extend_from_slice(&buf[..n]);
        Ok(true)
    }

    /// Record the destination chosen for this session. Set once.
    pub fn assign_destination(&mut self, port: u16) {
        debug_assert!(self.destination.is_none(), "destination assigned twice");
        self.destination = Some(port);
        self.transition(SessionState::DestinationChosen);
    }

    /// Read more client bytes into the pending buffer, up to `limit` total.
    ///
    /// Used while the backend dial is in flight. Reads nothing once the
    /// client has closed or the buffer is full.
    pub(crate) async fn buffer_client_bytes(&mut self, limit: usize) -> Result<(), SessionError> {
        let room = limit.saturating_sub(self.pending.len()).min(READ_CHUNK);
        if self.client_eof || room == 0 {
            return std::future::pending().await;
        }

        let mut buf = vec![0u8; room];
        let n = self
            .client
            .read(&mut buf)
            .await
            .map_err(SessionError::Client)?;
        if n == 0 {
            debug!("Client closed while backend connecting");
            self.client_eof = true;
        } else {
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(())
    }

    /// Forward buffered client bytes to a freshly connected backend.
    pub(crate) async fn flush_pending(&mut self, backend: &mut TcpStream) -> io::Result<usize> {
        let n = self.pending.len();
        if n > 0 {
            backend.write_all(&self.pending).await?;
            self.pending.clear();
            self.forwarded += n as u64;
        }
        Ok(n)
    }

    /// Relay between the client and `backend` until either side ends.
    ///
    /// The backend leg is dropped on return; the client leg is left for
    /// [`Session::close`].
    pub async fn relay(&mut self, backend: TcpStream, idle_timeout: Option<Duration>) -> RelayOutcome {
        self.transition(SessionState::Relaying);
        let outcome = relay::relay(&mut self.client, backend, idle_timeout).await;
        debug!(reason = ?outcome.reason, "Relay ended");
        outcome
    }

    /// Close the client leg after flushing anything already written.
    pub async fn close(&mut self) {
        self.transition(SessionState::Closing);
        if let Err(e) = self.client.shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        self.transition(SessionState::Closed);
    }
}
