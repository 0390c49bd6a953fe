//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - TCP listener and per-connection sessions
//! - Round-robin destination selection over a sequential port pool
//! - Backend connection with pre-connect buffering
//! - Bidirectional relay with coordinated teardown
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> (first bytes) -> DestinationSelector -> BackendConnector -> Backend
//!              |                                                      |
//!              +------------------------ relay ----------------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use seesaw::proxy::{DestinationSelector, Listener};
//!
//! let selector = Arc::new(DestinationSelector::new(config.destination_port, config.pool_size));
//! let listener = Arc::new(Listener::bind(&config, selector).await?);
//! listener.run(shutdown_rx).await?;
//! ```

mod connector;
mod listener;
mod relay;
mod selector;
mod session;

pub use connector::BackendConnector;
pub use listener::{Listener, ListenerStats};
pub use relay::{relay, CloseReason, RelayOutcome, DRAIN_LINGER};
pub use selector::DestinationSelector;
pub use session::{Session, SessionError, SessionState, READ_CHUNK};
