pub mod config;
pub mod proxy;
pub mod supervisor;

pub use config::{Cli, ConfigError, ProxyConfig};
pub use proxy::{
    BackendConnector, CloseReason, DestinationSelector, Listener, ListenerStats, RelayOutcome,
    Session, SessionError, SessionState,
};
pub use supervisor::{ProxyHandle, Supervisor};
