//! Seesaw configuration.
//!
//! Flags follow the historical seesaw surface (`-i`, `-p`, `-d`, `-n`); each
//! one can also come from a `SEESAW_*` environment variable. Parsed flags are
//! validated into an immutable [`ProxyConfig`] before anything binds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// Default listen address (all interfaces).
pub const DEFAULT_LISTEN_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default backend connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Default relay idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default maximum concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default bound on client bytes buffered while the backend dial is in flight.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("-p/--port is required")]
    MissingListenPort,

    #[error("-d/--dport is required")]
    MissingDestinationPort,

    #[error("-n/--number is required (destination pool size)")]
    MissingPoolSize,

    #[error("-n/--number must be at least 1, got {0}")]
    InvalidPoolSize(u16),

    #[error("destination pool {base}..{base}+{size} exceeds the highest port 65535")]
    PoolOutOfRange { base: u16, size: u16 },

    #[error("max connections must be at least 1")]
    InvalidMaxConnections,
}

/// Seesaw, a simple shell-friendly reverse proxy / load balancer.
///
/// Accepts TCP connections and forwards each one to the next port of a
/// sequential destination pool.
#[derive(Debug, Clone, Parser)]
#[command(name = "seesaw")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Network address on which to listen. Defaults to 0.0.0.0.
    #[arg(short = 'i', long = "ip", value_name = "ADDRESS", env = "SEESAW_IP")]
    pub ip: Option<IpAddr>,

    /// Network port on which to listen.
    #[arg(short = 'p', long = "port", value_name = "NUMBER", env = "SEESAW_PORT")]
    pub port: Option<u16>,

    /// Destination network port; first in the sequential pool.
    #[arg(short = 'd', long = "dport", value_name = "NUMBER", env = "SEESAW_DPORT")]
    pub dport: Option<u16>,

    /// Number of destination network ports.
    #[arg(short = 'n', long = "number", value_name = "NUMBER", env = "SEESAW_NUMBER")]
    pub number: Option<u16>,

    /// Destination host. Defaults to the listen address.
    #[arg(long = "dest-ip", value_name = "ADDRESS", env = "SEESAW_DEST_IP")]
    pub dest_ip: Option<IpAddr>,

    /// Backend connect timeout in milliseconds (0 disables).
    #[arg(long, value_name = "MS", env = "SEESAW_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Relay idle timeout in seconds (0 disables).
    #[arg(long, value_name = "SECS", env = "SEESAW_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// Maximum concurrent sessions.
    #[arg(long, value_name = "N", env = "SEESAW_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Client bytes buffered while the backend connection is being established.
    #[arg(long, value_name = "BYTES", env = "SEESAW_MAX_PENDING_BYTES", default_value_t = DEFAULT_MAX_PENDING_BYTES)]
    pub max_pending_bytes: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, value_name = "LEVEL", env = "SEESAW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SEESAW_LOG_JSON")]
    pub log_json: bool,
}

/// Validated configuration for one running proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the listener binds.
    pub listen_ip: IpAddr,
    /// Port the listener binds.
    pub listen_port: u16,
    /// Host every destination port lives on.
    pub destination_ip: IpAddr,
    /// First port of the destination pool.
    pub destination_port: u16,
    /// Number of sequential destination ports.
    pub pool_size: u16,
    /// Backend dial timeout.
    pub connect_timeout: Option<Duration>,
    /// Relay idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Concurrent session cap.
    pub max_connections: usize,
    /// Pre-connect buffer bound.
    pub max_pending_bytes: usize,
}

impl ProxyConfig {
    /// Validate parsed flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let listen_ip = cli.ip.unwrap_or(DEFAULT_LISTEN_IP);
        let listen_port = cli.port.ok_or(ConfigError::MissingListenPort)?;
        let destination_port = cli.dport.ok_or(ConfigError::MissingDestinationPort)?;
        let pool_size = cli.number.ok_or(ConfigError::MissingPoolSize)?;

        let mut config = Self::new(listen_ip, listen_port, destination_port, pool_size)?;
        config.destination_ip = cli.dest_ip.unwrap_or(listen_ip);
        config.connect_timeout = non_zero(cli.connect_timeout_ms).map(Duration::from_millis);
        config.idle_timeout = non_zero(cli.idle_timeout_secs).map(Duration::from_secs);

        if cli.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        config.max_connections = cli.max_connections;
        config.max_pending_bytes = cli.max_pending_bytes;

        Ok(config)
    }

    /// Create a configuration with default tunables.
    pub fn new(
        listen_ip: IpAddr,
        listen_port: u16,
        destination_port: u16,
        pool_size: u16,
    ) -> Result<Self, ConfigError> {
        if pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(pool_size));
        }
        if u32::from(destination_port) + u32::from(pool_size) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::PoolOutOfRange {
                base: destination_port,
                size: pool_size,
            });
        }

        Ok(Self {
            listen_ip,
            listen_port,
            destination_ip: listen_ip,
            destination_port,
            pool_size,
            connect_timeout: Some(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)),
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        })
    }

    /// Socket address the listener binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Socket address of one destination port.
    pub fn destination_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.destination_ip, port)
    }

    /// Every port in the destination pool.
    pub fn destination_ports(&self) -> RangeInclusive<u16> {
        // Bounds checked in `new`.
        self.destination_port..=self.destination_port + (self.pool_size - 1)
    }
}

fn non_zero(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}
