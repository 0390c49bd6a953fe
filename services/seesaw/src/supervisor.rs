//! Process supervisor.
//!
//! Binds the listener, prints the startup banner, runs the accept loop until
//! a termination signal arrives and prints the shutdown line. Bind failures
//! are returned to the caller; nothing here retries.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ProxyConfig;
use crate::proxy::{DestinationSelector, Listener, ListenerStats};

/// Owns one proxy instance from bind to shutdown.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: ProxyConfig,
}

/// A running listener.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    selector: Arc<DestinationSelector>,
    stats: Arc<ListenerStats>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<io::Result<()>>,
}

impl Supervisor {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Bind the listener and start accepting in a background task.
    pub async fn start(&self) -> io::Result<ProxyHandle> {
        let config = &self.config;
        let selector = Arc::new(DestinationSelector::new(
            config.destination_port,
            config.pool_size,
        ));

        let listener = Arc::new(Listener::bind(config, Arc::clone(&selector)).await?);
        let local_addr = listener.local_addr()?;
        let stats = listener.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

        info!(
            listen_addr = %local_addr,
            destination_ip = %config.destination_ip,
            destination_port = config.destination_port,
            pool_size = config.pool_size,
            "Seesawing: incoming {}; outgoing :{} x {}",
            local_addr,
            config.destination_port,
            config.pool_size
        );

        Ok(ProxyHandle {
            local_addr,
            selector,
            stats,
            shutdown_tx,
            task,
        })
    }

    /// Run until `signal` resolves or the listener fails.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listen_addr = self.config.listen_addr();
        let mut handle = self
            .start()
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;

        let result = tokio::select! {
            _ = signal => {
                info!("Received shutdown signal");
                Ok(())
            }
            joined = &mut handle.task => {
                let result = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("listener failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("listener task panicked")),
                };
                if let Err(e) = &result {
                    error!(error = %e, "Listener exited");
                }
                result
            }
        };

        let _ = handle.shutdown_tx.send(true);
        let stats = handle.stats();
        info!(
            sessions = stats.connections_accepted.load(Ordering::Relaxed),
            active = stats.connections_active.load(Ordering::Relaxed),
            backend_failed = stats.backend_failed.load(Ordering::Relaxed),
            "Gettin' off the Seesaw."
        );

        result
    }
}

impl ProxyHandle {
    /// Address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn selector(&self) -> &DestinationSelector {
        &self.selector
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn shutdown(self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task.await.map_err(io::Error::other)?
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn local_config() -> ProxyConfig {
        ProxyConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 9100, 3).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let handle = Supervisor::new(local_config()).start().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.selector().pool_size(), 3);
        assert_eq!(handle.selector().rotations(), 0);

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_on_signal() {
        let supervisor = Supervisor::new(local_config());
        let result = supervisor.run(async {}).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_fails_on_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listen_port = taken.local_addr().unwrap().port();

        let err = Supervisor::new(config)
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }
}
