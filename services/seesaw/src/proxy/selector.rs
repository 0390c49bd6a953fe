//! Round-robin destination selection over a sequential port pool.
//!
//! The rotation counter starts at zero and is bumped before each pick, so the
//! first session lands on `base_port + 1` and the base port is reached on the
//! `pool_size`-th session. Deployments that already rely on this ordering
//! keep seeing the same distribution.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Picks the next destination port for each new session.
#[derive(Debug)]
pub struct DestinationSelector {
    /// First port of the pool.
    base_port: u16,
    /// Number of ports in the pool (never zero).
    pool_size: u16,
    /// Rotation counter, incremented once per selection.
    counter: AtomicU64,
}

impl DestinationSelector {
    /// Create a selector over `base_port..base_port + pool_size`.
    ///
    /// `pool_size` must be non-zero; `ProxyConfig` rejects zero before a
    /// selector is ever built.
    pub fn new(base_port: u16, pool_size: u16) -> Self {
        debug_assert!(pool_size > 0, "pool size validated by ProxyConfig");
        Self {
            base_port,
            pool_size: pool_size.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Advance the rotation and return the chosen port.
    pub fn next_destination(&self) -> u16 {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let port = port_for(self.base_port, self.pool_size, count);
        trace!(count, port, "Destination selected");
        port
    }

    /// Number of selections made so far.
    pub fn rotations(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Number of ports in the pool.
    pub fn pool_size(&self) -> u16 {
        self.pool_size
    }
}

fn port_for(base_port: u16, pool_size: u16, count: u64) -> u16 {
    // offset < pool_size, and base + pool_size - 1 fits in u16.
    let offset = (count % u64::from(pool_size)) as u16;
    base_port + offset
}
