//! Localhost port allocation for concurrently running daemons.
//!
//! Asking the kernel for an ephemeral port and immediately releasing it is racy
//! on its own: two daemons configured back to back can be handed the same
//! number. [`PortAllocator`] remembers every port it handed out until the port
//! is released, so daemons configured through one allocator never collide.

use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

const PORTS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::ports");

/// Maximum kernel round trips before giving up on finding a fresh port.
const MAX_ATTEMPTS: usize = 64;

static GLOBAL_ALLOCATOR: Lazy<PortAllocator> = Lazy::new(PortAllocator::new);

/// Errors raised while allocating ports.
#[derive(Debug, Clone, Error)]
pub enum PortAllocationError {
    /// Binding the probe socket failed.
    #[error("failed to bind an ephemeral localhost port: {source}")]
    Bind {
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Every port offered by the kernel was already reserved.
    #[error("no unreserved port found after {attempts} attempts")]
    Exhausted {
        /// Number of ports inspected.
        attempts: usize,
    },
}

/// Returns a random unused port on `127.0.0.1`.
///
/// The port is free at the time of the call but is not reserved; use
/// [`PortAllocator`] when several daemons are configured at once.
pub fn unused_localhost_port() -> Result<u16, PortAllocationError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|source| {
        PortAllocationError::Bind {
            source: Arc::new(source),
        }
    })?;
    let port = listener
        .local_addr()
        .map_err(|source| PortAllocationError::Bind {
            source: Arc::new(source),
        })?
        .port();
    drop(listener);
    Ok(port)
}

/// Hands out localhost ports that are unique until released.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Creates an allocator with no reservations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide allocator shared by every supervisor in the test run.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_ALLOCATOR
    }

    /// Reserves a port nobody else obtained from this allocator.
    ///
    /// # Errors
    ///
    /// Returns [`PortAllocationError::Exhausted`] when every attempt yields an
    /// already reserved port, or [`PortAllocationError::Bind`] when no port can
    /// be bound.
    pub fn allocate(&self) -> Result<u16, PortAllocationError> {
        for _ in 0..MAX_ATTEMPTS {
            let port = unused_localhost_port()?;
            let mut reserved = self
                .reserved
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if reserved.insert(port) {
                debug!(target: PORTS_TARGET, port, "reserved localhost port");
                return Ok(port);
            }
        }
        Err(PortAllocationError::Exhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Reserves `count` distinct ports.
    ///
    /// # Errors
    ///
    /// Fails with the first error from [`Self::allocate`]; ports reserved
    /// before the failure stay reserved.
    pub fn allocate_many(&self, count: usize) -> Result<Vec<u16>, PortAllocationError> {
        (0..count).map(|_| self.allocate()).collect()
    }

    /// Returns a port to the pool. Releasing an unknown port is a no-op.
    pub fn release(&self, port: u16) {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if reserved.remove(&port) {
            debug!(target: PORTS_TARGET, port, "released localhost port");
        }
    }

    /// Whether `port` is currently reserved.
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_port_can_be_bound() {
        let port = unused_localhost_port().expect("allocate port");
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("port should be free");
    }

    #[test]
    fn allocator_never_repeats_reserved_ports() {
        let allocator = PortAllocator::new();
        let ports = allocator.allocate_many(16).expect("allocate ports");
        let unique: BTreeSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
        assert!(ports.iter().all(|port| allocator.is_reserved(*port)));
    }

    #[test]
    fn released_ports_are_forgotten() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().expect("allocate port");
        allocator.release(port);
        assert!(!allocator.is_reserved(port));
        allocator.release(port);
    }
}
