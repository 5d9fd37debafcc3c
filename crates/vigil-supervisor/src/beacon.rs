//! Listener that lets embedded daemons satisfy port readiness.
//!
//! The beacon accepts connections on a background thread and closes each one
//! immediately, so a port probe succeeds exactly while the beacon is up.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::BeaconError;

const BEACON_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::beacon");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Background listener that closes every accepted connection.
#[derive(Debug)]
pub struct ReadinessBeacon {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReadinessBeacon {
    /// Binds `host:port` and starts accepting. Port `0` picks a free port.
    ///
    /// # Errors
    ///
    /// Returns a [`BeaconError`] when the address cannot be resolved or bound.
    pub fn bind(host: &str, port: u16) -> Result<Self, BeaconError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| BeaconError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| BeaconError::ResolveEmpty {
                host: host.to_owned(),
                port,
            })?;
        let listener = TcpListener::bind(addr).map_err(|source| BeaconError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| BeaconError::NonBlocking { source })?;
        let addr = listener.local_addr().unwrap_or(addr);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::spawn(move || run_accept_loop(&listener, &flag));
        info!(target: BEACON_TARGET, %addr, "readiness beacon listening");
        Ok(Self {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for ReadinessBeacon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: BEACON_TARGET, addr = %self.addr, "beacon thread panicked");
            }
        }
        debug!(target: BEACON_TARGET, addr = %self.addr, "readiness beacon stopped");
    }
}

fn run_accept_loop(listener: &TcpListener, shutdown: &AtomicBool) {
    let mut last_error = None::<io::ErrorKind>;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                last_error = None;
                drop(stream.shutdown(Shutdown::Both));
                debug!(target: BEACON_TARGET, %peer, "closed probe connection");
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) => {
                let kind = error.kind();
                if last_error != Some(kind) {
                    warn!(target: BEACON_TARGET, %error, "beacon accept error");
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PortProbe;

    #[test]
    fn probe_succeeds_only_while_beacon_is_up() {
        let beacon = ReadinessBeacon::bind("127.0.0.1", 0).expect("bind beacon");
        let port = beacon.port();
        let probe = PortProbe::new("127.0.0.1");
        assert!(probe.is_listening(port).expect("probe live beacon"));
        assert!(probe.is_listening(port).expect("probe live beacon again"));
        drop(beacon);
        thread::sleep(Duration::from_millis(50));
        assert!(!probe.is_listening(port).expect("probe stopped beacon"));
    }
}
