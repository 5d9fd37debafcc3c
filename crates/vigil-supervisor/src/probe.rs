//! TCP port probing.
//!
//! A probe opens a connection, immediately shuts it down and drops it. The
//! socket is closed on every path, including connect failures.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::SupervisorError;

const PROBE_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::probe");

/// Upper bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Checks whether TCP ports on one host accept connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbe {
    host: String,
    connect_timeout: Duration,
}

impl PortProbe {
    /// Creates a probe for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the per-connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Host being probed.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns whether `port` currently accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Probe`] when the host cannot be resolved or
    /// the connect fails for a reason other than nothing listening.
    pub fn is_listening(&self, port: u16) -> Result<bool, SupervisorError> {
        self.is_listening_within(port, self.connect_timeout)
    }

    /// Like [`Self::is_listening`] but never waits longer than `budget`.
    ///
    /// # Errors
    ///
    /// See [`Self::is_listening`].
    pub fn is_listening_within(&self, port: u16, budget: Duration) -> Result<bool, SupervisorError> {
        let timeout = self.connect_timeout.min(budget).max(Duration::from_millis(1));
        match self.try_connect(port, timeout) {
            Ok(()) => {
                trace!(target: PROBE_TARGET, host = %self.host, port, "port accepted connection");
                Ok(true)
            }
            Err(error) if is_not_listening(&error) => Ok(false),
            Err(source) => Err(SupervisorError::Probe {
                host: self.host.clone(),
                port,
                source: Arc::new(source),
            }),
        }
    }

    fn try_connect(&self, port: u16, timeout: Duration) -> io::Result<()> {
        let address = resolve(&self.host, port)?;
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        // The peer may already have closed its end.
        drop(stream.shutdown(Shutdown::Both));
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved address"))
}

/// Errors meaning "nothing is listening yet".
///
/// A connect timeout is included because a daemon that has not finished
/// binding can leave a connect hanging instead of refusing it.
fn is_not_listening(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn probe_tracks_listener_lifetime() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let probe = PortProbe::new("127.0.0.1");
        assert!(probe.is_listening(port).expect("probe listening port"));
        drop(listener);
        thread::sleep(Duration::from_millis(50));
        assert!(!probe.is_listening(port).expect("probe closed port"));
    }

    #[test]
    fn budget_caps_connect_timeout() {
        let probe = PortProbe::new("127.0.0.1").with_connect_timeout(Duration::from_secs(5));
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        assert!(
            probe
                .is_listening_within(port, Duration::from_millis(50))
                .expect("probe with short budget")
        );
    }

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused)]
    #[case::not_found(io::ErrorKind::NotFound)]
    #[case::addr_not_available(io::ErrorKind::AddrNotAvailable)]
    #[case::timed_out(io::ErrorKind::TimedOut)]
    fn not_listening_errors(#[case] kind: io::ErrorKind) {
        assert!(is_not_listening(&io::Error::new(kind, "probe")));
    }

    #[rstest]
    #[case::permission_denied(io::ErrorKind::PermissionDenied)]
    #[case::connection_reset(io::ErrorKind::ConnectionReset)]
    #[case::other(io::ErrorKind::Other)]
    fn unexpected_errors_propagate(#[case] kind: io::ErrorKind) {
        assert!(!is_not_listening(&io::Error::new(kind, "probe")));
    }
}
