use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{ReadinessState, ReadinessStrategy};
use crate::probe::PortProbe;

const READINESS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::readiness");

/// Pause between port sweeps.
pub const PORT_POLL_INTERVAL: Duration = Duration::from_millis(125);

/// Ready once every expected port has accepted a connection.
///
/// A port leaves the pending set the first time it accepts a connection and is
/// not probed again, so once ready the strategy stays ready.
#[derive(Debug, Clone)]
pub struct PortsReady {
    probe: PortProbe,
    expected: BTreeSet<u16>,
    pending: BTreeSet<u16>,
}

impl PortsReady {
    /// Waits for `ports` on `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self::with_probe(PortProbe::new(host), ports)
    }

    /// Uses a preconfigured probe.
    #[must_use]
    pub fn with_probe(probe: PortProbe, ports: impl IntoIterator<Item = u16>) -> Self {
        let expected: BTreeSet<u16> = ports.into_iter().collect();
        Self {
            probe,
            pending: expected.clone(),
            expected,
        }
    }

    /// Ports that have not accepted a connection yet.
    #[must_use]
    pub const fn pending(&self) -> &BTreeSet<u16> {
        &self.pending
    }
}

impl ReadinessStrategy for PortsReady {
    fn check(&mut self, budget: Duration) -> ReadinessState {
        let deadline = Instant::now() + budget;
        let candidates: Vec<u16> = self.pending.iter().copied().collect();
        for port in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.probe.is_listening_within(port, remaining) {
                Ok(true) => {
                    self.pending.remove(&port);
                    debug!(
                        target: READINESS_TARGET,
                        host = self.probe.host(),
                        port,
                        remaining = self.pending.len(),
                        "port is listening"
                    );
                }
                Ok(false) => {}
                Err(error) => {
                    debug!(target: READINESS_TARGET, port, %error, "port probe failed");
                }
            }
        }
        if self.pending.is_empty() {
            ReadinessState::Ready
        } else {
            ReadinessState::Pending
        }
    }

    fn poll_interval(&self) -> Duration {
        PORT_POLL_INTERVAL
    }

    fn describe(&self) -> String {
        let ports: Vec<String> = self.expected.iter().map(u16::to_string).collect();
        format!("ports {} on {}", ports.join(","), self.probe.host())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        (listener, port)
    }

    fn closed_port() -> u16 {
        let (listener, port) = listener();
        drop(listener);
        port
    }

    #[test]
    fn empty_port_set_is_ready() {
        let mut strategy = PortsReady::new("127.0.0.1", []);
        assert_eq!(strategy.check(Duration::from_secs(1)), ReadinessState::Ready);
    }

    #[test]
    fn never_ready_while_a_port_refuses() {
        let (_open, open_port) = listener();
        let closed = closed_port();
        let mut strategy = PortsReady::new("127.0.0.1", [open_port, closed]);
        assert_eq!(strategy.check(Duration::from_secs(1)), ReadinessState::Pending);
        assert_eq!(strategy.pending(), &BTreeSet::from([closed]));
        assert_eq!(strategy.check(Duration::from_secs(1)), ReadinessState::Pending);
    }

    #[test]
    fn ready_is_idempotent() {
        let (first, first_port) = listener();
        let (second, second_port) = listener();
        let mut strategy = PortsReady::new("127.0.0.1", [first_port, second_port]);
        assert_eq!(strategy.check(Duration::from_secs(1)), ReadinessState::Ready);
        drop(first);
        drop(second);
        assert_eq!(strategy.check(Duration::from_secs(1)), ReadinessState::Ready);
    }

    #[test]
    fn description_lists_expected_ports() {
        let strategy = PortsReady::new("127.0.0.1", [4506, 4505]);
        assert_eq!(strategy.describe(), "ports 4505,4506 on 127.0.0.1");
        assert_eq!(strategy.poll_interval(), Duration::from_millis(125));
    }
}
