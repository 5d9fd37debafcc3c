//! Readiness strategies.
//!
//! A strategy answers one question, repeatedly: has the daemon finished
//! starting? Each check reports a [`ReadinessState`] and must be safe to run
//! again; the supervisor owns the polling loop and the overall deadline.

mod ping;
mod ports;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use vigil_config::DaemonConfig;

use crate::executor::CommandExecutor;
use crate::helper::HelperCommand;

pub use ping::{DEFAULT_PING_INTERVAL, PingReady};
pub use ports::{PORT_POLL_INTERVAL, PortsReady};

/// Result of a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// Not ready yet; check again later.
    Pending,
    /// The daemon is ready.
    Ready,
    /// The daemon can never become ready.
    Failed {
        /// Why the check gave up.
        reason: String,
    },
}

/// A repeatable readiness check.
pub trait ReadinessStrategy: Send {
    /// Runs one check, taking no longer than `budget` where possible.
    fn check(&mut self, budget: Duration) -> ReadinessState;

    /// Pause the supervisor should take between pending checks.
    fn poll_interval(&self) -> Duration;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

impl<S: ReadinessStrategy + ?Sized> ReadinessStrategy for Box<S> {
    fn check(&mut self, budget: Duration) -> ReadinessState {
        (**self).check(budget)
    }

    fn poll_interval(&self) -> Duration {
        (**self).poll_interval()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Configuration-level choice of readiness strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSpec {
    /// Wait until every port accepts connections.
    Ports {
        /// Host to probe.
        host: String,
        /// Ports that must all be listening.
        ports: BTreeSet<u16>,
    },
    /// Wait until a helper command exits successfully.
    Ping {
        /// Helper invocation, with its own sub-timeout.
        command: HelperCommand,
    },
}

impl ReadinessSpec {
    /// Probes every port named in the daemon configuration.
    #[must_use]
    pub fn ports_of(config: &DaemonConfig) -> Self {
        Self::Ports {
            host: config.host().to_owned(),
            ports: config.port_numbers().collect(),
        }
    }

    /// Builds the strategy. Ping checks run on `executor`.
    #[must_use]
    pub fn into_strategy(self, executor: &Arc<CommandExecutor>) -> Box<dyn ReadinessStrategy> {
        match self {
            Self::Ports { host, ports } => Box::new(PortsReady::new(host, ports)),
            Self::Ping { command } => Box::new(PingReady::new(Arc::clone(executor), command)),
        }
    }
}
