//! Error types surfaced by the supervisor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::supervisor::SupervisorState;

/// Errors raised while driving a daemon through its lifecycle.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The daemon process or worker could not be created at all.
    #[error("failed to spawn daemon '{daemon}' from '{program}': {source}")]
    Spawn {
        /// Daemon name.
        daemon: String,
        /// Program or worker name that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The readiness check never succeeded within the budget.
    #[error("daemon '{daemon}' did not become ready within {} ms", timeout.as_millis())]
    ReadinessTimeout {
        /// Daemon name.
        daemon: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// The daemon failed permanently before becoming ready.
    #[error("daemon '{daemon}' is not running: {cause}")]
    DaemonNotRunning {
        /// Daemon name.
        daemon: String,
        /// Human readable cause, such as the exit status.
        cause: String,
    },
    /// An operation was requested in a state that does not allow it.
    #[error("cannot {operation} daemon '{daemon}' while it is {state}")]
    InvalidTransition {
        /// Daemon name.
        daemon: String,
        /// Operation that was attempted.
        operation: &'static str,
        /// State the supervisor was in.
        state: SupervisorState,
    },
    /// Delivering a signal to the daemon failed.
    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    Signal {
        /// Target process or process group.
        pid: u32,
        /// Signal that was sent.
        signal: Signal,
        /// Errno reported by the kernel.
        #[source]
        source: Errno,
    },
    /// A readiness probe failed in a way that is not "nothing listening".
    #[error("failed to probe {host}:{port}: {source}")]
    Probe {
        /// Probed host.
        host: String,
        /// Probed port.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Every launch attempt failed to produce a ready daemon.
    #[error("daemon '{daemon}' failed to start after {attempts} attempts: {last}")]
    LaunchExhausted {
        /// Daemon name.
        daemon: String,
        /// Number of attempts made.
        attempts: u32,
        /// Failure reported by the final attempt.
        #[source]
        last: Box<SupervisorError>,
    },
}

impl SupervisorError {
    /// Whether the error means "the daemon did not come up" rather than a
    /// harness fault. Dependent tests should be skipped, not failed, on these.
    #[must_use]
    pub const fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout { .. }
                | Self::DaemonNotRunning { .. }
                | Self::LaunchExhausted { .. }
        )
    }
}

/// Errors raised while building the helper command pool.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// The thread pool could not be created.
    #[error("failed to build helper pool with {workers} workers: {message}")]
    PoolBuild {
        /// Requested worker count.
        workers: usize,
        /// Message reported by the pool builder.
        message: String,
    },
}

/// Errors raised while binding a readiness beacon.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Address resolution failed.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// Host to bind.
        host: String,
        /// Port to bind.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Address resolution produced no candidates.
    #[error("no addresses resolved for {host}:{port}")]
    ResolveEmpty {
        /// Host to bind.
        host: String,
        /// Port to bind.
        port: u16,
    },
    /// Binding the listener failed.
    #[error("failed to bind readiness beacon at {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Switching the listener to non-blocking mode failed.
    #[error("failed to enable non-blocking beacon listener: {source}")]
    NonBlocking {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn timeout() -> SupervisorError {
        SupervisorError::ReadinessTimeout {
            daemon: "master".to_owned(),
            timeout: Duration::from_millis(1500),
        }
    }

    fn not_running() -> SupervisorError {
        SupervisorError::DaemonNotRunning {
            daemon: "minion".to_owned(),
            cause: "exited with status 1".to_owned(),
        }
    }

    fn spawn() -> SupervisorError {
        SupervisorError::Spawn {
            daemon: "syndic".to_owned(),
            program: "/missing/salt-syndic".to_owned(),
            source: Arc::new(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    #[rstest]
    #[case::timeout(timeout(), true)]
    #[case::not_running(not_running(), true)]
    #[case::spawn(spawn(), false)]
    fn startup_failures_are_classified(#[case] error: SupervisorError, #[case] expected: bool) {
        assert_eq!(error.is_startup_failure(), expected);
    }

    #[test]
    fn timeout_message_is_descriptive() {
        assert_eq!(
            timeout().to_string(),
            "daemon 'master' did not become ready within 1500 ms"
        );
    }

    #[test]
    fn exhausted_launch_names_attempts_and_cause() {
        let error = SupervisorError::LaunchExhausted {
            daemon: "minion".to_owned(),
            attempts: 3,
            last: Box::new(not_running()),
        };
        let message = error.to_string();
        assert!(message.contains("after 3 attempts"), "{message}");
        assert!(message.contains("exited with status 1"), "{message}");
        assert!(error.is_startup_failure());
    }
}
