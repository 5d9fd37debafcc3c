//! Owned handles to supervised processes.
//!
//! A daemon is either an external executable (a child process in its own
//! process group) or an embedded worker running on a dedicated thread of the
//! harness. [`ProcessHandle`] presents both through one interface: liveness,
//! signal delivery, bounded join and idempotent termination.
//!
//! - [`external`] spawns and reaps child processes.
//! - [`embedded`] runs in-process workers with cooperative shutdown.
//! - [`signals`] re-delivers SIGINT/SIGTERM received by the harness to a child.

mod embedded;
mod external;
mod signals;

use std::fmt;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::SupervisorError;

pub use embedded::{EmbeddedWorker, WorkerContext};
pub use external::{DaemonCommand, ExternalProcess};
pub use signals::SignalRelay;

const PROCESS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::process");

/// Interval used when polling for process exit.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited with a status code.
    Exited(i32),
    /// The process was killed by a signal.
    Signalled(i32),
    /// An embedded worker returned.
    Returned,
    /// An embedded worker panicked.
    Panicked,
}

impl ProcessExit {
    /// Whether the exit counts as clean.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0) | Self::Returned)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signalled(signal) => write!(f, "killed by signal {signal}"),
            Self::Returned => f.write_str("worker returned"),
            Self::Panicked => f.write_str("worker panicked"),
        }
    }
}

/// Exclusive handle to one supervised process.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Child process spawned from an executable.
    External(ExternalProcess),
    /// Worker running inside the harness process.
    Embedded(EmbeddedWorker),
}

impl ProcessHandle {
    /// OS process id, for external processes.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::External(process) => Some(process.pid()),
            Self::Embedded(_) => None,
        }
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Self::External(process) => process.is_alive(),
            Self::Embedded(worker) => worker.is_alive(),
        }
    }

    /// Exit state once the process has been reaped.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        match self {
            Self::External(process) => process.reap(),
            Self::Embedded(worker) => worker.reap(),
        }
    }

    /// Delivers `signal` to an external process group, or requests a
    /// cooperative shutdown of an embedded worker.
    ///
    /// Signalling a process that already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Signal`] when the kernel rejects the signal.
    pub fn send_signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        match self {
            Self::External(process) => process.send_signal(signal),
            Self::Embedded(worker) => {
                worker.request_shutdown(signal);
                Ok(())
            }
        }
    }

    /// Waits for the process to exit. `None` waits indefinitely.
    ///
    /// Returns `true` when the process has exited.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        match self {
            Self::External(process) => process.join(timeout),
            Self::Embedded(worker) => worker.join(timeout),
        }
    }

    /// Forcefully stops the process. Safe to call repeatedly and after exit.
    pub fn terminate(&self) {
        match self {
            Self::External(process) => process.terminate(),
            Self::Embedded(worker) => worker.terminate(),
        }
    }
}

impl From<ExternalProcess> for ProcessHandle {
    fn from(process: ExternalProcess) -> Self {
        Self::External(process)
    }
}

impl From<EmbeddedWorker> for ProcessHandle {
    fn from(worker: EmbeddedWorker) -> Self {
        Self::Embedded(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::clean_exit(ProcessExit::Exited(0), true, "exited with status 0")]
    #[case::failed_exit(ProcessExit::Exited(2), false, "exited with status 2")]
    #[case::signalled(ProcessExit::Signalled(15), false, "killed by signal 15")]
    #[case::returned(ProcessExit::Returned, true, "worker returned")]
    #[case::panicked(ProcessExit::Panicked, false, "worker panicked")]
    fn exit_states_describe_themselves(
        #[case] exit: ProcessExit,
        #[case] success: bool,
        #[case] message: &str,
    ) {
        assert_eq!(exit.success(), success);
        assert_eq!(exit.to_string(), message);
    }

    #[test]
    fn targets_match_crate_filter_directives() {
        let directive: tracing_subscriber::filter::Targets = "vigil_supervisor=debug"
            .parse()
            .expect("valid directive");
        assert_eq!(PROCESS_TARGET, "vigil_supervisor::process");
        assert!(directive.would_enable(PROCESS_TARGET, &tracing::Level::DEBUG));
    }
}
