//! Lifecycle supervision for daemons started by integration tests.
//!
//! A [`DaemonSupervisor`] launches one daemon, either an external executable
//! or an in-process worker, polls a [`ReadinessStrategy`] until the daemon is
//! usable, and guarantees teardown on every exit path. The handle to a daemon
//! is only lent out once readiness has been confirmed, through
//! [`DaemonSupervisor::run_scoped`] or the [`RunningDaemon`] guard returned by
//! [`launch_daemon`].
//!
//! Readiness comes in two flavours:
//!
//! - [`readiness::PortsReady`] waits until every configured TCP port accepts
//!   connections. Ports that answered once are not probed again.
//! - [`readiness::PingReady`] runs a helper command (usually a client's
//!   `test.ping`) on the bounded [`CommandExecutor`] until it exits with 0.
//!
//! All waits are bounded. A daemon that dies during startup is reported
//! within one poll interval rather than after the full startup timeout.

mod beacon;
mod error;
mod executor;
mod helper;
mod launch;
mod probe;
pub mod process;
pub mod readiness;
mod supervisor;
pub mod telemetry;

pub use beacon::ReadinessBeacon;
pub use error::{BeaconError, ExecutorError, SupervisorError};
pub use executor::{CommandExecutor, JobHandle};
pub use helper::{
    HelperCommand, HelperOutcome, HelperRunner, ProcessHelperRunner, ShellResult,
};
pub use launch::{DEFAULT_START_ATTEMPTS, RunningDaemon, StartPolicy, launch_daemon};
pub use probe::{DEFAULT_CONNECT_TIMEOUT, PortProbe};
pub use process::{ProcessExit, ProcessHandle};
pub use readiness::{ReadinessSpec, ReadinessState, ReadinessStrategy};
pub use supervisor::{DaemonSupervisor, DaemonTarget, ReadinessOutcome, SupervisorState};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
