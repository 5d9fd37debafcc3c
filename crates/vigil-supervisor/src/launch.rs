//! Retrying launcher and the scoped running-daemon guard.

use std::ops::Deref;
use std::time::Duration;

use tracing::{info, warn};
use vigil_config::{DEFAULT_STARTUP_TIMEOUT, DaemonConfig, HarnessConfig};

use crate::error::SupervisorError;
use crate::process::ProcessHandle;
use crate::supervisor::{DaemonSupervisor, ReadinessOutcome, stop_process};

const LAUNCH_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::launch");

/// Default number of launch attempts.
pub const DEFAULT_START_ATTEMPTS: u32 = 3;

/// How hard [`launch_daemon`] tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    /// Attempts before giving up; at least one is always made.
    pub attempts: u32,
    /// Readiness budget for each attempt.
    pub timeout: Duration,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_START_ATTEMPTS,
            timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

impl StartPolicy {
    /// Uses the harness startup timeout with the default attempt count.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            attempts: DEFAULT_START_ATTEMPTS,
            timeout: config.startup_timeout(),
        }
    }
}

/// Starts a daemon, retrying with a fresh supervisor when it fails to become
/// ready.
///
/// `factory` receives the 1-based attempt number. Spawn failures and factory
/// errors are returned at once; readiness failures are retried.
///
/// # Errors
///
/// Returns the first spawn error, or [`SupervisorError::LaunchExhausted`]
/// carrying the final readiness failure.
pub fn launch_daemon<F>(mut factory: F, policy: &StartPolicy) -> Result<RunningDaemon, SupervisorError>
where
    F: FnMut(u32) -> Result<DaemonSupervisor, SupervisorError>,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;
    let mut daemon = String::new();
    for attempt in 1..=attempts {
        let mut supervisor = factory(attempt)?;
        daemon = supervisor.name().to_owned();
        info!(target: LAUNCH_TARGET, daemon = %daemon, attempt, attempts, "launching daemon");
        supervisor.start()?;
        match supervisor.wait_until_running(policy.timeout) {
            ReadinessOutcome::Ready => return supervisor.into_running(),
            outcome => {
                warn!(target: LAUNCH_TARGET, daemon = %daemon, attempt, ?outcome, "launch attempt failed");
                last = outcome.into_result(&daemon).err();
            }
        }
    }
    let last = last.unwrap_or_else(|| SupervisorError::DaemonNotRunning {
        daemon: daemon.clone(),
        cause: "no launch attempt was made".to_owned(),
    });
    Err(SupervisorError::LaunchExhausted {
        daemon,
        attempts,
        last: Box::new(last),
    })
}

/// A ready daemon, torn down when dropped.
///
/// Dereferences to the live [`ProcessHandle`].
#[derive(Debug)]
pub struct RunningDaemon {
    config: DaemonConfig,
    handle: ProcessHandle,
    stop_timeout: Duration,
    stopped: bool,
}

impl RunningDaemon {
    pub(crate) const fn new(config: DaemonConfig, handle: ProcessHandle, stop_timeout: Duration) -> Self {
        Self {
            config,
            handle,
            stop_timeout,
            stopped: false,
        }
    }

    /// Daemon name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Stops the daemon now rather than at drop.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.stopped {
            self.stopped = true;
            stop_process(self.config.name(), &self.handle, self.stop_timeout);
        }
    }
}

impl Deref for RunningDaemon {
    type Target = ProcessHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
