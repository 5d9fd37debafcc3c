//! The daemon lifecycle state machine.
//!
//! ```text
//! Created -> Starting -> ProbingReadiness -> Running -> Stopping -> Stopped
//!               \               \
//!                `---------------`--> FailedToStart
//! ```
//!
//! Start, readiness polling and teardown all run on the caller's thread with
//! explicit timeouts. Teardown runs on every exit path, including drop, and
//! signals the process at most once.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use strum::Display;
use tracing::{debug, info, warn};
use vigil_config::{DEFAULT_STOP_TIMEOUT, DaemonConfig};

use crate::error::SupervisorError;
use crate::process::{DaemonCommand, EmbeddedWorker, ProcessHandle, WorkerContext};
use crate::readiness::{ReadinessState, ReadinessStrategy};

const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::supervisor");

/// Lifecycle states of a [`DaemonSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SupervisorState {
    /// Nothing has been spawned.
    Created,
    /// The process exists but readiness has not been checked.
    Starting,
    /// Readiness is being polled.
    ProbingReadiness,
    /// The daemon passed its readiness check.
    Running,
    /// Teardown is in progress.
    Stopping,
    /// Teardown finished.
    Stopped,
    /// The daemon never became ready. Terminal.
    FailedToStart,
}

type WorkerBody = Box<dyn FnOnce(WorkerContext) + Send>;

/// What the supervisor launches.
pub enum DaemonTarget {
    /// An external executable.
    External(DaemonCommand),
    /// An in-process daemon implementation.
    Embedded(WorkerBody),
}

impl DaemonTarget {
    /// Wraps an embedded daemon body.
    #[must_use]
    pub fn embedded<F>(body: F) -> Self
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        Self::Embedded(Box::new(body))
    }

    fn spawn(self, daemon: &str) -> Result<ProcessHandle, SupervisorError> {
        match self {
            Self::External(command) => command.spawn(daemon).map(ProcessHandle::from),
            Self::Embedded(body) => EmbeddedWorker::spawn(daemon, body)
                .map(ProcessHandle::from)
                .map_err(|source| SupervisorError::Spawn {
                    daemon: daemon.to_owned(),
                    program: format!("embedded worker '{daemon}'"),
                    source: std::sync::Arc::new(source),
                }),
        }
    }
}

impl fmt::Debug for DaemonTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External(command) => f.debug_tuple("External").field(command).finish(),
            Self::Embedded(_) => f.write_str("Embedded(..)"),
        }
    }
}

impl From<DaemonCommand> for DaemonTarget {
    fn from(command: DaemonCommand) -> Self {
        Self::External(command)
    }
}

/// Outcome of waiting for readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The daemon is ready and its handle may be used.
    Ready,
    /// The budget elapsed while the daemon was still pending.
    TimedOut {
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// The daemon can never become ready.
    NotRunning {
        /// Exit status or probe failure that ended the wait.
        cause: String,
    },
}

impl ReadinessOutcome {
    /// Whether the daemon became ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Converts a failed outcome into the matching error.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ReadinessTimeout`] or
    /// [`SupervisorError::DaemonNotRunning`] for the non-ready outcomes.
    pub fn into_result(self, daemon: &str) -> Result<(), SupervisorError> {
        match self {
            Self::Ready => Ok(()),
            Self::TimedOut { timeout } => Err(SupervisorError::ReadinessTimeout {
                daemon: daemon.to_owned(),
                timeout,
            }),
            Self::NotRunning { cause } => Err(SupervisorError::DaemonNotRunning {
                daemon: daemon.to_owned(),
                cause,
            }),
        }
    }
}

/// Owns one daemon from spawn to guaranteed teardown.
pub struct DaemonSupervisor {
    config: DaemonConfig,
    target: Option<DaemonTarget>,
    strategy: Box<dyn ReadinessStrategy>,
    handle: Option<ProcessHandle>,
    state: SupervisorState,
    stop_timeout: Duration,
}

impl DaemonSupervisor {
    /// Creates a supervisor that will launch `target` and wait on `strategy`.
    #[must_use]
    pub fn new(
        config: DaemonConfig,
        target: impl Into<DaemonTarget>,
        strategy: Box<dyn ReadinessStrategy>,
    ) -> Self {
        Self {
            config,
            target: Some(target.into()),
            strategy,
            handle: None,
            state: SupervisorState::Created,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Sets how long teardown waits after SIGTERM before force-killing.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
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

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// The live handle, available only while the daemon is running.
    #[must_use]
    pub fn handle(&self) -> Option<&ProcessHandle> {
        match self.state {
            SupervisorState::Running => self.handle.as_ref(),
            _ => None,
        }
    }

    /// Spawns the daemon and returns its pid, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidTransition`] unless the supervisor is
    /// freshly created, and [`SupervisorError::Spawn`] when the process cannot
    /// be created. A spawn failure leaves the supervisor in `FailedToStart`.
    pub fn start(&mut self) -> Result<Option<u32>, SupervisorError> {
        let target = match (self.state, self.target.take()) {
            (SupervisorState::Created, Some(target)) => target,
            (state, _) => return Err(self.invalid("start", state)),
        };
        self.state = SupervisorState::Starting;
        info!(target: SUPERVISOR_TARGET, daemon = self.name(), "starting daemon");
        match target.spawn(self.config.name()) {
            Ok(handle) => {
                let pid = handle.pid();
                self.handle = Some(handle);
                Ok(pid)
            }
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, daemon = self.name(), %error, "daemon failed to spawn");
                self.state = SupervisorState::FailedToStart;
                Err(error)
            }
        }
    }

    /// Polls the readiness strategy until it succeeds, fails or `timeout`
    /// elapses.
    ///
    /// Liveness is checked before every probe, so a daemon that dies is
    /// reported within one poll interval. Any outcome other than
    /// [`ReadinessOutcome::Ready`] tears the daemon down and leaves the
    /// supervisor in `FailedToStart`.
    pub fn wait_until_running(&mut self, timeout: Duration) -> ReadinessOutcome {
        if self.state != SupervisorState::Starting {
            let error = self.invalid("wait for", self.state);
            return ReadinessOutcome::NotRunning {
                cause: error.to_string(),
            };
        }
        self.state = SupervisorState::ProbingReadiness;
        let started = Instant::now();
        let deadline = started + timeout;
        debug!(
            target: SUPERVISOR_TARGET,
            daemon = self.name(),
            strategy = %self.strategy.describe(),
            timeout_ms = timeout.as_millis(),
            "waiting for daemon readiness"
        );
        let outcome = self.poll_readiness(deadline, timeout);
        match &outcome {
            ReadinessOutcome::Ready => {
                self.state = SupervisorState::Running;
                info!(
                    target: SUPERVISOR_TARGET,
                    daemon = self.name(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "daemon is running"
                );
            }
            ReadinessOutcome::TimedOut { timeout } => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    daemon = self.name(),
                    timeout_ms = timeout.as_millis(),
                    "daemon did not become ready in time"
                );
                self.fail_start();
            }
            ReadinessOutcome::NotRunning { cause } => {
                warn!(target: SUPERVISOR_TARGET, daemon = self.name(), %cause, "daemon is not running");
                self.fail_start();
            }
        }
        outcome
    }

    fn poll_readiness(&mut self, deadline: Instant, timeout: Duration) -> ReadinessOutcome {
        loop {
            if let Some(cause) = self.exit_cause() {
                return ReadinessOutcome::NotRunning { cause };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ReadinessOutcome::TimedOut { timeout };
            }
            match self.strategy.check(remaining) {
                ReadinessState::Ready => return ReadinessOutcome::Ready,
                ReadinessState::Failed { reason } => {
                    return ReadinessOutcome::NotRunning { cause: reason };
                }
                ReadinessState::Pending => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ReadinessOutcome::TimedOut { timeout };
            }
            thread::sleep(self.strategy.poll_interval().min(remaining));
        }
    }

    fn exit_cause(&self) -> Option<String> {
        match &self.handle {
            None => Some("no process was started".to_owned()),
            Some(handle) => handle
                .exit_status()
                .map(|exit| format!("process {exit} before becoming ready")),
        }
    }

    /// Starts the daemon, waits for readiness, lends the handle to `scope` and
    /// tears the daemon down afterwards, whatever happened.
    ///
    /// # Errors
    ///
    /// Returns the spawn error or the readiness failure; `scope` is not run in
    /// either case.
    pub fn run_scoped<T>(
        &mut self,
        timeout: Duration,
        scope: impl FnOnce(&ProcessHandle) -> T,
    ) -> Result<T, SupervisorError> {
        let result = self.start().and_then(|_| {
            let daemon = self.config.name().to_owned();
            self.wait_until_running(timeout).into_result(&daemon)
        });
        let output = match (result, self.handle()) {
            (Ok(()), Some(handle)) => Ok(scope(handle)),
            (Ok(()), None) => Err(self.invalid("lend", self.state)),
            (Err(error), _) => Err(error),
        };
        self.teardown();
        output
    }

    /// Moves the running daemon out into a [`RunningDaemon`](crate::RunningDaemon)
    /// guard.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidTransition`] unless the daemon is
    /// running.
    pub fn into_running(mut self) -> Result<crate::launch::RunningDaemon, SupervisorError> {
        let handle = match (self.state, self.handle.take()) {
            (SupervisorState::Running, Some(handle)) => handle,
            (state, handle) => {
                self.handle = handle;
                return Err(self.invalid("hand off", state));
            }
        };
        self.state = SupervisorState::Stopped;
        Ok(crate::launch::RunningDaemon::new(
            self.config.clone(),
            handle,
            self.stop_timeout,
        ))
    }

    /// Stops the daemon. Idempotent and infallible; also run on drop.
    pub fn teardown(&mut self) {
        let Some(handle) = self.handle.take() else {
            if self.state != SupervisorState::FailedToStart {
                self.state = SupervisorState::Stopped;
            }
            return;
        };
        let failed = self.state == SupervisorState::FailedToStart;
        if !failed {
            self.state = SupervisorState::Stopping;
        }
        stop_process(self.config.name(), &handle, self.stop_timeout);
        if !failed {
            self.state = SupervisorState::Stopped;
        }
    }

    fn fail_start(&mut self) {
        self.state = SupervisorState::FailedToStart;
        self.teardown();
    }

    fn invalid(&self, operation: &'static str, state: SupervisorState) -> SupervisorError {
        SupervisorError::InvalidTransition {
            daemon: self.config.name().to_owned(),
            operation,
            state,
        }
    }
}

impl fmt::Debug for DaemonSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonSupervisor")
            .field("daemon", &self.config.name())
            .field("state", &self.state)
            .field("strategy", &self.strategy.describe())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// SIGTERM, a bounded join, then force termination.
pub(crate) fn stop_process(daemon: &str, handle: &ProcessHandle, stop_timeout: Duration) {
    if handle.is_alive() {
        info!(target: SUPERVISOR_TARGET, daemon, pid = ?handle.pid(), "stopping daemon");
        if let Err(error) = handle.send_signal(Signal::SIGTERM) {
            warn!(target: SUPERVISOR_TARGET, daemon, %error, "failed to signal daemon");
        }
        if !handle.join(Some(stop_timeout)) {
            warn!(
                target: SUPERVISOR_TARGET,
                daemon,
                timeout_ms = stop_timeout.as_millis(),
                "daemon ignored SIGTERM"
            );
        }
    }
    handle.terminate();
    debug!(target: SUPERVISOR_TARGET, daemon, exit = ?handle.exit_status(), "daemon stopped");
}
