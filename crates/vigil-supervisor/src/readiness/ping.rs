use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{ReadinessState, ReadinessStrategy};
use crate::executor::CommandExecutor;
use crate::helper::{HelperCommand, HelperOutcome};

const READINESS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::readiness");

/// Pause between ping attempts.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Ready once a helper command (typically a client `ping`) exits with 0.
///
/// A helper that times out or exits non-zero leaves the daemon pending; only
/// a helper that cannot be spawned at all is a permanent failure.
pub struct PingReady {
    executor: Arc<CommandExecutor>,
    command: HelperCommand,
    interval: Duration,
    attempts: u32,
}

impl PingReady {
    /// Pings with `command` on `executor`.
    #[must_use]
    pub const fn new(executor: Arc<CommandExecutor>, command: HelperCommand) -> Self {
        Self {
            executor,
            command,
            interval: DEFAULT_PING_INTERVAL,
            attempts: 0,
        }
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of helper invocations made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl ReadinessStrategy for PingReady {
    fn check(&mut self, budget: Duration) -> ReadinessState {
        self.attempts += 1;
        let wait = self.command.timeout().min(budget);
        let outcome = self.executor.submit(self.command.clone()).wait(wait);
        match outcome {
            HelperOutcome::Completed(result) if result.success() => {
                info!(target: READINESS_TARGET, command = %self.command, attempt = self.attempts, "ping succeeded");
                ReadinessState::Ready
            }
            HelperOutcome::Completed(result) => {
                debug!(
                    target: READINESS_TARGET,
                    command = %self.command,
                    attempt = self.attempts,
                    exit_code = ?result.exit_code,
                    "ping failed, retrying"
                );
                ReadinessState::Pending
            }
            HelperOutcome::TimedOut { timeout } => {
                debug!(
                    target: READINESS_TARGET,
                    command = %self.command,
                    attempt = self.attempts,
                    timeout_ms = timeout.as_millis(),
                    "ping timed out, retrying"
                );
                ReadinessState::Pending
            }
            HelperOutcome::SpawnFailed { program, message } => ReadinessState::Failed {
                reason: format!("cannot run ping helper '{program}': {message}"),
            },
        }
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    fn describe(&self) -> String {
        format!("ping via '{}'", self.command)
    }
}
