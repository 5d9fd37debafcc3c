//! Bounded pool for helper commands.
//!
//! Probes submit helpers here so a slow client never blocks the supervisor's
//! control thread. The pool has a fixed worker count; extra jobs queue until a
//! worker frees up. The executor never retries: a job runs once and reports
//! whatever happened.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;
use vigil_config::HarnessConfig;

use crate::error::ExecutorError;
use crate::helper::{HelperCommand, HelperOutcome, HelperRunner, ProcessHelperRunner};

const EXECUTOR_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::executor");

/// Fixed-size worker pool running [`HelperCommand`]s.
pub struct CommandExecutor {
    pool: ThreadPool,
    workers: usize,
    runner: Arc<dyn HelperRunner>,
}

impl CommandExecutor {
    /// Creates a pool of `workers` threads running helpers as processes.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::PoolBuild`] when the threads cannot be created.
    pub fn new(workers: usize) -> Result<Self, ExecutorError> {
        Self::with_runner(workers, Arc::new(ProcessHelperRunner))
    }

    /// Creates a pool sized from the harness configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn from_config(config: &HarnessConfig) -> Result<Self, ExecutorError> {
        Self::new(config.helper_workers())
    }

    /// Creates a pool that delegates to a custom runner.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_runner(
        workers: usize,
        runner: Arc<dyn HelperRunner>,
    ) -> Result<Self, ExecutorError> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("vigil-helper-{index}"))
            .build()
            .map_err(|error| ExecutorError::PoolBuild {
                workers,
                message: error.to_string(),
            })?;
        Ok(Self {
            pool,
            workers,
            runner,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Queues `command` and returns a handle to its eventual outcome.
    #[must_use]
    pub fn submit(&self, command: HelperCommand) -> JobHandle {
        let (sender, receiver) = mpsc::sync_channel(1);
        let runner = Arc::clone(&self.runner);
        let program = command.program().to_owned();
        self.pool.spawn(move || {
            let outcome = runner.run(&command);
            // The submitter may have stopped waiting.
            drop(sender.send(outcome));
        });
        debug!(target: EXECUTOR_TARGET, %program, "helper job queued");
        JobHandle { receiver, program }
    }

    /// Submits `command` and waits for at most its own timeout.
    #[must_use]
    pub fn run(&self, command: HelperCommand) -> HelperOutcome {
        let timeout = command.timeout();
        self.submit(command).wait(timeout)
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Pending result of a submitted helper job.
#[derive(Debug)]
pub struct JobHandle {
    receiver: mpsc::Receiver<HelperOutcome>,
    program: String,
}

impl JobHandle {
    /// Waits up to `budget` for the job to finish.
    ///
    /// Running out of budget is reported as [`HelperOutcome::TimedOut`]; the
    /// job itself keeps running until its own timeout kills it.
    #[must_use]
    pub fn wait(self, budget: Duration) -> HelperOutcome {
        match self.receiver.recv_timeout(budget) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => HelperOutcome::TimedOut { timeout: budget },
            Err(RecvTimeoutError::Disconnected) => HelperOutcome::SpawnFailed {
                program: self.program,
                message: "helper job ended without reporting an outcome".to_owned(),
            },
        }
    }
}
