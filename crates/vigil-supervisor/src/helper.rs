//! Short-lived helper commands such as a client `ping`.
//!
//! A helper is spawned in its own process group with piped output, polled
//! until it exits or its timeout elapses, and killed (group and all) on
//! timeout. Whatever the helper left running in its group is killed once it
//! exits. The result is reported as a [`HelperOutcome`] instead of an error:
//! callers branch on the outcome, they never propagate it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_config::{COLLECTOR_PORT_ENV, DaemonConfig, HarnessConfig, LOG_PREFIX_ENV};

/// Tracing target for helper command execution.
const HELPER_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::helper");

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A helper command invocation with its own timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    program: Utf8PathBuf,
    args: Vec<String>,
    working_dir: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl HelperCommand {
    /// Creates a command running `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<Utf8PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    /// Builds a client-script invocation against a daemon.
    ///
    /// The script is resolved against the harness binary directory and
    /// receives `-c <config_dir> --retcode-passthrough -l <level>` followed by
    /// `args`, so its exit status mirrors the remote call's result.
    #[must_use]
    pub fn client<I, S>(
        harness: &HarnessConfig,
        daemon: &DaemonConfig,
        script: &str,
        args: I,
        timeout: Duration,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = Self::new(harness.resolve_program(script), timeout);
        if let Some(config_dir) = daemon.config_dir() {
            command = command.arg("-c").arg(config_dir.as_str());
        }
        command = command
            .arg("--retcode-passthrough")
            .arg("-l")
            .arg(harness.daemon_log_level().as_str())
            .args(args)
            .env(LOG_PREFIX_ENV, harness.log_prefix_for(daemon));
        if let Some(port) = harness.collector_port() {
            command = command.env(COLLECTOR_PORT_ENV, port.to_string());
        }
        if let Some(dir) = daemon.working_dir() {
            command = command.current_dir(dir);
        }
        command
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the helper.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program to run.
    #[must_use]
    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Bounded wait applied to each run.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the helper on the current thread.
    #[must_use]
    pub fn run(&self) -> HelperOutcome {
        debug!(target: HELPER_TARGET, command = %self, timeout_ms = self.timeout.as_millis(), "running helper");
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(target: HELPER_TARGET, program = %self.program, %error, "failed to spawn helper");
                return HelperOutcome::SpawnFailed {
                    program: self.program.to_string(),
                    message: error.to_string(),
                };
            }
        };
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);
        let status = self.wait_for_exit(&mut child);
        if status.is_some() {
            // Background children would hold the output pipes open.
            kill_group(&child);
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);
        match status {
            Some(status) => {
                let result = ShellResult::from_output(status, stdout, stderr);
                debug!(
                    target: HELPER_TARGET,
                    program = %self.program,
                    exit_code = ?result.exit_code,
                    "helper finished"
                );
                HelperOutcome::Completed(result)
            }
            None => HelperOutcome::TimedOut {
                timeout: self.timeout,
            },
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(self.program.as_std_path());
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir.as_std_path());
        }
        command.spawn()
    }

    /// Returns the exit status, or `None` after killing a helper that overran.
    fn wait_for_exit(&self, child: &mut Child) -> Option<ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(error) => {
                    warn!(target: HELPER_TARGET, program = %self.program, %error, "failed to poll helper");
                    kill_helper(child);
                    return None;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    target: HELPER_TARGET,
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis(),
                    "helper timed out, killing process group"
                );
                kill_helper(child);
                return None;
            }
            thread::sleep(POLL_INTERVAL.min(remaining));
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program.as_str())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn kill_group(child: &Child) {
    if let Ok(raw) = i32::try_from(child.id()) {
        drop(killpg(Pid::from_raw(raw), Signal::SIGKILL));
    }
}

fn kill_helper(child: &mut Child) {
    kill_group(child);
    drop(child.kill());
    drop(child.wait());
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        drop(reader.read_to_end(&mut buffer));
        buffer
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Captured result of a helper that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellResult {
    /// Exit code, absent when the helper was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Standard output parsed as JSON, when it is valid JSON.
    pub json: Option<serde_json::Value>,
}

impl ShellResult {
    fn from_output(status: ExitStatus, stdout: String, stderr: String) -> Self {
        let trimmed = stdout.trim();
        let json = if trimmed.is_empty() {
            None
        } else {
            serde_json::from_str(trimmed).ok()
        };
        Self {
            exit_code: status.code(),
            stdout,
            stderr,
            json,
        }
    }

    /// Whether the helper exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How a helper invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperOutcome {
    /// The helper exited on its own.
    Completed(ShellResult),
    /// The helper overran its timeout and was killed.
    TimedOut {
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The helper could not be started.
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// Spawn error message.
        message: String,
    },
}

impl HelperOutcome {
    /// Only a completed helper with exit status 0 counts as success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(result) if result.success())
    }
}

/// Seam for running helpers, so probes can be exercised without processes.
#[cfg_attr(test, mockall::automock)]
pub trait HelperRunner: Send + Sync {
    /// Runs `command` to completion or timeout.
    fn run(&self, command: &HelperCommand) -> HelperOutcome;
}

/// Runs helpers as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHelperRunner;

impl HelperRunner for ProcessHelperRunner {
    fn run(&self, command: &HelperCommand) -> HelperOutcome {
        command.run()
    }
}
