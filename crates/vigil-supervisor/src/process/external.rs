use std::collections::BTreeMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use vigil_config::{COLLECTOR_PORT_ENV, DaemonConfig, HarnessConfig, LOG_PREFIX_ENV};

use super::signals::SignalRelay;
use super::{PROCESS_TARGET, ProcessExit, REAP_INTERVAL};
use crate::error::SupervisorError;

/// Recipe for spawning an external daemon executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    program: Utf8PathBuf,
    args: Vec<String>,
    working_dir: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    relay_signals: bool,
}

impl DaemonCommand {
    /// Creates a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            relay_signals: true,
        }
    }

    /// Builds the standard daemon invocation:
    /// `<bin_dir>/<script> -c <config_dir> -l <level>`, started in the daemon's
    /// working directory with its relay prefix in the environment.
    #[must_use]
    pub fn for_daemon(harness: &HarnessConfig, daemon: &DaemonConfig, script: &str) -> Self {
        let mut command = Self::new(harness.resolve_program(script));
        if let Some(config_dir) = daemon.config_dir() {
            command = command.arg("-c").arg(config_dir.as_str());
        }
        command = command
            .arg("-l")
            .arg(harness.daemon_log_level().as_str())
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

    /// Sets an environment variable.
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

    /// Controls whether SIGINT/SIGTERM received by the harness are forwarded
    /// to the daemon. Enabled by default.
    #[must_use]
    pub const fn relay_signals(mut self, enabled: bool) -> Self {
        self.relay_signals = enabled;
        self
    }

    /// Program that will be executed.
    #[must_use]
    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Environment overrides.
    #[must_use]
    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Spawns the daemon in a new process group.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Spawn`] when the OS refuses to create the
    /// process.
    pub fn spawn(&self, daemon: &str) -> Result<ExternalProcess, SupervisorError> {
        let mut command = Command::new(self.program.as_std_path());
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir.as_std_path());
        }
        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            daemon: daemon.to_owned(),
            program: self.program.to_string(),
            source: Arc::new(source),
        })?;
        let pid = child.id();
        info!(
            target: PROCESS_TARGET,
            daemon,
            pid,
            program = %self.program,
            args = ?self.args,
            "spawned daemon process"
        );
        let relay = if self.relay_signals {
            match SignalRelay::install(pid) {
                Ok(relay) => Some(relay),
                Err(error) => {
                    warn!(target: PROCESS_TARGET, daemon, pid, %error, "failed to install signal relay");
                    None
                }
            }
        } else {
            None
        };
        Ok(ExternalProcess::new(daemon, child, relay))
    }
}

/// A daemon child process leading its own process group.
#[derive(Debug)]
pub struct ExternalProcess {
    daemon: String,
    pid: u32,
    child: Mutex<Child>,
    exit: OnceCell<ProcessExit>,
    terminated: AtomicBool,
    relay: Mutex<Option<SignalRelay>>,
}

impl ExternalProcess {
    fn new(daemon: &str, child: Child, relay: Option<SignalRelay>) -> Self {
        Self {
            daemon: daemon.to_owned(),
            pid: child.id(),
            child: Mutex::new(child),
            exit: OnceCell::new(),
            terminated: AtomicBool::new(false),
            relay: Mutex::new(relay),
        }
    }

    /// OS process id, which is also the process group id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.reap().is_none()
    }

    /// Polls the child without blocking, recording its exit once observed.
    #[must_use]
    pub fn reap(&self) -> Option<ProcessExit> {
        if let Some(exit) = self.exit.get() {
            return Some(*exit);
        }
        let status = match self.lock_child().try_wait() {
            Ok(status) => status?,
            Err(error) => {
                debug!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, %error, "failed to poll daemon");
                return None;
            }
        };
        Some(self.record_exit(status))
    }

    /// Sends `signal` to the daemon's process group.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Signal`] for any kernel error other than
    /// the group having already gone.
    pub fn send_signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        if self.reap().is_some() {
            return Ok(());
        }
        debug!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, %signal, "signalling daemon process group");
        match killpg(self.group(), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal {
                pid: self.pid,
                signal,
                source,
            }),
        }
    }

    /// Polls for exit until `timeout` elapses; `None` waits indefinitely.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.reap().is_some() {
                return true;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    REAP_INTERVAL.min(remaining)
                }
                None => REAP_INTERVAL,
            };
            thread::sleep(pause);
        }
    }

    /// Kills the whole process group and reaps the child. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.reap().is_none() {
            warn!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, "force-killing daemon process group");
            if let Err(error) = killpg(self.group(), Signal::SIGKILL) {
                if error != Errno::ESRCH {
                    warn!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, %error, "failed to kill daemon process group");
                }
            }
            let waited = self.lock_child().wait();
            match waited {
                Ok(status) => {
                    self.record_exit(status);
                }
                Err(error) => {
                    warn!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, %error, "failed to reap daemon");
                }
            }
        } else {
            // Descendants may outlive the group leader.
            drop(killpg(self.group(), Signal::SIGKILL));
        }
        self.drop_relay();
    }

    fn record_exit(&self, status: ExitStatus) -> ProcessExit {
        let exit = match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Exited(code),
            (None, Some(signal)) => ProcessExit::Signalled(signal),
            (None, None) => ProcessExit::Exited(-1),
        };
        if self.exit.set(exit).is_ok() {
            info!(target: PROCESS_TARGET, daemon = %self.daemon, pid = self.pid, %exit, "daemon process exited");
            self.drop_relay();
        }
        exit
    }

    fn drop_relay(&self) {
        let relay = self
            .relay
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        drop(relay);
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn group(&self) -> Pid {
        Pid::from_raw(i32::try_from(self.pid).unwrap_or(i32::MAX))
    }
}

impl Drop for ExternalProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_config::LogLevel;

    fn shell(script: &str) -> DaemonCommand {
        DaemonCommand::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .relay_signals(false)
    }

    #[test]
    fn daemon_command_follows_the_spawn_contract() {
        let harness = HarnessConfig {
            bin_dir: Some(Utf8PathBuf::from("/opt/salt/bin")),
            verbosity: Some(6),
            collector_port: Some(64100),
            ..HarnessConfig::default()
        };
        let daemon = DaemonConfig::builder("master")
            .config_dir("/tmp/master-conf")
            .working_dir("/tmp/master-root")
            .build();
        let command = DaemonCommand::for_daemon(&harness, &daemon, "salt-master");
        assert_eq!(command.program(), "/opt/salt/bin/salt-master");
        assert_eq!(
            command.arguments(),
            ["-c", "/tmp/master-conf", "-l", LogLevel::Garbage.as_str()]
        );
        assert_eq!(
            command.environment().get(COLLECTOR_PORT_ENV).map(String::as_str),
            Some("64100")
        );
        assert_eq!(
            command.working_dir.as_deref().map(camino::Utf8Path::as_str),
            Some("/tmp/master-root")
        );
    }

    #[test]
    fn exited_process_is_reaped_with_its_status() {
        let process = shell("exit 3").spawn("crasher").expect("spawn");
        assert!(process.join(Some(Duration::from_secs(5))));
        assert_eq!(process.reap(), Some(ProcessExit::Exited(3)));
        assert!(!process.is_alive());
    }

    #[test]
    fn sigterm_reaches_the_process_group() {
        let process = shell("sleep 30").spawn("sleeper").expect("spawn");
        assert!(process.is_alive());
        process.send_signal(Signal::SIGTERM).expect("signal");
        assert!(process.join(Some(Duration::from_secs(5))));
        assert!(!process.is_alive());
    }

    #[test]
    fn terminate_is_idempotent_and_safe_after_exit() {
        let process = shell("sleep 30").spawn("sleeper").expect("spawn");
        process.terminate();
        process.terminate();
        assert!(!process.is_alive());
        process.send_signal(Signal::SIGTERM).expect("signal after exit is a no-op");
    }

    #[test]
    fn join_times_out_on_a_running_process() {
        let process = shell("sleep 30").spawn("sleeper").expect("spawn");
        let started = Instant::now();
        assert!(!process.join(Some(Duration::from_millis(100))));
        assert!(started.elapsed() < Duration::from_secs(2));
        process.terminate();
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let error = DaemonCommand::new("/nonexistent/salt-minion")
            .spawn("minion")
            .expect_err("spawn should fail");
        assert!(matches!(error, SupervisorError::Spawn { ref daemon, .. } if daemon == "minion"));
    }
}
