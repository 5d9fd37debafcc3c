//! Shared doubles for supervisor tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use vigil_config::DaemonConfig;

use crate::process::{DaemonCommand, WorkerContext};
use crate::readiness::{ReadinessState, ReadinessStrategy};
use crate::supervisor::DaemonTarget;

pub(crate) const FAST_POLL: Duration = Duration::from_millis(5);

/// Strategy that replays a fixed script, then reports `Pending` forever.
#[derive(Debug)]
pub(crate) struct ScriptedReadiness {
    script: VecDeque<ReadinessState>,
    checks: Arc<AtomicUsize>,
}

impl ScriptedReadiness {
    pub(crate) fn new(script: impl IntoIterator<Item = ReadinessState>) -> Self {
        Self {
            script: script.into_iter().collect(),
            checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn ready() -> Self {
        Self::new([ReadinessState::Ready])
    }

    pub(crate) fn never() -> Self {
        Self::new([])
    }

    pub(crate) fn checks(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.checks)
    }

    pub(crate) fn boxed(self) -> Box<dyn ReadinessStrategy> {
        Box::new(self)
    }
}

impl ReadinessStrategy for ScriptedReadiness {
    fn check(&mut self, _budget: Duration) -> ReadinessState {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(ReadinessState::Pending)
    }

    fn poll_interval(&self) -> Duration {
        FAST_POLL
    }

    fn describe(&self) -> String {
        "scripted readiness".to_owned()
    }
}

/// Embedded worker that idles until shutdown and records that it stopped.
pub(crate) fn idle_worker() -> (DaemonTarget, Arc<AtomicBool>) {
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stopped);
    let target = DaemonTarget::embedded(move |context: WorkerContext| {
        context.wait_for_shutdown(None);
        flag.store(true, Ordering::SeqCst);
    });
    (target, stopped)
}

/// Long-running external process without signal forwarding.
pub(crate) fn sleeper() -> DaemonCommand {
    DaemonCommand::new("sleep").arg("30").relay_signals(false)
}

/// External process that exits immediately with `code`.
pub(crate) fn crasher(code: i32) -> DaemonCommand {
    DaemonCommand::new("/bin/sh")
        .arg("-c")
        .arg(format!("exit {code}"))
        .relay_signals(false)
}

pub(crate) fn daemon_config(name: &str) -> DaemonConfig {
    DaemonConfig::builder(name).build()
}

/// Whether `pid` still names a process, zombies included.
pub(crate) fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}
