use std::collections::BTreeMap;
use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use signal_hook::low_level::emulate_default_handler;
use tracing::{debug, warn};

use super::PROCESS_TARGET;

static DISPATCHER: OnceCell<Dispatcher> = OnceCell::new();

/// Process-wide SIGINT/SIGTERM listener shared by every relay.
///
/// Registered once and never removed. Each delivery is forwarded to the
/// process groups of all live relays, then handled the default way so the
/// harness still stops.
#[derive(Debug)]
struct Dispatcher {
    targets: Arc<Mutex<BTreeMap<u64, i32>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    fn get() -> io::Result<&'static Self> {
        DISPATCHER.get_or_try_init(Self::install)
    }

    fn install() -> io::Result<Self> {
        let targets = Arc::new(Mutex::new(BTreeMap::new()));
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let shared = Arc::clone(&targets);
        thread::Builder::new()
            .name("vigil-signal-relay".to_owned())
            .spawn(move || {
                for raw in signals.forever() {
                    let groups: Vec<i32> = lock(&shared).values().copied().collect();
                    forward(&groups, raw);
                    if let Err(error) = emulate_default_handler(raw) {
                        warn!(target: PROCESS_TARGET, %error, signal = raw, "failed to apply default signal handling");
                    }
                }
            })?;
        debug!(target: PROCESS_TARGET, "signal dispatcher installed");
        Ok(Self {
            targets,
            next_id: AtomicU64::new(0),
        })
    }

    fn add(&self, group: i32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.targets).insert(id, group);
        id
    }

    fn remove(&self, id: u64) {
        lock(&self.targets).remove(&id);
    }
}

fn lock(targets: &Mutex<BTreeMap<u64, i32>>) -> MutexGuard<'_, BTreeMap<u64, i32>> {
    targets.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn forward(groups: &[i32], raw: c_int) {
    let Ok(signal) = Signal::try_from(raw) else {
        return;
    };
    for &group in groups {
        warn!(target: PROCESS_TARGET, pid = group, %signal, "received signal, forwarding to daemon");
        match killpg(Pid::from_raw(group), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => {
                debug!(target: PROCESS_TARGET, pid = group, %signal, %error, "failed to forward signal");
            }
        }
    }
}

/// Forwards interrupt signals received by the harness to a daemon child.
///
/// While a relay is installed, SIGINT and SIGTERM delivered to the harness are
/// re-sent to the child's process group, after which the harness handles the
/// signal as it would have without any relay. Dropping the relay stops
/// forwarding to that child.
#[derive(Debug)]
pub struct SignalRelay {
    id: u64,
    pid: u32,
}

impl SignalRelay {
    /// Forwards SIGINT and SIGTERM to the process group led by `pid`.
    ///
    /// # Errors
    ///
    /// Returns the IO error raised while registering the handlers.
    pub fn install(pid: u32) -> io::Result<Self> {
        let group = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let id = Dispatcher::get()?.add(group);
        debug!(target: PROCESS_TARGET, pid, "signal relay installed");
        Ok(Self { id, pid })
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        if let Some(dispatcher) = DISPATCHER.get() {
            dispatcher.remove(self.id);
        }
        debug!(target: PROCESS_TARGET, pid = self.pid, "signal relay removed");
    }
}
