use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{PROCESS_TARGET, ProcessExit, REAP_INTERVAL};

/// Shutdown view handed to an embedded worker.
///
/// Workers are expected to poll [`Self::shutdown_requested`] or block in
/// [`Self::wait_for_shutdown`] and return promptly once asked to stop.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Whether the supervisor asked the worker to stop.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Blocks until shutdown is requested or `timeout` elapses.
    ///
    /// Returns `true` when shutdown was requested.
    pub fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.shutdown_requested() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            thread::sleep(REAP_INTERVAL);
        }
    }
}

/// A daemon implementation running on its own harness thread.
#[derive(Debug)]
pub struct EmbeddedWorker {
    name: String,
    shutdown: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    exit: OnceCell<ProcessExit>,
    terminated: AtomicBool,
}

/// Marks the worker finished even when the body unwinds.
struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl EmbeddedWorker {
    /// Starts `body` on a dedicated, named thread.
    ///
    /// # Errors
    ///
    /// Returns the IO error raised when the thread cannot be created.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let context = WorkerContext {
            shutdown: Arc::clone(&shutdown),
        };
        let guard = FinishGuard(Arc::clone(&finished));
        let thread = thread::Builder::new()
            .name(format!("vigil-worker-{name}"))
            .spawn(move || {
                let _guard = guard;
                body(context);
            })?;
        info!(target: PROCESS_TARGET, daemon = name, "started embedded worker");
        Ok(Self {
            name: name.to_owned(),
            shutdown,
            finished,
            thread: Mutex::new(Some(thread)),
            exit: OnceCell::new(),
            terminated: AtomicBool::new(false),
        })
    }

    /// Whether the worker body is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.reap().is_none()
    }

    /// Exit state once the worker body has finished.
    #[must_use]
    pub fn reap(&self) -> Option<ProcessExit> {
        if let Some(exit) = self.exit.get() {
            return Some(*exit);
        }
        if !self.finished.load(Ordering::SeqCst) {
            return None;
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        let exit = match thread.map(thread::JoinHandle::join) {
            Some(Err(_)) => ProcessExit::Panicked,
            Some(Ok(())) | None => ProcessExit::Returned,
        };
        Some(*self.exit.get_or_init(|| exit))
    }

    /// Requests cooperative shutdown; every signal maps to the same request.
    pub fn request_shutdown(&self, signal: Signal) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!(target: PROCESS_TARGET, daemon = %self.name, %signal, "requested embedded worker shutdown");
        }
    }

    /// Polls for the worker to finish; `None` waits indefinitely.
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

    /// Requests shutdown and detaches a worker that has not finished.
    ///
    /// Threads cannot be killed, so an unresponsive worker is left running
    /// and reported.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        if self.reap().is_none() {
            warn!(
                target: PROCESS_TARGET,
                daemon = %self.name,
                "embedded worker ignored shutdown; detaching thread"
            );
        }
    }
}

impl Drop for EmbeddedWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}
