//! Background forwarding of log records to the collector.
//!
//! One [`LogRelay`] runs per worker process. It owns the only connection to
//! the collector, drains the record queue on a dedicated thread, prefixes each
//! message and writes it as a frame. Delivery is best effort: once the
//! connection fails the thread exits quietly and the worker carries on.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::util::TryInitError;
use vigil_config::{COLLECTOR_PORT_ENV, DEFAULT_HOST, LOG_PREFIX_ENV};

use crate::codec::{CodecError, encode_frame};
use crate::queue::{self, QueueItem, RecordQueue};
use crate::record::LogRecord;

const RELAY_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::relay");

/// How long [`LogRelay::start`] waits for the collector to accept.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The collector address did not resolve.
    #[error("failed to resolve collector {host}:{port}: {source}")]
    Resolve {
        /// Collector host.
        host: String,
        /// Collector port.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The collector could not be reached.
    #[error("failed to connect to log collector at {addr}: {source}")]
    Connect {
        /// Collector address.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing to the collector failed; the connection is gone.
    #[error("log collector connection lost: {source}")]
    Transport {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A record could not be framed.
    #[error(transparent)]
    Encode(#[from] CodecError),
    /// The relay thread could not be started.
    #[error("failed to spawn log relay thread: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The relay thread panicked.
    #[error("log relay thread panicked")]
    ThreadPanic,
    /// The relay subscriber could not be installed.
    #[error("failed to install relay subscriber: {0}")]
    Subscriber(#[source] TryInitError),
}

/// Where and how a worker relays its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Collector host.
    pub host: String,
    /// Collector port.
    pub port: u16,
    /// Prepended to every relayed message.
    pub prefix: String,
}

impl RelaySettings {
    /// Relays to `host:port` with `prefix`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, prefix: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            prefix: prefix.into(),
        }
    }

    /// Reads `VIGIL_COLLECTOR_PORT` and `VIGIL_LOG_PREFIX`.
    ///
    /// Returns `None` when no collector port is set, which disables relaying.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`] but reads variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let raw = lookup(COLLECTOR_PORT_ENV)?;
        let Ok(port) = raw.trim().parse::<u16>() else {
            warn!(target: RELAY_TARGET, value = %raw, "ignoring invalid collector port");
            return None;
        };
        let prefix = lookup(LOG_PREFIX_ENV).unwrap_or_default();
        Some(Self::new(DEFAULT_HOST, port, prefix))
    }
}

/// What the relay thread did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Records written to the collector.
    pub forwarded: usize,
    /// Records skipped because they could not be framed.
    pub dropped: usize,
    /// Whether the thread stopped because the connection failed.
    pub disconnected: bool,
}

/// Handle to the running relay thread.
#[derive(Debug)]
pub struct LogRelay {
    collector: SocketAddr,
    queue: RecordQueue,
    thread: Option<thread::JoinHandle<RelayStats>>,
}

impl LogRelay {
    /// Connects to the collector and starts the forwarding thread.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] when the collector cannot be resolved or
    /// reached, or the thread cannot be spawned.
    pub fn start(settings: &RelaySettings) -> Result<Self, RelayError> {
        let collector = resolve(&settings.host, settings.port)?;
        let stream = TcpStream::connect_timeout(&collector, CONNECT_TIMEOUT)
            .map_err(|source| RelayError::Connect {
                addr: collector,
                source,
            })?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(target: RELAY_TARGET, %error, "failed to disable Nagle on relay socket");
        }
        let (queue, receiver) = queue::channel();
        let prefix = settings.prefix.clone();
        let thread = thread::Builder::new()
            .name("vigil-log-relay".to_owned())
            .spawn(move || {
                let mut stream = stream;
                forward_records(&receiver, &mut stream, &prefix)
            })
            .map_err(|source| RelayError::Spawn { source })?;
        info!(target: RELAY_TARGET, %collector, "log relay connected");
        Ok(Self {
            collector,
            queue,
            thread: Some(thread),
        })
    }

    /// Collector address.
    #[must_use]
    pub const fn collector(&self) -> SocketAddr {
        self.collector
    }

    /// A producer handle for the relay queue.
    #[must_use]
    pub fn queue(&self) -> RecordQueue {
        self.queue.clone()
    }

    /// Enqueues the sentinel and waits for every earlier record to be written.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ThreadPanic`] if the relay thread panicked.
    pub fn shutdown(mut self) -> Result<RelayStats, RelayError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<RelayStats, RelayError> {
        let Some(thread) = self.thread.take() else {
            return Ok(RelayStats::default());
        };
        self.queue.close();
        let stats = thread.join().map_err(|_| RelayError::ThreadPanic)?;
        debug!(
            target: RELAY_TARGET,
            forwarded = stats.forwarded,
            dropped = stats.dropped,
            disconnected = stats.disconnected,
            "log relay stopped"
        );
        Ok(stats)
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(target: RELAY_TARGET, %error, "log relay did not stop cleanly");
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let resolve_error = |source| RelayError::Resolve {
        host: host.to_owned(),
        port,
        source,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::from(io::ErrorKind::NotFound)))
}

/// Drains `receiver` into `writer` until the sentinel arrives, every producer
/// is gone or the writer fails.
pub(crate) fn forward_records<W: Write>(
    receiver: &Receiver<QueueItem>,
    writer: &mut W,
    prefix: &str,
) -> RelayStats {
    let mut stats = RelayStats::default();
    while let Ok(Some(mut record)) = receiver.recv() {
        record.prefix_message(prefix);
        match write_record(writer, &record) {
            Ok(()) => stats.forwarded += 1,
            Err(RelayError::Transport { source }) => {
                debug!(target: RELAY_TARGET, error = %source, "collector went away, relay exiting");
                stats.disconnected = true;
                break;
            }
            Err(error) => {
                stats.dropped += 1;
                warn!(target: RELAY_TARGET, %error, source = %record.source, "dropping unrelayable log record");
            }
        }
    }
    stats
}

fn write_record<W: Write>(writer: &mut W, record: &LogRecord) -> Result<(), RelayError> {
    let frame = encode_frame(record)?;
    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|source| RelayError::Transport { source })
}
