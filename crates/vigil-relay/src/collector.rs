//! The harness-side server that receives relayed records.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameDecoder;
use crate::record::{LogRecord, RecordLevel};

const COLLECTOR_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::collector");

/// Target used when re-emitting relayed records.
pub const RELAYED_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::relayed");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// Errors raised while starting the collector.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The listen address did not resolve.
    #[error("failed to resolve collector address {host}:{port}: {source}")]
    Resolve {
        /// Requested host.
        host: String,
        /// Requested port.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The listener could not be bound.
    #[error("failed to bind log collector on {addr}: {source}")]
    Bind {
        /// Address that failed.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The listener could not be configured.
    #[error("failed to configure log collector listener: {source}")]
    Configure {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The accept thread could not be started.
    #[error("failed to spawn log collector thread: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Destination for decoded records.
pub trait RecordSink: Send + Sync {
    /// Handles one record. Called from connection reader threads.
    fn accept(&self, record: LogRecord);
}

/// Re-emits relayed records as local `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn accept(&self, record: LogRecord) {
        let origin_timestamp = record.timestamp_rfc3339().unwrap_or_default();
        macro_rules! emit {
            ($level:ident) => {
                tracing::$level!(
                    target: RELAYED_TARGET,
                    source = %record.source,
                    origin_timestamp = %origin_timestamp,
                    thread = record.thread.as_deref(),
                    module_path = record.module_path.as_deref(),
                    line = record.line,
                    fields = ?record.fields,
                    "{}",
                    record.message
                )
            };
        }
        match record.level {
            RecordLevel::Trace => emit!(trace),
            RecordLevel::Debug => emit!(debug),
            RecordLevel::Info => emit!(info),
            RecordLevel::Warn => emit!(warn),
            RecordLevel::Error => emit!(error),
        }
    }
}

/// Keeps every record in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
    arrived: Condvar,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records received so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().clone()
    }

    /// Waits until at least `count` records arrived or `timeout` elapsed.
    ///
    /// Returns `true` when enough records arrived.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut records = self.lock();
        while records.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            records = self
                .arrived
                .wait_timeout(records, remaining)
                .map_or_else(|poison| poison.into_inner().0, |(guard, _)| guard);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordSink for MemorySink {
    fn accept(&self, record: LogRecord) {
        self.lock().push(record);
        self.arrived.notify_all();
    }
}

/// TCP server accepting relay connections.
///
/// Each connection is read on its own thread and decoded frame by frame.
/// A connection that sends a malformed frame is dropped; others continue.
pub struct LogCollector {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    readers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl LogCollector {
    /// Listens on `host:port` and hands decoded records to `sink`.
    /// Port `0` picks a free port.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] when the address cannot be bound.
    pub fn bind(host: &str, port: u16, sink: Arc<dyn RecordSink>) -> Result<Self, CollectorError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| CollectorError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| CollectorError::Resolve {
                host: host.to_owned(),
                port,
                source: io::Error::from(io::ErrorKind::NotFound),
            })?;
        let listener =
            TcpListener::bind(addr).map_err(|source| CollectorError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| CollectorError::Configure { source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| CollectorError::Configure { source })?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let readers = Arc::new(Mutex::new(Vec::new()));
        let context = AcceptContext {
            shutdown: Arc::clone(&shutdown),
            readers: Arc::clone(&readers),
            sink,
        };
        let accept_thread = thread::Builder::new()
            .name("vigil-log-collector".to_owned())
            .spawn(move || context.run(&listener))
            .map_err(|source| CollectorError::Spawn { source })?;
        info!(target: COLLECTOR_TARGET, %addr, "log collector listening");
        Ok(Self {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
            readers,
        })
    }

    /// Bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    #[cfg(test)]
    fn tracked_readers(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting, then waits for connection readers to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(accept_thread) = self.accept_thread.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if accept_thread.join().is_err() {
            warn!(target: COLLECTOR_TARGET, addr = %self.addr, "collector accept thread panicked");
        }
        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for reader in readers {
            if reader.join().is_err() {
                warn!(target: COLLECTOR_TARGET, "collector reader thread panicked");
            }
        }
        debug!(target: COLLECTOR_TARGET, addr = %self.addr, "log collector stopped");
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptContext {
    shutdown: Arc<AtomicBool>,
    readers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    sink: Arc<dyn RecordSink>,
}

impl AcceptContext {
    fn run(&self, listener: &TcpListener) {
        let mut last_error = None::<io::ErrorKind>;
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    last_error = None;
                    self.spawn_reader(stream, peer);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: COLLECTOR_TARGET, %error, "collector accept error");
                    }
                    last_error = Some(kind);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    fn spawn_reader(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(target: COLLECTOR_TARGET, %peer, "relay connected");
        let shutdown = Arc::clone(&self.shutdown);
        let sink = Arc::clone(&self.sink);
        let spawned = thread::Builder::new()
            .name(format!("vigil-log-reader-{}", peer.port()))
            .spawn(move || read_connection(stream, peer, &shutdown, sink.as_ref()));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(error) => {
                warn!(target: COLLECTOR_TARGET, %peer, %error, "failed to spawn relay reader");
                return;
            }
        };
        let finished = {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            let (finished, running): (Vec<_>, Vec<_>) =
                readers.drain(..).partition(thread::JoinHandle::is_finished);
            *readers = running;
            readers.push(handle);
            finished
        };
        for reader in finished {
            if reader.join().is_err() {
                warn!(target: COLLECTOR_TARGET, "collector reader thread panicked");
            }
        }
    }
}

fn read_connection(mut stream: TcpStream, peer: SocketAddr, shutdown: &AtomicBool, sink: &dyn RecordSink) {
    if let Err(error) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(READ_TIMEOUT)))
    {
        warn!(target: COLLECTOR_TARGET, %peer, %error, "failed to configure relay connection");
        return;
    }
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0_u8; READ_CHUNK];
    let mut received = 0_usize;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                decoder.feed(chunk.get(..read).unwrap_or_default());
                loop {
                    match decoder.next_record() {
                        Ok(Some(record)) => {
                            received += 1;
                            trace!(target: COLLECTOR_TARGET, %peer, source = %record.source, "relayed record");
                            sink.accept(record);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            warn!(target: COLLECTOR_TARGET, %peer, %error, "dropping relay connection");
                            return;
                        }
                    }
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(error) => {
                debug!(target: COLLECTOR_TARGET, %peer, %error, "relay connection failed");
                break;
            }
        }
    }
    debug!(target: COLLECTOR_TARGET, %peer, received, "relay disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::codec::encode_frame;

    fn collector() -> (LogCollector, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let collector =
            LogCollector::bind("127.0.0.1", 0, Arc::clone(&sink) as Arc<dyn RecordSink>)
                .expect("bind collector");
        (collector, sink)
    }

    #[test]
    fn records_arrive_in_order() {
        let (collector, sink) = collector();
        let mut stream = TcpStream::connect(collector.local_addr()).expect("connect");
        for message in ["one", "two", "three"] {
            let record = LogRecord::new(RecordLevel::Info, "salt", message);
            stream.write_all(&encode_frame(&record).expect("encode")).expect("write");
        }
        assert!(sink.wait_for(3, Duration::from_secs(2)));
        let messages: Vec<String> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        drop(stream);
        collector.shutdown();
    }

    #[test]
    fn malformed_connection_does_not_affect_others() {
        let (collector, sink) = collector();
        let mut bad = TcpStream::connect(collector.local_addr()).expect("connect bad");
        bad.write_all(&u32::MAX.to_be_bytes()).expect("write garbage");

        let mut good = TcpStream::connect(collector.local_addr()).expect("connect good");
        let record = LogRecord::new(RecordLevel::Error, "salt", "still here");
        good.write_all(&encode_frame(&record).expect("encode")).expect("write");

        assert!(sink.wait_for(1, Duration::from_secs(2)));
        assert_eq!(sink.records().len(), 1);
        drop((bad, good));
        collector.shutdown();
    }

    #[test]
    fn finished_readers_are_released_on_next_connection() {
        let (collector, sink) = collector();
        for count in 1..=5 {
            let mut stream = TcpStream::connect(collector.local_addr()).expect("connect");
            let record = LogRecord::new(RecordLevel::Info, "salt", "short-lived");
            stream.write_all(&encode_frame(&record).expect("encode")).expect("write");
            assert!(sink.wait_for(count, Duration::from_secs(2)));
            drop(stream);
            thread::sleep(Duration::from_millis(50));
        }
        assert!(
            collector.tracked_readers() <= 2,
            "still tracking {} readers",
            collector.tracked_readers()
        );
        collector.shutdown();
    }

    #[test]
    fn tracing_sink_accepts_every_level() {
        let sink = TracingSink;
        for level in [
            RecordLevel::Trace,
            RecordLevel::Debug,
            RecordLevel::Info,
            RecordLevel::Warn,
            RecordLevel::Error,
        ] {
            sink.accept(LogRecord::new(level, "salt", "relayed"));
        }
    }

    #[test]
    fn wait_for_times_out() {
        let sink = MemorySink::new();
        assert!(!sink.wait_for(1, Duration::from_millis(20)));
    }
}
