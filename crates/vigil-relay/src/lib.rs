//! Out-of-process log relay for supervised workers.
//!
//! Workers install [`WorkerLogging`] at start-up. Their `tracing` events are
//! turned into [`LogRecord`]s by a [`RelayLayer`], queued in memory and
//! streamed by a single [`LogRelay`] thread to the harness, where a
//! [`LogCollector`] decodes them and hands them to a [`RecordSink`].
//!
//! On the wire every record is one frame: a big-endian `u32` length followed
//! by the `postcard` encoding of the record. The configured prefix is
//! prepended to each message before it is framed, so the harness can tell
//! which daemon a line came from.

mod codec;
mod collector;
mod layer;
mod queue;
mod record;
mod relay;

pub use codec::{CodecError, FRAME_HEADER_LEN, FrameDecoder, MAX_FRAME_LEN, encode_frame};
pub use collector::{CollectorError, LogCollector, MemorySink, RELAYED_TARGET, RecordSink, TracingSink};
pub use layer::{RelayLayer, WorkerLogging};
pub use queue::RecordQueue;
pub use record::{LogRecord, RecordLevel};
pub use relay::{CONNECT_TIMEOUT, LogRelay, RelayError, RelaySettings, RelayStats};
