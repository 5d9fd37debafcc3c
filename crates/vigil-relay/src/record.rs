//! The structured log record carried over the relay.

use std::collections::BTreeMap;
use std::thread;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Severity of a relayed record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RecordLevel {
    /// Most verbose.
    Trace,
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

impl From<tracing::Level> for RecordLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

impl From<RecordLevel> for tracing::Level {
    fn from(level: RecordLevel) -> Self {
        match level {
            RecordLevel::Trace => Self::TRACE,
            RecordLevel::Debug => Self::DEBUG,
            RecordLevel::Info => Self::INFO,
            RecordLevel::Warn => Self::WARN,
            RecordLevel::Error => Self::ERROR,
        }
    }
}

/// A single log event produced inside a worker.
///
/// Records have no identity beyond their position in the stream; the relay
/// serialises each one and then discards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity.
    pub level: RecordLevel,
    /// Rendered message text.
    pub message: String,
    /// Logger or target name that produced the record.
    pub source: String,
    /// Creation time as milliseconds since the Unix epoch, UTC.
    pub timestamp_ms: i64,
    /// Rust module path of the call site, when known.
    pub module_path: Option<String>,
    /// Source file of the call site, when known.
    pub file: Option<String>,
    /// Source line of the call site, when known.
    pub line: Option<u32>,
    /// Name of the emitting thread, when it has one.
    pub thread: Option<String>,
    /// Structured fields other than the message, rendered as text.
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Creates a record stamped with the current time and thread.
    #[must_use]
    pub fn new(level: RecordLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source: source.into(),
            timestamp_ms: now_millis(),
            module_path: None,
            file: None,
            line: None,
            thread: thread::current().name().map(str::to_owned),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a structured field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Prepends `prefix` to the message.
    pub fn prefix_message(&mut self, prefix: &str) {
        if !prefix.is_empty() {
            self.message.insert_str(0, prefix);
        }
    }

    /// Creation time as RFC 3339, or `None` if the timestamp is out of range.
    #[must_use]
    pub fn timestamp_rfc3339(&self) -> Option<String> {
        let nanos = i128::from(self.timestamp_ms) * 1_000_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|stamp| stamp.format(&Rfc3339).ok())
    }
}

fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::trace(tracing::Level::TRACE, RecordLevel::Trace)]
    #[case::info(tracing::Level::INFO, RecordLevel::Info)]
    #[case::error(tracing::Level::ERROR, RecordLevel::Error)]
    fn levels_map_both_ways(#[case] level: tracing::Level, #[case] expected: RecordLevel) {
        let mapped = RecordLevel::from(level);
        assert_eq!(mapped, expected);
        assert_eq!(tracing::Level::from(mapped), level);
    }

    #[test]
    fn prefix_is_prepended_once() {
        let mut record = LogRecord::new(RecordLevel::Info, "salt.minion", "connected");
        record.prefix_message("[minion] ");
        assert_eq!(record.message, "[minion] connected");
    }

    #[test]
    fn empty_prefix_leaves_message_alone() {
        let mut record = LogRecord::new(RecordLevel::Info, "salt.minion", "connected");
        record.prefix_message("");
        assert_eq!(record.message, "connected");
    }

    #[test]
    fn timestamp_renders_as_rfc3339() {
        let mut record = LogRecord::new(RecordLevel::Debug, "salt", "tick");
        record.timestamp_ms = 0;
        assert_eq!(record.timestamp_rfc3339().as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!("WARN".parse::<RecordLevel>(), Ok(RecordLevel::Warn));
    }
}
