//! `tracing` integration on the worker side of the relay.

use std::collections::BTreeMap;
use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::queue::RecordQueue;
use crate::record::{LogRecord, RecordLevel};
use crate::relay::{LogRelay, RelayError, RelaySettings, RelayStats};

/// Crate whose own events are never fed back into the queue.
const OWN_CRATE: &str = env!("CARGO_CRATE_NAME");

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_CRATE)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Converts every `tracing` event into a [`LogRecord`] on the relay queue.
///
/// No level filtering happens here; the collector side decides what to show.
#[derive(Debug, Clone)]
pub struct RelayLayer {
    queue: RecordQueue,
}

impl RelayLayer {
    /// Feeds `queue`.
    #[must_use]
    pub const fn new(queue: RecordQueue) -> Self {
        Self { queue }
    }
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_own_target(metadata.target()) {
            return;
        }
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let mut record = LogRecord::new(
            RecordLevel::from(*metadata.level()),
            metadata.target(),
            visitor.message,
        );
        record.module_path = metadata.module_path().map(str::to_owned);
        record.file = metadata.file().map(str::to_owned);
        record.line = metadata.line();
        record.fields = visitor.fields;
        // A closed queue means the relay already stopped; the event is lost.
        self.queue.push(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_owned(), rendered);
        }
    }
}

/// Relay-backed logging for a worker process.
///
/// Created when the worker starts and dropped before it exits: dropping
/// enqueues the sentinel and joins the relay thread, so every record emitted
/// earlier reaches the collector.
#[derive(Debug)]
pub struct WorkerLogging {
    relay: Option<LogRelay>,
}

impl WorkerLogging {
    /// Starts the relay and installs it as the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] when the collector is unreachable or another
    /// global subscriber is already installed.
    pub fn install(settings: &RelaySettings) -> Result<Self, RelayError> {
        let relay = LogRelay::start(settings)?;
        tracing_subscriber::registry()
            .with(RelayLayer::new(relay.queue()))
            .try_init()
            .map_err(RelayError::Subscriber)?;
        Ok(Self { relay: Some(relay) })
    }

    /// Installs relaying when the environment names a collector.
    ///
    /// Returns `Ok(None)` when `VIGIL_COLLECTOR_PORT` is unset.
    ///
    /// # Errors
    ///
    /// See [`Self::install`].
    pub fn install_from_env() -> Result<Option<Self>, RelayError> {
        RelaySettings::from_env()
            .map(|settings| Self::install(&settings))
            .transpose()
    }

    /// Stops relaying and reports what was forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ThreadPanic`] if the relay thread panicked.
    pub fn shutdown(mut self) -> Result<RelayStats, RelayError> {
        self.relay
            .take()
            .map_or(Ok(RelayStats::default()), LogRelay::shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use rstest::rstest;

    #[test]
    fn events_become_records() {
        let (queue, receiver) = queue::channel();
        let subscriber = tracing_subscriber::registry().with(RelayLayer::new(queue));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "salt.minion", jid = 42, "returner failed");
        });
        let record = receiver
            .try_recv()
            .expect("one queued item")
            .expect("a record, not the sentinel");
        assert_eq!(record.level, RecordLevel::Warn);
        assert_eq!(record.source, "salt.minion");
        assert_eq!(record.message, "returner failed");
        assert_eq!(record.fields.get("jid").map(String::as_str), Some("42"));
        assert!(record.line.is_some());
    }

    #[test]
    fn relay_events_are_not_fed_back() {
        let (queue, receiver) = queue::channel();
        let subscriber = tracing_subscriber::registry().with(RelayLayer::new(queue));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "vigil_relay::relay", "internal");
        });
        assert!(receiver.try_recv().is_err());
    }

    #[rstest]
    #[case::crate_root("vigil_relay", true)]
    #[case::module("vigil_relay::collector", true)]
    #[case::other_crate("vigil_relay_tools::cli", false)]
    #[case::daemon("salt.minion", false)]
    fn own_targets_are_recognised(#[case] target: &str, #[case] own: bool) {
        assert_eq!(is_own_target(target), own);
    }
}
