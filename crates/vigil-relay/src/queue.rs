//! The in-process record queue drained by the relay thread.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::record::LogRecord;

/// A queue entry; `None` is the shutdown sentinel.
pub(crate) type QueueItem = Option<LogRecord>;

/// Producer side of the relay queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RecordQueue {
    sender: Sender<QueueItem>,
}

impl RecordQueue {
    /// Enqueues `record` for forwarding.
    ///
    /// Returns `false` once the relay thread has gone away.
    pub fn push(&self, record: LogRecord) -> bool {
        self.sender.send(Some(record)).is_ok()
    }

    /// Enqueues the sentinel. Records pushed afterwards are never forwarded.
    pub(crate) fn close(&self) -> bool {
        self.sender.send(None).is_ok()
    }
}

/// Creates an unbounded queue and its single consumer.
pub(crate) fn channel() -> (RecordQueue, Receiver<QueueItem>) {
    let (sender, receiver) = mpsc::channel();
    (RecordQueue { sender }, receiver)
}
