//! Outbound buffering while the broker connection is down

use std::collections::VecDeque;

/// A publish waiting for the connection to come back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// FIFO of publishes produced while disconnected
///
/// Unbounded. Entries leave the queue only through [`PublishQueue::take_all`],
/// which empties it before the caller starts sending, so publishes made
/// while flushing land in a fresh queue instead of the batch being sent.
#[derive(Debug, Default)]
pub struct PublishQueue {
    entries: VecDeque<QueuedEntry>,
}

impl PublishQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, topic: impl Into<String>, payload: Vec<u8>, retain: bool) {
        self.entries.push_back(QueuedEntry {
            topic: topic.into(),
            payload,
            retain,
        });
    }

    /// Remove and return every entry, oldest first
    pub fn take_all(&mut self) -> Vec<QueuedEntry> {
        std::mem::take(&mut self.entries).into()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over queued entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &QueuedEntry> {
        self.entries.iter()
    }
}
