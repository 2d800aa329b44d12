//! Local change notification.
//!
//! Engines announce local state changes through an [`Emitter`]. Each call
//! to [`Emitter::subscribe`] hands out a fresh receiver; a receiver that is
//! dropped is forgotten on the next emit.

use crate::RecordId;
use tokio::sync::mpsc;

/// Notifications about a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Attributes changed, from either side.
    Change(Vec<String>),
    /// First remote value applied.
    Sync,
    /// Record destroyed locally.
    Destroy,
}

/// Notifications about a collection and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    Add(RecordId),
    Remove(RecordId),
    Change { id: RecordId, keys: Vec<String> },
    Reset,
    /// Initial contents received.
    Sync,
    Destroy(RecordId),
}

/// Broadcasts events to any number of receivers.
#[derive(Debug)]
pub struct Emitter<E> {
    sinks: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self { sinks: Vec::new() }
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.push(tx);
        rx
    }

    /// Send `event` to every live receiver.
    pub fn emit(&mut self, event: E) {
        self.sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.sinks.len()
    }
}
