//! The remote store contract.
//!
//! The store is hierarchical, addressed by [`RemotePath`], and emits ordered
//! per-path events. Transport, authentication and wire protocol live behind
//! this trait, so the engines only ever see snapshots and write outcomes.

use crate::{error::Result, Attributes, EventKind, Priority, RemotePath, Snapshot, StoreEvent};
use serde_json::Value;
use tokio::sync::mpsc;

/// Callback receiving the outcome of a write.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Where a subscription delivers its events.
pub type EventSink = mpsc::UnboundedSender<StoreEvent>;

/// Receiving half of an [`EventSink`].
pub type EventStream = mpsc::UnboundedReceiver<StoreEvent>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// A hierarchical, event-emitting key-value store.
///
/// Writes are asynchronous: the completion may run before or after the
/// events the write provokes reach their subscribers, and callers must not
/// assume either order.
pub trait RemoteStore: Send + Sync {
    /// Read the current value of a node once.
    fn read(&self, path: &RemotePath) -> Result<Snapshot>;

    /// Deliver events of `kind` at `path` to `sink`.
    fn subscribe(&self, path: &RemotePath, kind: EventKind, sink: EventSink)
        -> Result<SubscriptionId>;

    /// Stop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Replace the node at `path`; `null` deletes it.
    fn set(&self, path: &RemotePath, value: Value, done: Option<Completion>);

    /// Patch the node at `path`; omitted keys are untouched.
    fn update(&self, path: &RemotePath, patch: Attributes, done: Option<Completion>);

    /// Replace the node at `path` together with its priority.
    fn set_with_priority(
        &self,
        path: &RemotePath,
        value: Value,
        priority: Priority,
        done: Option<Completion>,
    );

    /// Produce a globally unique key for a new child of `path`.
    fn generate_key(&self, path: &RemotePath) -> String;
}

/// Create a connected sink/stream pair.
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// Wrap a caller's completion so failures are logged before being passed on.
pub(crate) fn logged(path: &RemotePath, op: &'static str, done: Option<Completion>) -> Completion {
    let path = path.clone();
    Box::new(move |result: Result<()>| {
        if let Err(e) = &result {
            tracing::warn!(path = %path, op, error = %e, "remote write failed");
        }
        if let Some(done) = done {
            done(result);
        }
    })
}
