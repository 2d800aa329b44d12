//! In-process remote store.
//!
//! [`MemoryStore`] keeps the whole tree in memory and implements
//! [`RemoteStore`] with the same event semantics a hosted hierarchical
//! store has: `value` fires with the current value on subscribe,
//! `child_added` replays existing children, nulls delete and empty objects
//! vanish. It backs the test suite and works as a local stand-in for a
//! real backend.
//!
//! Arrays are stored as opaque leaf values.

use crate::operation::WriteOp;
use crate::snapshot::PRIORITY_KEY;
use crate::store::{Completion, EventSink, RemoteStore, SubscriptionId};
use crate::{
    error::Result, key, Attributes, Error, EventKind, Priority, RemotePath, Snapshot, StoreEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    path: RemotePath,
    kind: EventKind,
    sink: EventSink,
}

#[derive(Debug, Default)]
struct Inner {
    root: Value,
    priorities: BTreeMap<RemotePath, Priority>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    writes: Vec<WriteOp>,
    rejections: Vec<(RemotePath, String)>,
    offline: bool,
}

type Delivery = (EventSink, StoreEvent);

/// A hierarchical store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `root` as its whole tree.
    pub fn with_value(root: Value) -> Self {
        let store = Self::new();
        store.inner.lock().root = normalize(root);
        store
    }

    /// Current value at `path`, bypassing connectivity checks.
    pub fn value(&self, path: &RemotePath) -> Value {
        let inner = self.inner.lock();
        lookup(&inner.root, path).cloned().unwrap_or(Value::Null)
    }

    /// Current priority of the node at `path`.
    pub fn priority(&self, path: &RemotePath) -> Option<Priority> {
        self.inner.lock().priorities.get(path).cloned()
    }

    /// Every write attempted so far, in order.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.inner.lock().writes.clone()
    }

    /// Forget the write log.
    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    /// Reject writes at or below `path` with `reason`.
    pub fn reject_writes_under(&self, path: &RemotePath, reason: impl Into<String>) {
        self.inner
            .lock()
            .rejections
            .push((path.clone(), reason.into()));
    }

    /// Accept all writes again.
    pub fn allow_writes(&self) {
        self.inner.lock().rejections.clear();
    }

    /// Simulate losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().offline = !connected;
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    fn write(&self, op: WriteOp, done: Option<Completion>) {
        let (deliveries, result) = {
            let mut inner = self.inner.lock();
            inner.writes.push(op.clone());
            match inner.check_writable(op.path()) {
                Ok(()) => match inner.apply(op) {
                    Ok(deliveries) => (deliveries, Ok(())),
                    Err(e) => (Vec::new(), Err(e)),
                },
                Err(e) => (Vec::new(), Err(e)),
            }
        };

        deliver(deliveries);
        if let Some(done) = done {
            done(result);
        }
    }
}

impl Inner {
    fn check_writable(&self, path: &RemotePath) -> Result<()> {
        if self.offline {
            return Err(Error::NotConnected);
        }
        match self.rejections.iter().find(|(p, _)| p.contains(path)) {
            Some((_, reason)) => Err(Error::WriteRejected {
                path: path.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn snapshot(&self, path: &RemotePath) -> Snapshot {
        let value = lookup(&self.root, path).cloned().unwrap_or(Value::Null);
        let children = self
            .priorities
            .iter()
            .filter(|(p, _)| p.parent().as_ref() == Some(path))
            .filter_map(|(p, prio)| p.key().map(|k| (k.to_string(), prio.clone())))
            .collect();
        Snapshot::new(path, value)
            .with_priority(self.priorities.get(path).cloned())
            .with_child_priorities(children)
    }

    fn apply(&mut self, op: WriteOp) -> Result<Vec<Delivery>> {
        // Validate before touching the tree so a bad patch leaves no trace.
        let targets = match &op {
            WriteOp::Update { path, patch } => patch
                .keys()
                .map(|k| path.child(k))
                .collect::<Result<Vec<_>>>()?,
            other => vec![other.path().clone()],
        };

        let before: BTreeMap<RemotePath, Snapshot> = self
            .subscriptions
            .iter()
            .filter(|s| s.path.overlaps(op.path()))
            .map(|s| (s.path.clone(), self.snapshot(&s.path)))
            .collect();

        match op {
            WriteOp::Set { path, value } => {
                let (value, priority) = split_priority(value);
                self.replace(&path, value, priority);
            }
            WriteOp::SetWithPriority {
                path,
                value,
                priority,
            } => {
                let (value, _) = split_priority(value);
                self.replace(&path, value, Some(priority));
            }
            WriteOp::Update { patch, .. } => {
                for (target, (_, value)) in targets.iter().zip(patch) {
                    let (value, priority) = split_priority(value);
                    self.replace(target, value, priority);
                }
            }
        }

        let root = &self.root;
        self.priorities
            .retain(|p, _| lookup(root, p).is_some_and(|v| !v.is_null()));

        let mut deliveries = Vec::new();
        for sub in &self.subscriptions {
            let Some(old) = before.get(&sub.path) else {
                continue;
            };
            let new = self.snapshot(&sub.path);
            for event in events_between(sub.kind, old, &new) {
                deliveries.push((sub.sink.clone(), event));
            }
        }
        Ok(deliveries)
    }

    fn replace(&mut self, path: &RemotePath, value: Value, priority: Option<Priority>) {
        self.priorities.retain(|p, _| !path.contains(p));
        let value = normalize(value);
        let exists = !value.is_null();
        put(&mut self.root, path.segments(), value);
        if let (true, Some(priority)) = (exists, priority) {
            self.priorities.insert(path.clone(), priority);
        }
    }

    fn initial_events(&self, path: &RemotePath, kind: EventKind) -> Vec<StoreEvent> {
        let current = self.snapshot(path);
        match kind {
            EventKind::Value => vec![StoreEvent {
                kind,
                snapshot: current,
                prev_child_key: None,
            }],
            EventKind::ChildAdded => {
                let empty = Snapshot::new(path, Value::Null);
                events_between(kind, &empty, &current)
            }
            _ => Vec::new(),
        }
    }
}

impl RemoteStore for MemoryStore {
    fn read(&self, path: &RemotePath) -> Result<Snapshot> {
        let inner = self.inner.lock();
        if inner.offline {
            return Err(Error::NotConnected);
        }
        Ok(inner.snapshot(path))
    }

    fn subscribe(
        &self,
        path: &RemotePath,
        kind: EventKind,
        sink: EventSink,
    ) -> Result<SubscriptionId> {
        let (id, deliveries) = {
            let mut inner = self.inner.lock();
            inner.next_subscription += 1;
            let id = SubscriptionId(inner.next_subscription);
            let deliveries: Vec<Delivery> = inner
                .initial_events(path, kind)
                .into_iter()
                .map(|event| (sink.clone(), event))
                .collect();
            inner.subscriptions.push(Subscription {
                id,
                path: path.clone(),
                kind,
                sink,
            });
            (id, deliveries)
        };

        tracing::trace!(path = %path, %kind, id = id.0, "subscribed");
        deliver(deliveries);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().subscriptions.retain(|s| s.id != id);
    }

    fn set(&self, path: &RemotePath, value: Value, done: Option<Completion>) {
        self.write(
            WriteOp::Set {
                path: path.clone(),
                value,
            },
            done,
        );
    }

    fn update(&self, path: &RemotePath, patch: Attributes, done: Option<Completion>) {
        self.write(
            WriteOp::Update {
                path: path.clone(),
                patch,
            },
            done,
        );
    }

    fn set_with_priority(
        &self,
        path: &RemotePath,
        value: Value,
        priority: Priority,
        done: Option<Completion>,
    ) {
        self.write(
            WriteOp::SetWithPriority {
                path: path.clone(),
                value,
                priority,
            },
            done,
        );
    }

    fn generate_key(&self, _path: &RemotePath) -> String {
        key::generate_key()
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (sink, event) in deliveries {
        // A dropped receiver just means nobody is listening any more.
        let _ = sink.send(event);
    }
}

fn events_between(kind: EventKind, old: &Snapshot, new: &Snapshot) -> Vec<StoreEvent> {
    if kind == EventKind::Value {
        if old == new {
            return Vec::new();
        }
        return vec![StoreEvent {
            kind,
            snapshot: new.clone(),
            prev_child_key: None,
        }];
    }

    let old_children: BTreeMap<String, Snapshot> = old
        .children()
        .into_iter()
        .filter_map(|c| c.key().map(str::to_string).map(|k| (k, c)))
        .collect();
    let new_children = new.children();

    let mut events = Vec::new();
    if kind == EventKind::ChildRemoved {
        for (key, child) in &old_children {
            if new.value().get(key.as_str()).is_none() {
                events.push(StoreEvent {
                    kind,
                    snapshot: child.clone(),
                    prev_child_key: None,
                });
            }
        }
        return events;
    }

    let mut prev: Option<String> = None;
    for child in new_children {
        let key = child.key().unwrap_or_default().to_string();
        let fire = match (kind, old_children.get(&key)) {
            (EventKind::ChildAdded, None) => true,
            (EventKind::ChildChanged, Some(before)) => before != &child,
            (EventKind::ChildMoved, Some(before)) => before.priority() != child.priority(),
            _ => false,
        };
        if fire {
            events.push(StoreEvent {
                kind,
                snapshot: child,
                prev_child_key: prev.clone(),
            });
        }
        prev = Some(key);
    }
    events
}

fn lookup<'a>(root: &'a Value, path: &RemotePath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| node.get(segment.as_str()))
}

fn put(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Attributes::new());
    }

    let now_empty = match node {
        Value::Object(map) => {
            let child = map.entry(head.clone()).or_insert(Value::Null);
            put(child, rest, value);
            if child.is_null() {
                map.remove(head.as_str());
            }
            map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        *node = Value::Null;
    }
}

/// Drop nulls and empty objects, recursively.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Attributes = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// Pull a top-level `.priority` out of an object value.
fn split_priority(value: Value) -> (Value, Option<Priority>) {
    match value {
        Value::Object(mut map) => {
            let priority = map
                .remove(PRIORITY_KEY)
                .and_then(|p| Priority::from_value(&p));
            (Value::Object(map), priority)
        }
        other => (other, None),
    }
}
