//! Record synchronisation.
//!
//! A [`RecordSync`] binds one [`Record`] to one remote node. The mode is
//! picked once, from the [`SyncConfig`], and held as a [`Strategy`]:
//!
//! - **Continuous**: the node's `value` event is subscribed; every remote
//!   value is applied locally and every local change is pushed as a merge
//!   update. `save`, `fetch` and `sync` do nothing but warn.
//! - **One-shot**: nothing is subscribed. `read` pulls the node once,
//!   `create`/`update` push the full attribute map once and `sync` pushes
//!   the diff against the last remote value. Local changes stay local
//!   until one of those is called.
//!
//! Both modes apply remote values the same way and share `destroy`.

use crate::diff::{diff, full_write};
use crate::events::{Emitter, RecordEvent};
use crate::operation::{dispatch, WriteOp};
use crate::record::Changes;
use crate::snapshot::PRIORITY_KEY;
use crate::store::{event_channel, Completion, EventStream, RemoteStore, SubscriptionId};
use crate::{
    error::Result, Attributes, EventKind, Record, RecordId, RemotePath, Snapshot, SyncConfig,
    SyncMode,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Mode-specific state, fixed at construction.
#[derive(Debug)]
enum Strategy {
    Continuous {
        subscription: Option<SubscriptionId>,
        stream: EventStream,
    },
    OneShot,
}

/// Owns the synchronisation lifecycle of one record.
pub struct RecordSync<S: RemoteStore> {
    store: Arc<S>,
    path: RemotePath,
    record: Record,
    strategy: Strategy,
    events: Emitter<RecordEvent>,
}

impl<S: RemoteStore> RecordSync<S> {
    /// Bind an empty record to the configured node.
    pub fn new(store: Arc<S>, config: &SyncConfig) -> Result<Self> {
        Self::with_record(store, config, Record::default())
    }

    /// Bind `record` to the configured node.
    ///
    /// Fails if the configured url does not resolve to a path.
    pub fn with_record(store: Arc<S>, config: &SyncConfig, mut record: Record) -> Result<Self> {
        let path = config.path()?;
        record.set_id_attribute(&config.id_attribute);

        let strategy = match config.mode {
            SyncMode::Continuous => {
                let (sink, stream) = event_channel();
                let subscription = store.subscribe(&path, EventKind::Value, sink)?;
                Strategy::Continuous {
                    subscription: Some(subscription),
                    stream,
                }
            }
            SyncMode::OneShot => Strategy::OneShot,
        };

        tracing::debug!(path = %path, mode = %config.mode, "record bound");
        Ok(Self {
            store,
            path,
            record,
            strategy,
            events: Emitter::new(),
        })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn path(&self) -> &RemotePath {
        &self.path
    }

    pub fn id(&self) -> Option<RecordId> {
        self.record.id()
    }

    pub fn mode(&self) -> SyncMode {
        match self.strategy {
            Strategy::Continuous { .. } => SyncMode::Continuous,
            Strategy::OneShot => SyncMode::OneShot,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.record.is_synced()
    }

    /// Receive local notifications for this record.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RecordEvent> {
        self.events.subscribe()
    }

    /// Process every store event queued so far. Returns how many ran.
    pub fn poll(&mut self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let event = match &mut self.strategy {
                Strategy::Continuous { stream, .. } => match stream.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                Strategy::OneShot => break,
            };
            tracing::trace!(path = %self.path, kind = %event.kind, "record event");
            if event.kind == EventKind::Value {
                self.apply_remote(&event.snapshot)?;
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Set attributes locally. In continuous mode the change is pushed.
    pub fn set(&mut self, attributes: Attributes) -> Result<Changes> {
        let changes = self.record.set(attributes)?;
        self.local_changed(&changes);
        Ok(changes)
    }

    /// Set one attribute locally.
    pub fn set_attr(&mut self, key: impl Into<String>, value: Value) -> Result<Changes> {
        let changes = self.record.set_attr(key, value)?;
        self.local_changed(&changes);
        Ok(changes)
    }

    /// Remove one attribute locally. In continuous mode a tombstone is pushed.
    pub fn unset(&mut self, key: &str) -> Result<Changes> {
        let changes = self.record.unset(key)?;
        self.local_changed(&changes);
        Ok(changes)
    }

    /// Make the local record reflect `snapshot`.
    ///
    /// Changes made here never travel back to the store. The first call
    /// applies declared defaults and emits [`RecordEvent::Sync`].
    pub fn apply_remote(&mut self, snapshot: &Snapshot) -> Result<()> {
        let value = snapshot.export_value();

        self.record.remote_changing_mut().enter();
        if let Some(key) = snapshot.key() {
            self.record.assign_id(key);
        }
        let outcome = self.record.merge_remote(&value);
        if let Ok(changes) = &outcome {
            self.local_changed(changes);
        }
        self.record.remote_changing_mut().exit();
        outcome?;

        if !value.is_object() {
            tracing::debug!(path = %self.path, "non-object remote value kept opaque");
        }

        if !self.record.is_synced() {
            self.record.mark_synced();
            let defaults = self.record.missing_defaults();
            if !defaults.is_empty() {
                self.set(defaults)?;
            }
            self.events.emit(RecordEvent::Sync);
        }
        Ok(())
    }

    /// Push a local change as a merge update.
    ///
    /// Skipped entirely while a remote value is being applied. Removed keys
    /// are sent as `null`; the identifier is never sent.
    pub fn push_local(&self, changes: &Changes) {
        if self.record.is_remote_changing() {
            tracing::trace!(path = %self.path, "skipping echo of remote value");
            return;
        }

        let patch: Attributes = changes
            .iter()
            .filter(|(k, _)| k.as_str() != self.record.id_attribute())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if patch.is_empty() {
            return;
        }

        let op = if patch.contains_key(PRIORITY_KEY) {
            full_write(self.path.clone(), &self.record.stored_attributes())
        } else {
            WriteOp::Update {
                path: self.path.clone(),
                patch,
            }
        };
        dispatch(self.store.as_ref(), op, None);
    }

    /// Read the node once and apply it.
    pub fn read(&mut self) -> Result<()> {
        let snapshot = self.store.read(&self.path)?;
        self.apply_remote(&snapshot)
    }

    /// Push the full attribute map once.
    pub fn create(&mut self, done: Option<Completion>) {
        self.push_full(done);
    }

    /// Push the full attribute map once.
    pub fn update(&mut self, done: Option<Completion>) {
        self.push_full(done);
    }

    /// One-shot [`RecordSync::read`]; a warning no-op in continuous mode.
    pub fn fetch(&mut self) -> Result<()> {
        if self.warn_if_continuous("fetch") {
            return Ok(());
        }
        self.read()
    }

    /// One-shot create-or-update; a warning no-op in continuous mode.
    pub fn save(&mut self, done: Option<Completion>) {
        if self.warn_if_continuous("save") {
            return;
        }
        self.push_full(done);
    }

    /// Push what changed since the last remote value; a warning no-op in
    /// continuous mode.
    pub fn sync(&mut self, done: Option<Completion>) {
        if self.warn_if_continuous("sync") {
            return;
        }

        let local = self.record.stored_attributes();
        let patch = diff(&self.record.last_remote_stored(), &local);
        match patch.into_write(self.path.clone(), &local) {
            Some(op) => {
                self.record.set_last_remote(Value::Object(local));
                dispatch(self.store.as_ref(), op, done);
            }
            None => {
                if let Some(done) = done {
                    done(Ok(()));
                }
            }
        }
    }

    /// Delete the node remotely. Listeners hear about it immediately.
    pub fn destroy(&mut self, done: Option<Completion>) {
        dispatch(
            self.store.as_ref(),
            WriteOp::Set {
                path: self.path.clone(),
                value: Value::Null,
            },
            done,
        );
        self.events.emit(RecordEvent::Destroy);
    }

    /// Drop the live subscription, if any.
    pub fn close(&mut self) {
        if let Strategy::Continuous { subscription, .. } = &mut self.strategy {
            if let Some(id) = subscription.take() {
                self.store.unsubscribe(id);
            }
        }
    }

    fn local_changed(&mut self, changes: &Changes) {
        if changes.is_empty() {
            return;
        }
        self.events
            .emit(RecordEvent::Change(changes.keys().cloned().collect()));
        if let Strategy::Continuous { .. } = self.strategy {
            self.push_local(changes);
        }
    }

    fn push_full(&mut self, done: Option<Completion>) {
        let local = self.record.stored_attributes();
        let op = full_write(self.path.clone(), &local);
        self.record.set_last_remote(Value::Object(local));
        dispatch(self.store.as_ref(), op, done);
    }

    fn warn_if_continuous(&self, op: &'static str) -> bool {
        let continuous = matches!(self.strategy, Strategy::Continuous { .. });
        if continuous {
            tracing::warn!(
                path = %self.path,
                op,
                "ignored: record is continuously synced"
            );
        }
        continuous
    }
}

impl<S: RemoteStore> Drop for RecordSync<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::attrs;
    use crate::{Error, MemoryStore};
    use serde_json::json;

    fn path(p: &str) -> RemotePath {
        RemotePath::parse(p).unwrap()
    }

    fn continuous(store: &Arc<MemoryStore>, url: &str) -> RecordSync<MemoryStore> {
        RecordSync::new(store.clone(), &SyncConfig::new(url)).unwrap()
    }

    fn one_shot(store: &Arc<MemoryStore>, url: &str) -> RecordSync<MemoryStore> {
        let config = SyncConfig::new(url).with_mode(SyncMode::OneShot);
        RecordSync::new(store.clone(), &config).unwrap()
    }

    #[test]
    fn construction_requires_path() {
        let store = Arc::new(MemoryStore::new());
        let result = RecordSync::new(store, &SyncConfig::new(""));
        assert!(matches!(result, Err(Error::MissingPath)));
    }

    #[test]
    fn continuous_applies_initial_value() {
        let store = Arc::new(MemoryStore::with_value(json!({"users": {"abc": {"name": "Ann"}}})));
        let mut sync = continuous(&store, "users/abc");
        let mut events = sync.subscribe();

        assert_eq!(sync.poll().unwrap(), 1);
        assert_eq!(sync.id(), Some("abc".to_string()));
        assert_eq!(sync.record().get("name"), Some(&json!("Ann")));
        assert!(sync.is_synced());

        assert_eq!(
            events.try_recv().unwrap(),
            RecordEvent::Change(vec!["name".to_string()])
        );
        assert_eq!(events.try_recv().unwrap(), RecordEvent::Sync);
        // Applying the remote value pushed nothing back.
        assert!(store.writes().is_empty());
    }

    #[test]
    fn continuous_pushes_local_changes() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1, "b": 2}})));
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();

        sync.set(attrs(json!({"a": 5}))).unwrap();
        sync.unset("b").unwrap();

        assert_eq!(
            store.writes(),
            vec![
                WriteOp::Update {
                    path: path("r"),
                    patch: attrs(json!({"a": 5})),
                },
                WriteOp::Update {
                    path: path("r"),
                    patch: attrs(json!({"b": null})),
                },
            ]
        );
        assert_eq!(store.value(&path("r")), json!({"a": 5}));

        // The echoes change nothing locally and trigger no further writes.
        sync.poll().unwrap();
        assert_eq!(store.writes().len(), 2);
        assert_eq!(sync.record().to_json(), json!({"id": "r", "a": 5}));
    }

    #[test]
    fn remote_removal_unsets_local_keys() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1, "b": 2}})));
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();

        store.set(&path("r"), json!({"a": 1}), None);
        store.clear_writes();
        sync.poll().unwrap();

        assert!(!sync.record().has("b"));
        assert_eq!(sync.id(), Some("r".to_string()));
        assert!(store.writes().is_empty());
    }

    #[test]
    fn identifier_is_never_tombstoned() {
        let store = Arc::new(MemoryStore::new());
        let sync = continuous(&store, "r");
        sync.push_local(&attrs(json!({"id": null, "gone": null})));

        assert_eq!(
            store.writes(),
            vec![WriteOp::Update {
                path: path("r"),
                patch: attrs(json!({"gone": null})),
            }]
        );
    }

    #[test]
    fn continuous_priority_change_replaces_node() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"val": 1}})));
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();

        sync.set_attr(".priority", json!(5)).unwrap();
        assert_eq!(
            store.writes(),
            vec![WriteOp::SetWithPriority {
                path: path("r"),
                value: json!({"val": 1}),
                priority: crate::Priority::Number(5.0),
            }]
        );
    }

    #[test]
    fn continuous_mode_ignores_explicit_sync() {
        let store = Arc::new(MemoryStore::new());
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();
        store.clear_writes();

        sync.save(None);
        sync.sync(None);
        assert!(sync.fetch().is_ok());
        assert!(store.writes().is_empty());
    }

    #[test]
    fn one_shot_never_pushes_on_its_own() {
        let store = Arc::new(MemoryStore::new());
        let mut sync = one_shot(&store, "r");

        for i in 0..5 {
            sync.set_attr("n", json!(i)).unwrap();
        }
        assert_eq!(sync.poll().unwrap(), 0);
        assert!(store.writes().is_empty());
        assert_eq!(store.subscription_count(), 0);
    }

    #[test]
    fn one_shot_read_and_update() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1}})));
        let mut sync = one_shot(&store, "r");

        sync.read().unwrap();
        assert_eq!(sync.record().get("a"), Some(&json!(1)));

        sync.set_attr("b", json!(2)).unwrap();
        sync.update(None);
        assert_eq!(
            store.writes(),
            vec![WriteOp::Set {
                path: path("r"),
                value: json!({"a": 1, "b": 2}),
            }]
        );
    }

    #[test]
    fn one_shot_sync_sends_diff() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1, "b": 2}})));
        let mut sync = one_shot(&store, "r");
        sync.fetch().unwrap();

        sync.unset("a").unwrap();
        sync.set_attr("b", json!(3)).unwrap();
        sync.sync(None);
        assert_eq!(
            store.writes(),
            vec![WriteOp::Update {
                path: path("r"),
                patch: attrs(json!({"a": null, "b": 3})),
            }]
        );

        // Nothing left to send.
        sync.sync(None);
        assert_eq!(store.writes().len(), 1);
    }

    #[test]
    fn sync_never_tombstones_stored_identifier() {
        let store = Arc::new(MemoryStore::new());
        let mut sync = one_shot(&store, "people/abc");
        let remote = json!({"id": "abc", "name": "A"});
        sync.apply_remote(&Snapshot::new(&path("people/abc"), remote)).unwrap();

        sync.sync(None);
        assert!(store.writes().is_empty());

        sync.set_attr("name", json!("B")).unwrap();
        sync.sync(None);
        assert_eq!(
            store.writes(),
            vec![WriteOp::Update {
                path: path("people/abc"),
                patch: attrs(json!({"name": "B"})),
            }]
        );
    }

    #[test]
    fn defaults_apply_after_first_sync_only() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"done": true}})));
        let record =
            Record::default().with_defaults(attrs(json!({"done": false, "title": "untitled"})));
        let mut sync =
            RecordSync::with_record(store.clone(), &SyncConfig::new("r"), record).unwrap();

        assert!(!sync.record().has("title"));
        sync.poll().unwrap();

        assert_eq!(sync.record().get("done"), Some(&json!(true)));
        assert_eq!(sync.record().get("title"), Some(&json!("untitled")));
    }

    #[test]
    fn destroy_notifies_immediately() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1}})));
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();
        let mut events = sync.subscribe();

        store.reject_writes_under(&path("r"), "read only");
        let (outcome, done) = crate::store::testing::capture();
        sync.destroy(Some(done));

        assert_eq!(events.try_recv().unwrap(), RecordEvent::Destroy);
        assert!(matches!(
            outcome.lock().unwrap().take(),
            Some(Err(Error::WriteRejected { .. }))
        ));
        assert_eq!(store.value(&path("r")), json!({"a": 1}));
    }

    #[test]
    fn malformed_remote_value_is_opaque() {
        let store = Arc::new(MemoryStore::with_value(json!({"r": {"a": 1}})));
        let mut sync = continuous(&store, "r");
        sync.poll().unwrap();

        store.set(&path("r"), json!(42), None);
        sync.poll().unwrap();

        assert_eq!(sync.record().get("a"), Some(&json!(1)));
        assert_eq!(sync.record().last_remote(), &json!(42));
    }

    #[test]
    fn close_unsubscribes() {
        let store = Arc::new(MemoryStore::new());
        let mut sync = continuous(&store, "r");
        assert_eq!(store.subscription_count(), 1);
        sync.close();
        assert_eq!(store.subscription_count(), 0);
        drop(sync);
        assert_eq!(store.subscription_count(), 0);
    }
}
