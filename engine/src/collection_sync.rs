//! Collection synchronisation.
//!
//! A [`CollectionSync`] binds a [`Collection`] to the children of one
//! remote node. In continuous mode it subscribes to the four child events
//! and, once, to `value` to learn when the initial contents have arrived.
//! Local adds and removes are written to the store and take effect locally
//! when their echo comes back; a silent operation registers the echo it
//! expects so that listeners are not told about it.
//!
//! In one-shot mode nothing is subscribed: `fetch` replaces the members
//! with the node's children, membership changes stay local and member
//! changes are pushed by `save_member` or `sync`.

use crate::diff::{diff, full_write};
use crate::echo::{EchoKind, EchoSuppressor};
use crate::events::{CollectionEvent, Emitter};
use crate::operation::{dispatch, WriteOp};
use crate::record::Changes;
use crate::store::{event_channel, Completion, EventStream, RemoteStore, SubscriptionId};
use crate::{
    error::Result, Attributes, Collection, Error, EventKind, Record, RecordId, RemotePath,
    Snapshot, StoreEvent, SyncConfig, SyncMode,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options for membership changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Apply without notifying listeners.
    pub silent: bool,
}

impl SyncOptions {
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

#[derive(Debug)]
enum Strategy {
    Continuous {
        subscriptions: Vec<SubscriptionId>,
        /// Dropped after the first `value` event.
        initial: Option<SubscriptionId>,
        stream: EventStream,
    },
    OneShot,
}

/// Owns the synchronisation lifecycle of one collection.
pub struct CollectionSync<S: RemoteStore> {
    store: Arc<S>,
    path: RemotePath,
    id_attribute: String,
    members: Collection,
    strategy: Strategy,
    echoes: Arc<Mutex<EchoSuppressor>>,
    events: Emitter<CollectionEvent>,
    synced: bool,
}

impl<S: RemoteStore> CollectionSync<S> {
    /// Bind an empty collection ordered by identifier.
    pub fn new(store: Arc<S>, config: &SyncConfig) -> Result<Self> {
        Self::with_collection(store, config, Collection::new())
    }

    /// Bind `members`, keeping its comparator.
    pub fn with_collection(
        store: Arc<S>,
        config: &SyncConfig,
        members: Collection,
    ) -> Result<Self> {
        let path = config.path()?;

        let strategy = match config.mode {
            SyncMode::Continuous => {
                let (sink, stream) = event_channel();
                let kinds = EventKind::CHILD_EVENTS.into_iter().chain([EventKind::Value]);
                let mut subscriptions = Vec::with_capacity(5);
                for kind in kinds {
                    match store.subscribe(&path, kind, sink.clone()) {
                        Ok(id) => subscriptions.push(id),
                        Err(e) => {
                            for id in subscriptions {
                                store.unsubscribe(id);
                            }
                            return Err(e);
                        }
                    }
                }
                let initial = subscriptions.pop();
                Strategy::Continuous {
                    subscriptions,
                    initial,
                    stream,
                }
            }
            SyncMode::OneShot => Strategy::OneShot,
        };

        tracing::debug!(path = %path, mode = %config.mode, "collection bound");
        Ok(Self {
            store,
            path,
            id_attribute: config.id_attribute.clone(),
            members,
            strategy,
            echoes: Arc::new(Mutex::new(EchoSuppressor::new())),
            events: Emitter::new(),
            synced: false,
        })
    }

    pub fn path(&self) -> &RemotePath {
        &self.path
    }

    pub fn members(&self) -> &Collection {
        &self.members
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.members.get(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the initial contents have been received.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn mode(&self) -> SyncMode {
        match self.strategy {
            Strategy::Continuous { .. } => SyncMode::Continuous,
            Strategy::OneShot => SyncMode::OneShot,
        }
    }

    /// Whether a silent operation on `id` is still waiting for its echo.
    pub fn is_echo_pending(&self, id: &str) -> bool {
        let echoes = self.echoes.lock();
        echoes.is_pending(EchoKind::Add, id) || echoes.is_pending(EchoKind::Remove, id)
    }

    /// Receive local notifications for this collection.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CollectionEvent> {
        self.events.subscribe()
    }

    /// Process every store event queued so far. Returns how many ran.
    ///
    /// Stops at the first consistency violation.
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
            self.handle(event)?;
            processed += 1;
        }
        Ok(processed)
    }

    fn handle(&mut self, event: StoreEvent) -> Result<()> {
        tracing::trace!(
            path = %self.path,
            kind = %event.kind,
            key = ?event.snapshot.key(),
            "collection event"
        );
        match event.kind {
            EventKind::Value => {
                self.on_initial_value();
                Ok(())
            }
            EventKind::ChildAdded => self.on_child_added(&event.snapshot),
            EventKind::ChildChanged => self.on_child_changed(&event.snapshot),
            EventKind::ChildRemoved => {
                self.on_child_removed(&event.snapshot);
                Ok(())
            }
            EventKind::ChildMoved => {
                self.members.sort();
                Ok(())
            }
        }
    }

    fn on_initial_value(&mut self) {
        if self.synced {
            return;
        }
        if let Strategy::Continuous { initial, .. } = &mut self.strategy {
            if let Some(id) = initial.take() {
                self.store.unsubscribe(id);
            }
        }
        self.synced = true;
        self.events.emit(CollectionEvent::Sync);
    }

    fn on_child_added(&mut self, snapshot: &Snapshot) -> Result<()> {
        let Some(key) = snapshot.key() else {
            return Ok(());
        };
        let silent = self.echoes.lock().consume(EchoKind::Add, key);
        if silent {
            tracing::debug!(path = %self.path, id = key, "suppressed add echo");
        }

        // A member we already hold, e.g. re-added under the same id.
        if self.members.contains(key) {
            return self.apply_member_value(key, &snapshot.export_value(), silent);
        }

        let record = self.record_from(snapshot);
        let id = record.id().unwrap_or_else(|| key.to_string());
        if self.members.insert(record)? && !silent {
            self.events.emit(CollectionEvent::Add(id));
        }
        Ok(())
    }

    fn on_child_changed(&mut self, snapshot: &Snapshot) -> Result<()> {
        let Some(key) = snapshot.key() else {
            return Ok(());
        };
        if !self.members.contains(key) {
            tracing::error!(
                path = %self.path,
                id = key,
                "child_changed for a record that was never added"
            );
            return Err(Error::RecordNotFound(key.to_string()));
        }
        self.apply_member_value(key, &snapshot.export_value(), false)
    }

    fn on_child_removed(&mut self, snapshot: &Snapshot) {
        let Some(key) = snapshot.key() else {
            return;
        };
        let silent = self.echoes.lock().consume(EchoKind::Remove, key);
        if silent {
            tracing::debug!(path = %self.path, id = key, "suppressed remove echo");
        }
        if self.members.remove(key).is_some() && !silent {
            self.events.emit(CollectionEvent::Remove(key.to_string()));
        }
    }

    /// Merge a remote value into an existing member under its
    /// remote-changing flag.
    fn apply_member_value(&mut self, id: &str, value: &Value, silent: bool) -> Result<()> {
        let Some(record) = self.members.get_mut(id) else {
            return Err(Error::RecordNotFound(id.to_string()));
        };

        record.remote_changing_mut().enter();
        let outcome = record.merge_remote(value);
        record.remote_changing_mut().exit();

        let changes = outcome?;
        if !changes.is_empty() && !silent {
            self.events.emit(change_event(id, &changes));
        }
        self.members.sort();
        Ok(())
    }

    /// Add records. In continuous mode each is written in full at
    /// `path/id` and joins the collection when its echo arrives.
    ///
    /// Records without an identifier get one from the store. Returns the
    /// identifiers in input order.
    pub fn add(
        &mut self,
        records: impl IntoIterator<Item = Record>,
        options: SyncOptions,
    ) -> Result<Vec<RecordId>> {
        records
            .into_iter()
            .map(|record| self.add_one(record, options, None))
            .collect()
    }

    /// Build a record from raw attributes and add it.
    pub fn create(
        &mut self,
        attributes: Attributes,
        options: SyncOptions,
        done: Option<Completion>,
    ) -> Result<RecordId> {
        self.add_one(Record::new(attributes), options, done)
    }

    fn add_one(
        &mut self,
        mut record: Record,
        options: SyncOptions,
        done: Option<Completion>,
    ) -> Result<RecordId> {
        record.set_id_attribute(&self.id_attribute);
        let id = match record.id() {
            Some(id) => id,
            None => {
                let key = self.store.generate_key(&self.path);
                record.assign_id(&key);
                key
            }
        };
        let path = self.path.child(&id)?;

        if !self.is_continuous() {
            self.insert_local(record, options)?;
            if let Some(done) = done {
                done(Ok(()));
            }
            return Ok(id);
        }

        // A member we already hold echoes as a change, if at all, unless
        // its removal is still on the way.
        let suppress = options.silent && {
            let mut echoes = self.echoes.lock();
            let echoes_as_add =
                !self.members.contains(&id) || echoes.is_pending(EchoKind::Remove, &id);
            if echoes_as_add {
                echoes.expect(EchoKind::Add, &id);
            }
            echoes_as_add
        };
        let done = self.withdraw_on_failure(EchoKind::Add, &id, suppress, done);
        dispatch(
            self.store.as_ref(),
            full_write(path, &record.stored_attributes()),
            done,
        );
        Ok(id)
    }

    fn insert_local(&mut self, record: Record, options: SyncOptions) -> Result<()> {
        let id = record.id().ok_or(Error::MissingIdentifier)?;
        if let Some(existing) = self.members.get_mut(&id) {
            let changes = existing.set(record.attributes().clone())?;
            if !changes.is_empty() && !options.silent {
                self.events.emit(change_event(&id, &changes));
            }
            self.members.sort();
        } else if self.members.insert(record)? && !options.silent {
            self.events.emit(CollectionEvent::Add(id));
        }
        Ok(())
    }

    /// Remove records by identifier. In continuous mode each child is
    /// deleted remotely and leaves the collection when its echo arrives.
    pub fn remove<I>(&mut self, ids: I, options: SyncOptions) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref();
            let path = self.path.child(id)?;

            if !self.is_continuous() {
                if self.members.remove(id).is_some() && !options.silent {
                    self.events.emit(CollectionEvent::Remove(id.to_string()));
                }
                continue;
            }

            // Deleting a child we never saw produces no echo.
            let suppress = options.silent && self.members.contains(id);
            if suppress {
                self.echoes.lock().expect(EchoKind::Remove, id);
            }
            let done = self.withdraw_on_failure(EchoKind::Remove, id, suppress, None);
            dispatch(
                self.store.as_ref(),
                WriteOp::Set {
                    path,
                    value: Value::Null,
                },
                done,
            );
        }
        Ok(())
    }

    /// Replace every member: the current ones are removed and `records`
    /// added, both silently, then a single [`CollectionEvent::Reset`] is
    /// emitted unless `options` is silent.
    pub fn reset(
        &mut self,
        records: impl IntoIterator<Item = Record>,
        options: SyncOptions,
    ) -> Result<Vec<RecordId>> {
        let current = self.members.ids();
        self.remove(&current, SyncOptions::silent())?;
        let added = self.add(records, SyncOptions::silent())?;
        if !options.silent {
            self.events.emit(CollectionEvent::Reset);
        }
        Ok(added)
    }

    /// Set attributes on a member. In continuous mode the diff against the
    /// member's last remote value is pushed.
    pub fn set_member(&mut self, id: &str, attributes: Attributes) -> Result<Changes> {
        let continuous = self.is_continuous();
        let record = self
            .members
            .get_mut(id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;

        let changes = record.set(attributes)?;
        if !changes.is_empty() {
            self.events.emit(change_event(id, &changes));
            if continuous {
                push_member(self.store.as_ref(), &self.path, record, None)?;
            }
            self.members.sort();
        }
        Ok(changes)
    }

    /// Remove one attribute from a member.
    pub fn unset_member(&mut self, id: &str, key: &str) -> Result<Changes> {
        let mut attributes = Attributes::new();
        attributes.insert(key.to_string(), Value::Null);
        self.set_member(id, attributes)
    }

    /// Delete a member remotely. Listeners hear about it immediately; in
    /// continuous mode the member leaves when the removal echoes back.
    pub fn destroy_member(&mut self, id: &str, done: Option<Completion>) -> Result<()> {
        let path = self.path.child(id)?;
        dispatch(
            self.store.as_ref(),
            WriteOp::Set {
                path,
                value: Value::Null,
            },
            done,
        );
        self.events.emit(CollectionEvent::Destroy(id.to_string()));
        if !self.is_continuous() {
            self.members.remove(id);
        }
        Ok(())
    }

    /// Read the node once and make the members match its children.
    ///
    /// A warning no-op in continuous mode.
    pub fn fetch(&mut self) -> Result<()> {
        if self.warn_if_continuous("fetch") {
            return Ok(());
        }

        let snapshot = self.store.read(&self.path)?;
        self.members.clear();
        for child in snapshot.children() {
            let record = self.record_from(&child);
            self.members.insert(record)?;
        }
        self.synced = true;
        self.events.emit(CollectionEvent::Reset);
        self.events.emit(CollectionEvent::Sync);
        Ok(())
    }

    /// Push one member's diff. A warning no-op in continuous mode.
    pub fn save_member(&mut self, id: &str, done: Option<Completion>) -> Result<()> {
        if self.warn_if_continuous("save_member") {
            return Ok(());
        }
        let record = self
            .members
            .get_mut(id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        push_member(self.store.as_ref(), &self.path, record, done).map(|_| ())
    }

    /// Push every member's diff. Returns how many members had changes.
    ///
    /// A warning no-op in continuous mode.
    pub fn sync(&mut self) -> Result<usize> {
        if self.warn_if_continuous("sync") {
            return Ok(0);
        }
        let mut pushed = 0;
        for id in self.members.ids() {
            let Some(record) = self.members.get_mut(&id) else {
                continue;
            };
            if push_member(self.store.as_ref(), &self.path, record, None)? {
                pushed += 1;
            }
        }
        Ok(pushed)
    }

    /// Drop every live subscription.
    pub fn close(&mut self) {
        if let Strategy::Continuous {
            subscriptions,
            initial,
            ..
        } = &mut self.strategy
        {
            for id in subscriptions.drain(..).chain(initial.take()) {
                self.store.unsubscribe(id);
            }
        }
    }

    fn is_continuous(&self) -> bool {
        matches!(self.strategy, Strategy::Continuous { .. })
    }

    /// Build a member from a child snapshot, identified by its key unless
    /// the value names one.
    fn record_from(&self, snapshot: &Snapshot) -> Record {
        let value = snapshot.export_value();
        let mut record = Record::from_value(value.clone()).with_id_attribute(&self.id_attribute);
        if let Some(key) = snapshot.key() {
            record.assign_id(key);
        }
        record.set_last_remote(value);
        record.mark_synced();
        record
    }

    /// Wrap `done` so a failed suppressed write stops waiting for its echo.
    fn withdraw_on_failure(
        &self,
        kind: EchoKind,
        id: &str,
        suppressed: bool,
        done: Option<Completion>,
    ) -> Option<Completion> {
        if !suppressed {
            return done;
        }
        let echoes = Arc::clone(&self.echoes);
        let id = id.to_string();
        let wrapped: Completion = Box::new(move |result: Result<()>| {
            if result.is_err() {
                echoes.lock().withdraw(kind, &id);
            }
            if let Some(done) = done {
                done(result);
            }
        });
        Some(wrapped)
    }

    fn warn_if_continuous(&self, op: &'static str) -> bool {
        let continuous = self.is_continuous();
        if continuous {
            tracing::warn!(
                path = %self.path,
                op,
                "ignored: collection is continuously synced"
            );
        }
        continuous
    }
}

impl<S: RemoteStore> Drop for CollectionSync<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Push what changed on `record` since its last remote value.
///
/// Skipped while a remote value is being applied. Returns whether a write
/// was issued; `done` runs either way.
fn push_member<S: RemoteStore + ?Sized>(
    store: &S,
    base: &RemotePath,
    record: &mut Record,
    done: Option<Completion>,
) -> Result<bool> {
    if record.is_remote_changing() {
        tracing::trace!(id = ?record.id(), "skipping echo of remote value");
        return Ok(false);
    }
    let id = record.id().ok_or(Error::MissingIdentifier)?;
    let path = base.child(&id)?;

    let local = record.stored_attributes();
    let patch = diff(&record.last_remote_stored(), &local);
    match patch.into_write(path, &local) {
        Some(op) => {
            record.set_last_remote(Value::Object(local));
            dispatch(store, op, done);
            Ok(true)
        }
        None => {
            if let Some(done) = done {
                done(Ok(()));
            }
            Ok(false)
        }
    }
}

fn change_event(id: &str, changes: &Changes) -> CollectionEvent {
    CollectionEvent::Change {
        id: id.to_string(),
        keys: changes.keys().cloned().collect(),
    }
}
