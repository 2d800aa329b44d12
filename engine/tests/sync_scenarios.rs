//! End-to-end sync scenarios for tether-engine
//!
//! Every test runs the engines against an in-memory store and pumps events
//! explicitly with `poll`.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tether_engine::{
    diff, Attributes, Collection, CollectionEvent, CollectionSync, Completion, Error, MemoryStore,
    Priority, Record, RecordEvent, RecordSync, RemotePath, RemoteStore, Result, Snapshot,
    SyncConfig, SyncMode, SyncOptions, WriteOp,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn path(p: &str) -> RemotePath {
    RemotePath::parse(p).unwrap()
}

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn capture() -> (Arc<Mutex<Option<Result<()>>>>, Completion) {
    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let done: Completion = Box::new(move |r: Result<()>| *slot.lock().unwrap() = Some(r));
    (outcome, done)
}

fn one_shot(url: &str) -> SyncConfig {
    SyncConfig::new(url).with_mode(SyncMode::OneShot)
}

// ============================================================================
// Record Sync
// ============================================================================

#[test]
fn construction_without_path_fails() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());

    assert!(matches!(
        RecordSync::new(store.clone(), &SyncConfig::new("")),
        Err(Error::MissingPath)
    ));
    assert!(matches!(
        CollectionSync::new(store.clone(), &SyncConfig::new("bad.path")),
        Err(Error::InvalidPath(_))
    ));
    assert_eq!(store.subscription_count(), 0);
}

#[test]
fn identifier_assignment_pushes_nothing() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut record = RecordSync::new(store.clone(), &one_shot("people/abc")).unwrap();
    assert_eq!(record.id(), None);

    let snapshot = Snapshot::new(&path("people/abc"), json!({"name": "Abe"}));
    record.apply_remote(&snapshot).unwrap();

    assert_eq!(record.id(), Some("abc".to_string()));
    assert!(!record.record().changed().contains_key("id"));
    record.sync(None);
    assert!(store.writes().is_empty());
}

#[test]
fn continuous_record_round_trip() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_value(json!({
        "people": {"abc": {"name": "Abe", "age": 40}}
    })));
    let mut record = RecordSync::new(store.clone(), &SyncConfig::new("people/abc")).unwrap();
    let mut events = record.subscribe();
    record.poll().unwrap();
    assert_eq!(events.try_recv().unwrap(), RecordEvent::Change(vec!["age".into(), "name".into()]));
    assert_eq!(events.try_recv().unwrap(), RecordEvent::Sync);

    // A second writer edits the node; the record follows without echoing.
    store.update(&path("people/abc"), attrs(json!({"age": 41, "name": null})), None);
    store.clear_writes();
    record.poll().unwrap();
    assert_eq!(record.record().to_json(), json!({"id": "abc", "age": 41}));
    assert!(store.writes().is_empty());

    // Local edits travel the other way.
    record.set_attr("city", json!("Oslo")).unwrap();
    record.poll().unwrap();
    assert_eq!(store.value(&path("people/abc")), json!({"age": 41, "city": "Oslo"}));
    assert_eq!(store.writes().len(), 1);
}

#[test]
fn one_shot_record_stays_local_until_synced() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_value(json!({"notes": {"n1": {"text": "hi"}}})));
    let mut note = RecordSync::new(store.clone(), &one_shot("notes/n1")).unwrap();
    note.fetch().unwrap();

    for i in 0..10 {
        note.set_attr("text", json!(format!("draft {i}"))).unwrap();
    }
    assert!(store.writes().is_empty());

    let (outcome, done) = capture();
    note.sync(Some(done));
    assert_eq!(outcome.lock().unwrap().take(), Some(Ok(())));
    assert_eq!(
        store.writes(),
        vec![WriteOp::Update {
            path: path("notes/n1"),
            patch: attrs(json!({"text": "draft 9"})),
        }]
    );
}

#[test]
fn one_shot_save_replaces_node() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_value(json!({"notes": {"n1": {"old": true}}})));
    let record = Record::new(attrs(json!({"text": "fresh", ".priority": 2})));
    let mut note = RecordSync::with_record(store.clone(), &one_shot("notes/n1"), record).unwrap();

    note.save(None);
    assert_eq!(store.value(&path("notes/n1")), json!({"text": "fresh"}));
    assert_eq!(store.priority(&path("notes/n1")), Some(Priority::Number(2.0)));
}

#[test]
fn write_failure_is_reported_not_rolled_back() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut note = RecordSync::new(store.clone(), &one_shot("notes/n1")).unwrap();
    store.set_connected(false);

    note.set_attr("text", json!("unsaved")).unwrap();
    let (outcome, done) = capture();
    note.update(Some(done));

    assert_eq!(outcome.lock().unwrap().take(), Some(Err(Error::NotConnected)));
    assert_eq!(note.record().get("text"), Some(&json!("unsaved")));
}

#[test]
fn defaults_never_clobber_remote_values() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_value(json!({"tasks": {"t": {"done": true}}})));
    let record = Record::default().with_defaults(attrs(json!({"done": false, "owner": "nobody"})));
    let mut task =
        RecordSync::with_record(store.clone(), &SyncConfig::new("tasks/t"), record).unwrap();

    assert!(!task.record().has("done"));
    assert!(!task.record().has("owner"));

    task.poll().unwrap();
    assert_eq!(task.record().get("done"), Some(&json!(true)));
    assert_eq!(task.record().get("owner"), Some(&json!("nobody")));
    assert_eq!(
        store.value(&path("tasks/t")),
        json!({"done": true, "owner": "nobody"})
    );
}

#[test]
fn continuous_record_ignores_explicit_operations() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut record = RecordSync::new(store.clone(), &SyncConfig::new("x")).unwrap();
    record.poll().unwrap();

    let (outcome, done) = capture();
    record.save(Some(done));
    record.sync(None);
    record.fetch().unwrap();

    assert!(store.writes().is_empty());
    assert_eq!(*outcome.lock().unwrap(), None);
}

// ============================================================================
// Collection Sync
// ============================================================================

#[test]
fn silent_add_echo_does_not_double_notify() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut list = CollectionSync::new(store.clone(), &SyncConfig::new("items")).unwrap();
    list.poll().unwrap();
    let mut events = list.subscribe();

    list.add(
        vec![Record::new(attrs(json!({"id": "x", "name": "a"})))],
        SyncOptions::silent(),
    )
    .unwrap();

    assert_eq!(
        store.writes(),
        vec![WriteOp::Set {
            path: path("items/x"),
            value: json!({"name": "a"}),
        }]
    );

    list.poll().unwrap();
    assert!(events.try_recv().is_err());
    assert_eq!(list.len(), 1);
    assert_eq!(list.get("x").unwrap().get("name"), Some(&json!("a")));
}

#[test]
fn two_collections_on_one_path_converge() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig::new("https://example.test/lists/groceries");
    let mut left = CollectionSync::new(store.clone(), &config).unwrap();
    let mut right = CollectionSync::new(store.clone(), &config).unwrap();
    left.poll().unwrap();
    right.poll().unwrap();

    let id = left
        .create(attrs(json!({"item": "milk"})), SyncOptions::default(), None)
        .unwrap();
    left.poll().unwrap();
    right.poll().unwrap();
    assert_eq!(right.get(&id).unwrap().get("item"), Some(&json!("milk")));

    right.set_member(&id, attrs(json!({"qty": 2}))).unwrap();
    left.poll().unwrap();
    right.poll().unwrap();
    assert_eq!(left.get(&id).unwrap().get("qty"), Some(&json!(2)));

    left.destroy_member(&id, None).unwrap();
    left.poll().unwrap();
    right.poll().unwrap();
    assert!(left.is_empty());
    assert!(right.is_empty());
}

#[test]
fn priority_ordering_follows_remote() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.set_with_priority(&path("queue/a"), json!({"n": 1}), Priority::Number(3.0), None);
    store.set_with_priority(&path("queue/b"), json!({"n": 2}), Priority::Number(1.0), None);
    store.set_with_priority(&path("queue/c"), json!({"n": 3}), Priority::Number(2.0), None);

    let members = Collection::new().with_comparator(tether_engine::by_priority);
    let mut queue =
        CollectionSync::with_collection(store.clone(), &SyncConfig::new("queue"), members).unwrap();
    queue.poll().unwrap();
    assert_eq!(queue.members().ids(), vec!["b", "c", "a"]);

    queue.set_member("a", attrs(json!({".priority": 0}))).unwrap();
    queue.poll().unwrap();
    assert_eq!(queue.members().ids(), vec!["a", "b", "c"]);
    assert_eq!(store.priority(&path("queue/a")), Some(Priority::Number(0.0)));
}

#[test]
fn one_shot_collection_fetch_and_sync() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_value(json!({"tags": {"red": {"n": 1}}})));
    let mut tags = CollectionSync::new(store.clone(), &one_shot("tags")).unwrap();
    let mut events = tags.subscribe();

    tags.fetch().unwrap();
    assert!(tags.is_synced());
    assert_eq!(events.try_recv().unwrap(), CollectionEvent::Reset);
    assert_eq!(events.try_recv().unwrap(), CollectionEvent::Sync);

    tags.set_member("red", attrs(json!({"n": 2}))).unwrap();
    assert!(store.writes().is_empty());

    let (outcome, done) = capture();
    tags.save_member("red", Some(done)).unwrap();
    assert_eq!(outcome.lock().unwrap().take(), Some(Ok(())));
    assert_eq!(store.value(&path("tags/red")), json!({"n": 2}));
}

// ============================================================================
// Diff Properties
// ============================================================================

fn arb_attrs() -> impl Strategy<Value = Attributes> {
    let value = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z ]{0,8}".prop_map(Value::from),
    ];
    proptest::collection::btree_map("[a-f]{1,3}", value, 0..6)
        .prop_map(|m| m.into_iter().collect())
}

proptest! {
    #[test]
    fn remote_application_leaves_nothing_to_push(remote in arb_attrs(), local in arb_attrs()) {
        let store = Arc::new(MemoryStore::new());
        let record = Record::new(local);
        let mut sync = RecordSync::with_record(store.clone(), &one_shot("r/k"), record).unwrap();

        let snapshot = Snapshot::new(&path("r/k"), Value::Object(remote.clone()));
        sync.apply_remote(&snapshot).unwrap();

        let patch = diff(&remote, &sync.record().stored_attributes());
        prop_assert!(patch.is_empty(), "leftover patch {:?}", patch);
        prop_assert!(store.writes().is_empty());
    }
}
