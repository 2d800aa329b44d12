//! Snapshot types describing remote nodes.
//!
//! A [`Snapshot`] is the value and key of a remote node at a point in time.
//! Snapshots are what the remote store hands to subscribers and one-shot
//! readers; the engines never see the store's internal representation.

use crate::{Attributes, RemotePath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute key under which a node's priority travels in exported values.
pub const PRIORITY_KEY: &str = ".priority";

/// An ordering value attached to a remote node, orthogonal to its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Priority {
    Number(f64),
    String(String),
}

impl Priority {
    /// Read a priority out of a JSON value. Only numbers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Priority::Number),
            Value::String(s) => Some(Priority::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Priority::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Priority::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<f64> for Priority {
    fn from(value: f64) -> Self {
        Priority::Number(value)
    }
}

impl From<&str> for Priority {
    fn from(value: &str) -> Self {
        Priority::String(value.to_string())
    }
}

/// Child ordering: no priority first, then numbers ascending, then strings,
/// ties broken by key.
pub fn compare_children(
    a_key: &str,
    a_priority: Option<&Priority>,
    b_key: &str,
    b_priority: Option<&Priority>,
) -> Ordering {
    fn rank(p: Option<&Priority>) -> u8 {
        match p {
            None => 0,
            Some(Priority::Number(_)) => 1,
            Some(Priority::String(_)) => 2,
        }
    }

    let by_priority = match (a_priority, b_priority) {
        (Some(Priority::Number(a)), Some(Priority::Number(b))) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (Some(Priority::String(a)), Some(Priority::String(b))) => a.cmp(b),
        (a, b) => rank(a).cmp(&rank(b)),
    };
    by_priority.then_with(|| a_key.cmp(b_key))
}

/// The value and key of a remote node at a point in time.
///
/// Priorities are carried for the node itself and for its direct children,
/// which is as deep as the sync engines look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    key: Option<String>,
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    child_priorities: BTreeMap<String, Priority>,
}

impl Snapshot {
    /// Create a snapshot of the node at `path`.
    pub fn new(path: &RemotePath, value: Value) -> Self {
        Self {
            key: path.key().map(str::to_string),
            value,
            priority: None,
            child_priorities: BTreeMap::new(),
        }
    }

    /// Attach the node's own priority.
    pub fn with_priority(mut self, priority: Option<Priority>) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the priorities of direct children.
    pub fn with_child_priorities(mut self, priorities: BTreeMap<String, Priority>) -> Self {
        self.child_priorities = priorities;
        self
    }

    /// The node's path key, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn priority(&self) -> Option<&Priority> {
        self.priority.as_ref()
    }

    /// A node exists when its value is not null.
    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }

    /// The object fields of the value, `None` for scalars and null.
    pub fn attributes(&self) -> Option<&Attributes> {
        self.value.as_object()
    }

    /// The value with the priority folded in under [`PRIORITY_KEY`].
    ///
    /// Only object values can carry the priority; scalars are returned as is.
    pub fn export_value(&self) -> Value {
        match (&self.value, &self.priority) {
            (Value::Object(map), Some(priority)) => {
                let mut map = map.clone();
                map.insert(PRIORITY_KEY.to_string(), priority.to_value());
                Value::Object(map)
            }
            (value, _) => value.clone(),
        }
    }

    /// Snapshot of a direct child, null if absent.
    pub fn child(&self, key: &str) -> Snapshot {
        let value = self
            .value
            .get(key)
            .cloned()
            .unwrap_or(Value::Null);
        Snapshot {
            key: Some(key.to_string()),
            value,
            priority: self.child_priorities.get(key).cloned(),
            child_priorities: BTreeMap::new(),
        }
    }

    /// Direct children in store order.
    pub fn children(&self) -> Vec<Snapshot> {
        let Some(map) = self.value.as_object() else {
            return Vec::new();
        };
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort_by(|a, b| {
            compare_children(
                a,
                self.child_priorities.get(*a),
                b,
                self.child_priorities.get(*b),
            )
        });
        keys.into_iter().map(|k| self.child(k)).collect()
    }
}

/// Kinds of events a remote path emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
}

impl EventKind {
    /// The four child events, in the order collections subscribe to them.
    pub const CHILD_EVENTS: [EventKind; 4] = [
        EventKind::ChildAdded,
        EventKind::ChildChanged,
        EventKind::ChildRemoved,
        EventKind::ChildMoved,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Value => "value",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildChanged => "child_changed",
            EventKind::ChildRemoved => "child_removed",
            EventKind::ChildMoved => "child_moved",
        };
        f.write_str(name)
    }
}

/// An event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    pub kind: EventKind,
    /// For `value` events the subscribed node, otherwise the affected child.
    pub snapshot: Snapshot,
    /// Key of the sibling preceding the child, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_child_key: Option<String>,
}
