//! Patch computation between the remote baseline and local attributes.
//!
//! Merge updates only touch the keys they list, so the patch has to name
//! every key that disappeared locally or the stale remote field survives.
//!
//! # Algorithm
//!
//! 1. Take the union of keys from both maps
//! 2. Keys missing locally become `null` (delete)
//! 3. Keys whose values differ carry the local value
//! 4. Equal keys are left out
//! 5. A differing `.priority` is pulled out of the merge entirely; the
//!    node has to be replaced together with its priority instead

use crate::operation::WriteOp;
use crate::snapshot::PRIORITY_KEY;
use crate::{Attributes, Priority, RemotePath};
use serde_json::Value;
use std::collections::BTreeSet;

/// What should happen to the node priority.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorityChange {
    Set(Priority),
    Clear,
}

/// The minimal change that brings the remote node up to date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPatch {
    fields: Attributes,
    priority: Option<PriorityChange>,
}

impl SyncPatch {
    /// Field entries; `null` means delete.
    pub fn fields(&self) -> &Attributes {
        &self.fields
    }

    pub fn priority(&self) -> Option<&PriorityChange> {
        self.priority.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.priority.is_none()
    }

    /// True when only a full replace can express the patch.
    pub fn requires_replace(&self) -> bool {
        self.priority.is_some()
    }

    /// Keys the patch deletes remotely.
    pub fn tombstones(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.as_str())
    }

    /// The write that applies this patch to the node at `path`.
    ///
    /// `local` is needed for the full-replace case. Returns `None` for an
    /// empty patch.
    pub fn into_write(self, path: RemotePath, local: &Attributes) -> Option<WriteOp> {
        match self.priority {
            Some(_) => Some(full_write(path, local)),
            None if self.fields.is_empty() => None,
            None => Some(WriteOp::Update {
                path,
                patch: self.fields,
            }),
        }
    }
}

/// Compute the patch turning `remote` into `local`.
pub fn diff(remote: &Attributes, local: &Attributes) -> SyncPatch {
    let keys: BTreeSet<&String> = remote.keys().chain(local.keys()).collect();

    let mut patch = SyncPatch::default();
    for key in keys {
        let change = match (remote.get(key.as_str()), local.get(key.as_str())) {
            (_, None) => Some(Value::Null),
            (None, Some(value)) => Some(value.clone()),
            (Some(old), Some(new)) if !same_value(old, new) => Some(new.clone()),
            _ => None,
        };
        let Some(value) = change else {
            continue;
        };

        if key == PRIORITY_KEY {
            patch.priority = Some(match Priority::from_value(&value) {
                Some(priority) => PriorityChange::Set(priority),
                None => PriorityChange::Clear,
            });
        } else {
            patch.fields.insert(key.clone(), value);
        }
    }
    patch
}

/// Full replace of the node at `path` with `local`, carrying its priority.
pub fn full_write(path: RemotePath, local: &Attributes) -> WriteOp {
    let mut value = local.clone();
    let priority = value
        .remove(PRIORITY_KEY)
        .and_then(|p| Priority::from_value(&p));
    let value = Value::Object(value);
    match priority {
        Some(priority) => WriteOp::SetWithPriority {
            path,
            value,
            priority,
        },
        None => WriteOp::Set { path, value },
    }
}

/// Value equality that treats `5` and `5.0` as the same number.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_value(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| same_value(x, y)))
        }
        _ => a == b,
    }
}
