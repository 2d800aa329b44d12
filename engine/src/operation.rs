//! Write operations sent to the remote store.
//!
//! The store accepts three write shapes. Engines build a [`WriteOp`] and
//! hand it to [`dispatch`], which keeps the choice of shape in one place
//! and gives the in-memory store a uniform write log.

use crate::store::{logged, Completion, RemoteStore};
use crate::{Attributes, Priority, RemotePath};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single write against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WriteOp {
    /// Full replace; `null` deletes the node.
    Set { path: RemotePath, value: Value },
    /// Merge patch; omitted keys are untouched, `null` entries delete.
    Update { path: RemotePath, patch: Attributes },
    /// Full replace with a new node priority.
    SetWithPriority {
        path: RemotePath,
        value: Value,
        priority: Priority,
    },
}

impl WriteOp {
    /// Get the path this write targets.
    pub fn path(&self) -> &RemotePath {
        match self {
            WriteOp::Set { path, .. } => path,
            WriteOp::Update { path, .. } => path,
            WriteOp::SetWithPriority { path, .. } => path,
        }
    }

    /// True for a `Set` of `null`.
    pub fn is_delete(&self) -> bool {
        matches!(self, WriteOp::Set { value: Value::Null, .. })
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Update { .. } => "update",
            WriteOp::SetWithPriority { .. } => "set_with_priority",
        }
    }
}

/// Send a write to the store. Failures are logged before reaching `done`.
pub fn dispatch<S: RemoteStore + ?Sized>(store: &S, op: WriteOp, done: Option<Completion>) {
    tracing::debug!(op = op.name(), path = %op.path(), "dispatching write");
    let done = Some(logged(op.path(), op.name(), done));
    match op {
        WriteOp::Set { path, value } => store.set(&path, value, done),
        WriteOp::Update { path, patch } => store.update(&path, patch, done),
        WriteOp::SetWithPriority {
            path,
            value,
            priority,
        } => store.set_with_priority(&path, value, priority, done),
    }
}
