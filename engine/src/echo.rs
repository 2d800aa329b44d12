//! Echo suppression.
//!
//! Two guards keep a write from chasing its own reflection:
//!
//! - [`RemoteChanging`] is raised on a record while a remote value is being
//!   applied to it. Changes made under it are never pushed back.
//! - [`EchoSuppressor`] remembers, per identifier and operation, that a
//!   silent local add or remove is in flight, so the matching
//!   `child_added`/`child_removed` echo updates local state without
//!   notifying listeners a second time.

use crate::RecordId;
use std::collections::HashMap;

/// Re-entrancy flag for remote-origin mutation of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteChanging {
    active: bool,
}

impl RemoteChanging {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn enter(&mut self) {
        debug_assert!(!self.active, "remote application re-entered");
        self.active = true;
    }

    pub(crate) fn exit(&mut self) {
        self.active = false;
    }
}

/// Which echo a pending suppression is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EchoKind {
    Add,
    Remove,
}

/// Pending silent operations, keyed by identifier.
///
/// Repeating the same silent operation on one identifier before its echo
/// arrives stacks; each echo consumes one.
#[derive(Debug, Default)]
pub struct EchoSuppressor {
    pending: HashMap<(EchoKind, RecordId), u32>,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one echo of `kind` for `id`.
    pub fn expect(&mut self, kind: EchoKind, id: &str) {
        *self.pending.entry((kind, id.to_string())).or_default() += 1;
    }

    /// Consume a pending echo. Returns true if the event should be silent.
    pub fn consume(&mut self, kind: EchoKind, id: &str) -> bool {
        let key = (kind, id.to_string());
        match self.pending.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.pending.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drop an expectation whose write failed, so no echo is coming.
    pub fn withdraw(&mut self, kind: EchoKind, id: &str) {
        self.consume(kind, id);
    }

    pub fn is_pending(&self, kind: EchoKind, id: &str) -> bool {
        self.pending.contains_key(&(kind, id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
