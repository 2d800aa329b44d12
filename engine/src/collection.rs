//! Collection - an ordered set of records keyed by identifier.

use crate::snapshot::compare_children;
use crate::{error::Result, Error, Record, RecordId};
use std::cmp::Ordering;
use std::fmt;

/// Orders members of a collection.
pub type Comparator = Box<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// Compare by identifier (the default).
pub fn by_id(a: &Record, b: &Record) -> Ordering {
    a.id().cmp(&b.id())
}

/// Compare the way the store orders children: priority, then identifier.
pub fn by_priority(a: &Record, b: &Record) -> Ordering {
    let (a_id, b_id) = (a.id().unwrap_or_default(), b.id().unwrap_or_default());
    compare_children(&a_id, a.priority().as_ref(), &b_id, b.priority().as_ref())
}

/// An ordered set of records. Identifiers are unique.
pub struct Collection {
    members: Vec<Record>,
    comparator: Comparator,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    /// Create an empty collection ordered by identifier.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            comparator: Box::new(by_id),
        }
    }

    /// Order members with `comparator` instead.
    pub fn with_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&Record, &Record) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Box::new(comparator);
        self.sort();
        self
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.position(id).map(|i| &self.members[i])
    }

    /// Get a mutable record by ID.
    ///
    /// Call [`Collection::sort`] afterwards if the change can affect order.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.position(id).map(move |i| &mut self.members[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Insert a record in order. Returns false, leaving the collection
    /// untouched, if its identifier is already present.
    pub fn insert(&mut self, record: Record) -> Result<bool> {
        let id = record.id().ok_or(Error::MissingIdentifier)?;
        if self.contains(&id) {
            return Ok(false);
        }
        let at = self
            .members
            .partition_point(|m| (self.comparator)(m, &record) != Ordering::Greater);
        self.members.insert(at, record);
        Ok(true)
    }

    /// Remove a record by ID.
    pub fn remove(&mut self, id: &str) -> Option<Record> {
        self.position(id).map(|i| self.members.remove(i))
    }

    /// Remove every member.
    pub fn clear(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.members)
    }

    /// Re-establish comparator order.
    pub fn sort(&mut self) {
        let comparator = &self.comparator;
        self.members.sort_by(|a, b| comparator(a, b));
    }

    /// Member identifiers in order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.members.iter().filter_map(Record::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.id().as_deref() == Some(id))
    }
}
