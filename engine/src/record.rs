//! Record types holding local attributes.
//!
//! A [`Record`] is the local side of one remote node: a JSON attribute map
//! plus the bookkeeping the engines need to sync it. User code mutates
//! attributes; only the engines touch the remote baseline and the
//! re-entrancy flag.

use crate::diff::same_value;
use crate::echo::RemoteChanging;
use crate::snapshot::PRIORITY_KEY;
use crate::{config::DEFAULT_ID_ATTRIBUTE, error::Result, Attributes, Error, Priority, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys changed by one mutation, mapped to their new values.
///
/// A removed key maps to `null`.
pub type Changes = Attributes;

/// A record with local attributes and sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Attribute holding the identifier
    id_attribute: String,
    /// Current local attributes
    attributes: Attributes,
    /// Declared defaults, applied after the first remote sync
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    defaults: Attributes,
    /// Changes made by the last mutation
    #[serde(skip)]
    changed: Changes,
    /// Value most recently observed from the store (diff baseline)
    #[serde(default)]
    last_remote: Value,
    /// Raised while a remote value is being applied
    #[serde(skip)]
    remote_changing: RemoteChanging,
    /// Whether a remote value has been applied at least once
    #[serde(default)]
    synced: bool,
}

impl Default for Record {
    fn default() -> Self {
        Self::new(Attributes::new())
    }
}

impl Record {
    /// Create a record from raw attributes. Null entries are dropped.
    pub fn new(attributes: Attributes) -> Self {
        Self {
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            attributes: attributes.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            defaults: Attributes::new(),
            changed: Changes::new(),
            last_remote: Value::Null,
            remote_changing: RemoteChanging::default(),
            synced: false,
        }
    }

    /// Create a record from a JSON value; non-objects give an empty record.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            _ => Self::default(),
        }
    }

    /// Use `name` as the identifier attribute.
    pub fn with_id_attribute(mut self, name: impl Into<String>) -> Self {
        self.id_attribute = name.into();
        self
    }

    /// Declare defaults. They stay absent until the first remote sync.
    pub fn with_defaults(mut self, defaults: Attributes) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// The identifier, if one has been assigned.
    pub fn id(&self) -> Option<RecordId> {
        match self.attributes.get(&self.id_attribute)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// All attributes as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.attributes.clone())
    }

    /// Attributes as stored remotely: without the identifier and priority.
    pub fn to_remote_value(&self) -> Value {
        Value::Object(
            self.attributes
                .iter()
                .filter(|(k, _)| k.as_str() != self.id_attribute && k.as_str() != PRIORITY_KEY)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Attributes in stored form: everything but the identifier.
    ///
    /// Unlike [`Record::to_remote_value`] this keeps `.priority`, so it can
    /// be diffed against the remote baseline.
    pub fn stored_attributes(&self) -> Attributes {
        self.attributes
            .iter()
            .filter(|(k, _)| k.as_str() != self.id_attribute)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The node priority carried under `.priority`, if any.
    pub fn priority(&self) -> Option<Priority> {
        self.attributes.get(PRIORITY_KEY).and_then(Priority::from_value)
    }

    /// Changes made by the last mutation.
    pub fn changed(&self) -> &Changes {
        &self.changed
    }

    /// Set attributes, returning what changed. A `null` value removes the key.
    ///
    /// Fails without touching anything if the batch would change an
    /// assigned identifier.
    pub fn set(&mut self, attributes: Attributes) -> Result<Changes> {
        self.check_identifier(&attributes)?;

        let mut changes = Changes::new();
        for (key, value) in attributes {
            if value.is_null() {
                if self.attributes.remove(&key).is_some() {
                    changes.insert(key, Value::Null);
                }
            } else if !self
                .attributes
                .get(&key)
                .is_some_and(|old| same_value(old, &value))
            {
                self.attributes.insert(key.clone(), value.clone());
                changes.insert(key, value);
            }
        }
        self.changed = changes.clone();
        Ok(changes)
    }

    fn check_identifier(&self, attributes: &Attributes) -> Result<()> {
        let (Some(current), Some(next)) = (self.id(), attributes.get(&self.id_attribute)) else {
            return Ok(());
        };
        let attempted = match next {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if attempted == current {
            Ok(())
        } else {
            Err(Error::IdentifierImmutable { current, attempted })
        }
    }

    /// Set a single attribute.
    pub fn set_attr(&mut self, key: impl Into<String>, value: Value) -> Result<Changes> {
        let mut attributes = Attributes::new();
        attributes.insert(key.into(), value);
        self.set(attributes)
    }

    /// Remove one attribute.
    pub fn unset(&mut self, key: &str) -> Result<Changes> {
        self.set_attr(key, Value::Null)
    }

    /// The remote baseline.
    pub fn last_remote(&self) -> &Value {
        &self.last_remote
    }

    /// The remote baseline's fields; empty when it is not an object.
    pub fn last_remote_attributes(&self) -> Attributes {
        self.last_remote.as_object().cloned().unwrap_or_default()
    }

    /// The remote baseline in stored form, comparable with
    /// [`Record::stored_attributes`]. An identifier field stored remotely
    /// is left out so it is never tombstoned.
    pub fn last_remote_stored(&self) -> Attributes {
        let mut baseline = self.last_remote_attributes();
        baseline.remove(&self.id_attribute);
        baseline
    }

    pub fn is_remote_changing(&self) -> bool {
        self.remote_changing.is_active()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub(crate) fn set_id_attribute(&mut self, name: &str) {
        self.id_attribute = name.to_string();
    }

    pub(crate) fn remote_changing_mut(&mut self) -> &mut RemoteChanging {
        &mut self.remote_changing
    }

    pub(crate) fn set_last_remote(&mut self, value: Value) {
        self.last_remote = value;
    }

    pub(crate) fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Fill in the identifier without recording a change.
    ///
    /// Returns false if an identifier was already present.
    pub(crate) fn assign_id(&mut self, id: &str) -> bool {
        if self.id().is_some() {
            return false;
        }
        self.attributes
            .insert(self.id_attribute.clone(), Value::String(id.to_string()));
        true
    }

    /// Defaults for keys that are still absent.
    pub(crate) fn missing_defaults(&self) -> Attributes {
        self.defaults
            .iter()
            .filter(|(k, _)| !self.attributes.contains_key(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Make local attributes match a remote value and adopt it as the
    /// baseline.
    ///
    /// For an object value, local keys absent remotely are unset (never the
    /// identifier) and the remote keys are merged in. Any other value is
    /// kept as an opaque baseline and leaves the attributes alone.
    pub(crate) fn merge_remote(&mut self, value: &Value) -> Result<Changes> {
        let mut changes = Changes::new();
        if let Some(remote) = value.as_object() {
            self.check_identifier(remote)?;
            let stale: Vec<String> = self
                .attributes
                .keys()
                .filter(|k| k.as_str() != self.id_attribute && !remote.contains_key(k.as_str()))
                .cloned()
                .collect();
            for key in stale {
                self.attributes.remove(&key);
                changes.insert(key, Value::Null);
            }
            changes.extend(self.set(remote.clone())?);
        }
        self.last_remote = value.clone();
        self.changed = changes.clone();
        Ok(changes)
    }
}

/// Build an attribute map from a JSON object literal.
///
/// Non-object values give an empty map.
pub fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}
