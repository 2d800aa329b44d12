//! # Tether Engine
//!
//! Echo-free synchronisation of local records and collections with a
//! hierarchical, event-emitting remote store.
//!
//! The engine keeps both sides eventually consistent without letting a
//! local write chase its own reflection: a remote value applied locally is
//! never pushed back, and a local write's echo never notifies twice.
//!
//! ## Design Principles
//!
//! - **Store-agnostic**: transport lives behind the [`RemoteStore`] trait
//! - **Explicit event loop**: store events queue up until [`RecordSync::poll`]
//!   or [`CollectionSync::poll`] processes them
//! - **Minimal writes**: local changes go out as the smallest patch that
//!   reconciles the remote node
//!
//! ## Core Concepts
//!
//! ### Records and collections
//!
//! A [`Record`] is a JSON attribute map bound to one remote node. Its
//! identifier is the node's path key and never changes once assigned. A
//! [`Collection`] is an ordered set of records bound to the children of a
//! node.
//!
//! ### Modes
//!
//! Each engine runs in one [`SyncMode`], chosen once from its [`SyncConfig`]:
//! - [`SyncMode::Continuous`] - live subscription, changes pushed as they
//!   happen
//! - [`SyncMode::OneShot`] - explicit reads and writes only
//!
//! ### Diffs
//!
//! [`diff`] turns the last remote value and the current local attributes
//! into a [`SyncPatch`]. Keys removed locally become `null` tombstones; a
//! changed priority forces a full replace of the node.
//!
//! ### Echo guards
//!
//! [`RemoteChanging`] marks a record while a remote value is applied.
//! [`EchoSuppressor`] remembers which silent collection writes are waiting
//! for their echo, per identifier.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_engine::{MemoryStore, RecordSync, RemotePath, SyncConfig};
//! use serde_json::json;
//!
//! // 1. A store with one user in it
//! let store = Arc::new(MemoryStore::with_value(json!({
//!     "users": {"ann": {"name": "Ann"}}
//! })));
//!
//! // 2. Bind a record to it and process the initial value
//! let mut user = RecordSync::new(store.clone(), &SyncConfig::new("users/ann")).unwrap();
//! user.poll().unwrap();
//! assert_eq!(user.id().as_deref(), Some("ann"));
//!
//! // 3. Local changes are pushed as merge updates
//! user.set_attr("name", json!("Annie")).unwrap();
//! let path = RemotePath::parse("users/ann").unwrap();
//! assert_eq!(store.value(&path), json!({"name": "Annie"}));
//! ```

pub mod collection;
pub mod collection_sync;
pub mod config;
pub mod diff;
pub mod echo;
pub mod error;
pub mod events;
pub mod key;
pub mod memory;
pub mod operation;
pub mod path;
pub mod record;
pub mod record_sync;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use collection::{by_id, by_priority, Collection, Comparator};
pub use collection_sync::{CollectionSync, SyncOptions};
pub use config::{SyncConfig, SyncMode, DEFAULT_ID_ATTRIBUTE};
pub use diff::{diff, full_write, PriorityChange, SyncPatch};
pub use echo::{EchoKind, EchoSuppressor, RemoteChanging};
pub use error::{Error, Result};
pub use events::{CollectionEvent, Emitter, RecordEvent};
pub use memory::MemoryStore;
pub use operation::{dispatch, WriteOp};
pub use path::RemotePath;
pub use record::{Changes, Record};
pub use record_sync::RecordSync;
pub use snapshot::{EventKind, Priority, Snapshot, StoreEvent, PRIORITY_KEY};
pub use store::{event_channel, Completion, EventSink, EventStream, RemoteStore, SubscriptionId};

/// Type aliases for clarity
pub type RecordId = String;
pub type Attributes = serde_json::Map<String, serde_json::Value>;
