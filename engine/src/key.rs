//! Unique key generation for new remote children.
//!
//! Keys are UUIDv7 in their simple (hex, no dashes) form. The timestamp
//! sits in the leading bits, so keys generated later sort after earlier
//! ones and a collection ordered by identifier keeps insertion order.

use uuid::Uuid;

/// Length of a generated key.
pub const KEY_LEN: usize = 32;

/// Generate a globally unique, chronologically ordered child key.
pub fn generate_key() -> String {
    Uuid::now_v7().simple().to_string()
}

/// True if `key` has the shape of a generated key.
pub fn is_generated_key(key: &str) -> bool {
    key.len() == KEY_LEN && key.bytes().all(|b| b.is_ascii_hexdigit())
}
