//! Content-addressed envelope ids.
//!
//! Payloads are canonicalised before hashing so that structurally equal
//! values hash identically regardless of object key order. Arrays keep
//! their order; object keys are sorted recursively. The id is the first
//! 16 hex characters of SHA-256 over the canonical JSON encoding.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const ID_HEX_LEN: usize = 16;

/// Recursively sort object keys so that hashing is order-insensitive.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, val) in entries {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Stable content hash of a payload value.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    // serde_json preserves insertion order for Map, so the canonical form
    // serialises deterministically.
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    hash_bytes(&encoded)
}

/// Stable hash of arbitrary bytes, truncated to the id length.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(ID_HEX_LEN);
    for byte in digest.iter() {
        if hex.len() >= ID_HEX_LEN {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(ID_HEX_LEN);
    hex
}
