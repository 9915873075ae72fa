//! nexus_common
//!
//! Canonical JSON serialization + SHA-256 hashing utilities.
//! This exists to guarantee determinism for:
//! - audit entry hash chaining
//! - prompt hashing
//!
//! IMPORTANT: Do not "pretty print". Hashes must be computed over canonical bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to canonical JSON bytes:
/// - stable key ordering (we enforce sorting via Value roundtrip)
/// - no whitespace
/// - UTF-8
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Return the lowercase hex SHA-256 digest of canonical JSON bytes.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_hex(&bytes))
}

/// Return the lowercase hex SHA-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// All-zero genesis digest used as `prev_hash` for the first audit entry.
pub fn genesis_hash() -> String {
    "0".repeat(64)
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_hash_is_stable_under_key_reorder() {
        let x = Obj { b: 2, a: 1 };
        let y = Obj { a: 1, b: 2 };
        let hx = sha256_canonical_json(&x).unwrap();
        let hy = sha256_canonical_json(&y).unwrap();
        assert_eq!(hx, hy);
    }

    #[test]
    fn genesis_hash_is_64_zero_chars() {
        let g = genesis_hash();
        assert_eq!(g.len(), 64);
        assert!(g.chars().all(|c| c == '0'));
    }

    #[test]
    fn canonical_json_roundtrip_is_stable() {
        let x = Obj { b: 2, a: 1 };
        let bytes1 = canonical_json_bytes(&x).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes1).unwrap();
        let bytes2 = canonical_json_bytes(&parsed).unwrap();
        assert_eq!(bytes1, bytes2);
    }
}
