//! Cache fingerprinting.
//!
//! The fingerprint is a SHA-256 over the canonical query, the canonical
//! parameter encoding, the target, and the row cap. Different parameter
//! values MUST produce different fingerprints; a collision here would leak
//! one principal's cached rows to another.

use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::inspect::normalize;

/// Canonical form of a statement for fingerprinting: whitespace collapsed,
/// keywords lower-cased (string literals preserved), placeholder syntax
/// normalized so `:id` and `:ID` key the same entry.
#[must_use]
pub fn canonical_query(query: &str) -> String {
    normalize(query)
}

fn canonical_params(params: &Map<String, JsonValue>) -> String {
    // serde_json maps iterate in insertion order; sort keys so parameter
    // order never splits the cache.
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        out.push_str(&params[key].to_string());
        out.push(';');
    }
    out
}

/// Deterministic cache key for a query against one target.
#[must_use]
pub fn fingerprint(
    query: &str,
    params: &Map<String, JsonValue>,
    target: &str,
    max_rows: Option<usize>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_query(query).as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_params(params).as_bytes());
    hasher.update([0x1f]);
    hasher.update(target.as_bytes());
    hasher.update([0x1f]);
    match max_rows {
        Some(n) => hasher.update(n.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(json: serde_json::Value) -> Map<String, JsonValue> {
        json.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_whitespace_and_case_insensitive() {
        let a = fingerprint("SELECT id FROM users WHERE id = :id", &params(serde_json::json!({"id": 7})), "a", None);
        let b = fingerprint("select   id\n FROM users where id = :id", &params(serde_json::json!({"id": 7})), "a", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_params_differ() {
        let a = fingerprint("SELECT 1", &params(serde_json::json!({"id": 7})), "a", None);
        let b = fingerprint("SELECT 1", &params(serde_json::json!({"id": 8})), "a", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_param_order_is_irrelevant() {
        let mut first = Map::new();
        first.insert("a".to_string(), serde_json::json!(1));
        first.insert("b".to_string(), serde_json::json!(2));
        let mut second = Map::new();
        second.insert("b".to_string(), serde_json::json!(2));
        second.insert("a".to_string(), serde_json::json!(1));

        assert_eq!(
            fingerprint("SELECT 1", &first, "a", None),
            fingerprint("SELECT 1", &second, "a", None)
        );
    }

    #[test]
    fn test_target_and_max_rows_split_the_key() {
        let p = params(serde_json::json!({}));
        let base = fingerprint("SELECT 1", &p, "a", None);
        assert_ne!(base, fingerprint("SELECT 1", &p, "b", None));
        assert_ne!(base, fingerprint("SELECT 1", &p, "a", Some(10)));
        assert_ne!(
            fingerprint("SELECT 1", &p, "a", Some(10)),
            fingerprint("SELECT 1", &p, "a", Some(0))
        );
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = fingerprint("SELECT 1", &Map::new(), "a", None);
        assert_eq!(fp.len(), 64);
    }
}
