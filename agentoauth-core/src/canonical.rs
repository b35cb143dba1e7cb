//! Canonical JSON serialization and policy hashing
//!
//! Policies are hashed and then bound to tokens and to WebAuthn challenges,
//! so serialization must be byte-identical across peers: object keys sorted
//! at every depth, arrays kept in order, no insignificant whitespace.

use crate::error::{AgentOAuthError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix carried by every policy hash string
pub const HASH_PREFIX: &str = "sha256:";

/// Deterministically serialize a JSON value.
///
/// Object keys are sorted lexicographically at every depth; array order is
/// preserved (arrays are semantic). Numbers keep serde_json's own rendering:
/// integers exact, floats in shortest round-trip form.
pub fn canonicalize(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s)?,
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key)?;
                out.push(':');
                // Key came from the map, so the entry exists
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) -> Result<()> {
    let escaped = serde_json::to_string(s)
        .map_err(|e| AgentOAuthError::InvalidPayload(format!("unrepresentable string: {}", e)))?;
    out.push_str(&escaped);
    Ok(())
}

/// Compute `sha256:<lowercase-hex>` over the canonical form
pub fn hash(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{}{}", HASH_PREFIX, hex::encode(digest)))
}

/// Check a value against an expected `sha256:<hex>` string
pub fn verify_hash(value: &Value, expected: &str) -> bool {
    match hash(value) {
        Ok(computed) => computed == expected,
        Err(_) => false,
    }
}

/// Validate the shape of a hash string without recomputing anything
pub fn is_hash_format(s: &str) -> bool {
    match s.strip_prefix(HASH_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == 64
                && hex_part
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = json!({"b": 1, "a": {"y": true, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": true}, "b": 1});
        assert_eq!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn test_array_order_is_semantic() {
        let a = json!({"ids": ["airbnb", "uber"]});
        let b = json!({"ids": ["uber", "airbnb"]});
        assert_ne!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn test_canonical_form_is_compact() {
        let value = json!({"b": [1, 2.5], "a": "hi \"there\""});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"a":"hi \"there\"","b":[1,2.5]}"#
        );
    }

    #[test]
    fn test_integers_stay_exact() {
        let value = json!({"amount": 2000});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"amount":2000}"#);
    }

    #[test]
    fn test_hash_format() {
        let h = hash(&json!({"id": "pol_1"})).unwrap();
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
        assert!(is_hash_format(&h));
        assert!(!is_hash_format("sha256:short"));
        assert!(!is_hash_format("md5:abcd"));
    }

    #[test]
    fn test_verify_hash() {
        let value = json!({"actions": ["payments.send"], "id": "p1"});
        let h = hash(&value).unwrap();
        assert!(verify_hash(&value, &h));
        assert!(!verify_hash(&json!({"actions": [], "id": "p1"}), &h));
    }

    // Recursively shuffle object key insertion order without changing content
    fn reversed_keys(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map.iter().rev() {
                    out.insert(k.clone(), reversed_keys(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(reversed_keys).collect()),
            other => other.clone(),
        }
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9_.]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(depth, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_hash_invariant_under_key_reordering(value in arb_json(3)) {
            let shuffled = reversed_keys(&value);
            prop_assert_eq!(hash(&value).unwrap(), hash(&shuffled).unwrap());
        }

        #[test]
        fn prop_canonical_round_trips(value in arb_json(3)) {
            let canonical = canonicalize(&value).unwrap();
            let reparsed: Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(reparsed, value);
        }
    }
}
