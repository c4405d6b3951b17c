//! Canonical parameter/payload value model.
//!
//! The source framework this fabric replaces passes parameters around as
//! arbitrary dynamic dicts and canonicalizes them only at the point a cache
//! key is hashed (`json.dumps(params, sort_keys=True, default=str)`). Here the
//! canonicalization is structural: [`Params`] is a `BTreeMap`, so key order is
//! never ambiguous, and [`Value::canonical_bytes`] renders a value the same
//! way regardless of how it was constructed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An ordered mapping of string to [`Value`], used for operation parameters.
pub type Params = BTreeMap<String, Value>;

/// A tagged value union used for operation parameters and cached/response
/// payloads. Deliberately small and closed — plugins that need richer types
/// encode them as [`Value::Str`] or [`Value::Bytes`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    /// Renders a stable byte encoding of this value: semantically equal
    /// values (same variant, same contents, maps compared key-by-key)
    /// produce identical bytes regardless of construction order. Used as the
    /// input to the cache key hash and nowhere else — it is not meant to be
    /// a general serialization format.
    pub fn canonical_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                out.push(3);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::List(items) => {
                out.push(5);
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.canonical_bytes(out);
                }
            }
            Value::Map(map) => {
                out.push(6);
                out.extend_from_slice(&(map.len() as u64).to_le_bytes());
                // BTreeMap iterates in key order already; no extra sort needed.
                for (k, v) in map {
                    out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                    out.extend_from_slice(k.as_bytes());
                    v.canonical_bytes(out);
                }
            }
            Value::Bytes(bytes) => {
                out.push(7);
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Converts a `serde_json::Value` into a [`Value`], used when decoding
    /// webhook request bodies and JSON-based operation parameters.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts this value back into a `serde_json::Value`, used when
    /// serializing envelopes and cached payloads over the wire.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::json!(f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Bytes(bytes) => serde_json::Value::String(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                bytes,
            )),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_ignore_construction_order() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), Value::Int(2));
        a.insert("a".to_string(), Value::Int(1));

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), Value::Int(1));
        b.insert("b".to_string(), Value::Int(2));

        let (mut ba, mut bb) = (Vec::new(), Vec::new());
        Value::Map(a).canonical_bytes(&mut ba);
        Value::Map(b).canonical_bytes(&mut bb);
        assert_eq!(ba, bb);
    }

    #[test]
    fn distinct_values_diverge() {
        let (mut a, mut b) = (Vec::new(), Vec::new());
        Value::Str("1".to_string()).canonical_bytes(&mut a);
        Value::Int(1).canonical_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn json_roundtrip_preserves_shape() {
        let value = Value::Map(BTreeMap::from([
            ("name".to_string(), Value::Str("acme".to_string())),
            ("count".to_string(), Value::Int(3)),
            ("tags".to_string(), Value::List(vec![Value::Bool(true)])),
        ]));
        let json = value.to_json();
        let back = Value::from_json(json);
        assert_eq!(value, back);
    }
}
