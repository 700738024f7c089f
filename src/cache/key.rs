//! Cache Keys
//!
//! A key is derived from a namespace and a parameter map. Parameters are
//! canonicalized (object members sorted by name, recursively) before hashing,
//! so insertion order never changes identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Parameter map supplied by callers alongside a namespace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a serializable value.
    ///
    /// Values serde cannot represent as JSON (e.g. maps with non-string keys)
    /// are replaced by a string naming the type and the failure. This is a
    /// lossy normalization: two such values of the same type share a key.
    pub fn insert<V: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &V) {
        let key = key.into();
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(param = %key, "parameter not JSON-representable, hashing its type name: {}", e);
                Value::String(format!("<{}: {}>", std::any::type_name::<V>(), e))
            }
        };
        self.entries.insert(key, value);
    }

    /// Insert using the value's `Display` form
    pub fn insert_display(&mut self, key: impl Into<String>, value: &dyn fmt::Display) {
        self.entries.insert(key.into(), Value::String(value.to_string()));
    }

    /// Builder form of [`Params::insert`]
    pub fn with<V: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build from a JSON object; any other JSON value becomes a single `value` parameter
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            other => std::iter::once(("value".to_string(), other)).collect(),
        }
    }

    /// Stable textual form: sorted keys, recursively sorted nested objects, compact JSON
    pub fn canonical_form(&self) -> String {
        let canonical: Vec<(&String, Value)> = self
            .entries
            .iter()
            .map(|(k, v)| (k, canonicalize(v)))
            .collect();
        // Vec of pairs serializes as [[k, v], ...] independent of map ordering features
        serde_json::to_string(&canonical).unwrap_or_default()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Opaque deterministic cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Hex SHA-256 of namespace + canonical params
    digest: String,
    /// Namespace the key was built from
    namespace: String,
}

impl CacheKey {
    /// Rebuild a key from its stored parts (used when enumerating durable tiers)
    pub fn from_parts(namespace: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            digest: digest.into(),
        }
    }

    /// Textual hash; also the durable tiers' file stem / primary key
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.digest
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.digest.chars().take(12).collect();
        write!(f, "{}:{}", self.namespace, short)
    }
}

/// Builds [`CacheKey`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyCodec;

impl KeyCodec {
    pub fn build(namespace: &str, params: &Params) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        // Separator keeps ("ab", "c...") and ("a", "bc...") apart
        hasher.update([0u8]);
        hasher.update(params.canonical_form().as_bytes());
        CacheKey {
            digest: hex::encode(hasher.finalize()),
            namespace: namespace.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
