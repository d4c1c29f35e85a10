//! Content hashing for behavior graph definitions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content hash of a behavior graph definition.
///
/// Hashes supplied by a store are opaque: the reconciler only ever compares
/// two of them for equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphHash(String);

impl GraphHash {
    /// Wrap a hash produced elsewhere.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Compute a hash from a graph definition.
    ///
    /// The definition is rendered as canonical JSON (sorted keys, no extra
    /// whitespace) first, so key order does not affect the result.
    pub fn from_definition(definition: &serde_json::Value) -> Self {
        let canonical = canonical_json(definition);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GraphHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

/// JSON string literal; serde_json's escaping is already deterministic.
fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
