//! Deterministic cache key generation
//!
//! Equivalent logical inputs must always produce the same key: positional
//! parameters are appended in call order, named parameters are sorted by
//! name, and non-primitive arguments are content-hashed.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Builds `prefix:part:part:name=part` style keys.
#[derive(Debug)]
pub struct KeyBuilder {
    prefix: String,
    parts: Vec<String>,
    named: Vec<(String, String)>,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            parts: Vec::new(),
            named: Vec::new(),
        }
    }

    /// Append a positional primitive parameter
    pub fn part(mut self, value: impl ToString) -> Self {
        self.parts.push(value.to_string());
        self
    }

    /// Append a named parameter; names are sorted at build time so argument
    /// order does not change the key
    pub fn named(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.named.push((name.into(), value.to_string()));
        self
    }

    /// Append a positional structured argument by content hash
    pub fn hashed(mut self, value: &Value) -> Self {
        self.parts.push(hash_value(value));
        self
    }

    /// Append a named structured argument by content hash
    pub fn named_hashed(mut self, name: impl Into<String>, value: &Value) -> Self {
        self.named.push((name.into(), hash_value(value)));
        self
    }

    pub fn build(mut self) -> String {
        let mut segments = Vec::with_capacity(1 + self.parts.len() + self.named.len());
        segments.push(self.prefix);
        segments.extend(self.parts);
        self.named.sort_by(|a, b| a.0.cmp(&b.0));
        segments.extend(self.named.into_iter().map(|(k, v)| format!("{}={}", k, v)));
        segments.join(":")
    }
}

/// Content hash of a structured value. Object keys are serialized in sorted
/// order (serde_json maps preserve insertion order, so the value is
/// canonicalized first) to keep the hash independent of construction order.
pub fn hash_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let serialized = canonical.to_string();
    hash_content(serialized.as_bytes())
}

/// Hex-encoded, truncated SHA-256 of raw content
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
