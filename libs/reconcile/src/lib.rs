//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconciliation loops that converge observed state to desired state.
//! Key concepts:
//!
//! - **Desired state**: What the cluster should look like (resource specs).
//! - **Observed state**: What the cache says the cluster looks like.
//! - **Convergence**: Repeated passes that each recompute intents from the
//!   full observed state, never from the event that triggered them.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Backoff is per key; one failing key never slows another

mod backoff;
pub mod patch;

use sha2::{Digest, Sha256};

pub use backoff::BackoffPolicy;
pub use patch::{strategic_merge, strategic_merge_typed, PatchError, PatchSchema};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a pod template has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..8]))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters of the hash, for use in generated names.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.short().len(), 8);
    }

    #[test]
    fn test_spec_hash_changes_with_content() {
        let hash1 = SpecHash::from_json(&serde_json::json!({"image": "a"}));
        let hash2 = SpecHash::from_json(&serde_json::json!({"image": "b"}));
        assert_ne!(hash1, hash2);
    }
}
