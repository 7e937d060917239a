//! Deterministic cache key derivation.
//!
//! A key is `"<resource>:<sha256-hex>"` where the digest covers the
//! resource name and a canonical rendering of the parameters. Object
//! fields are emitted in sorted order, so field order never changes a key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `resource` requested with `params`.
    pub fn new(resource: &str, params: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(resource.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        Self(format!("{resource}:{}", hex::encode(hasher.finalize())))
    }

    /// Key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource name the key was derived from.
    pub fn resource(&self) -> &str {
        self.0.rsplit_once(':').map(|(resource, _)| resource).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_stability() {
        let a = CacheKey::new("page", &json!({"id": 42}));
        let b = CacheKey::new("page", &json!({"id": 42}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_field_order_independent() {
        let a = CacheKey::new("pages", &json!({"limit": 10, "tag": "rust", "filter": {"b": 1, "a": 2}}));
        let b = CacheKey::new("pages", &json!({"filter": {"a": 2, "b": 1}, "tag": "rust", "limit": 10}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_distinguishes_params() {
        let a = CacheKey::new("page", &json!({"id": 42}));
        let b = CacheKey::new("page", &json!({"id": "42"}));
        let c = CacheKey::new("page", &json!({"id": 43}));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_distinguishes_array_order() {
        let a = CacheKey::new("pages", &json!({"ids": [1, 2]}));
        let b = CacheKey::new("pages", &json!({"ids": [2, 1]}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_distinguishes_resource() {
        let a = CacheKey::new("page", &json!({"id": 1}));
        let b = CacheKey::new("user", &json!({"id": 1}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_field_names_escaped() {
        let a = CacheKey::new("q", &json!({"a\":1,\"b": 2}));
        let b = CacheKey::new("q", &json!({"a": 1, "b": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_format() {
        let key = CacheKey::new("page", &json!({"id": 42}));
        assert!(key.as_str().starts_with("page:"));
        assert_eq!(key.resource(), "page");
        let digest = key.as_str().trim_start_matches("page:");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_resource_with_colon() {
        let key = CacheKey::new("wiki:page", &Value::Null);
        assert_eq!(key.resource(), "wiki:page");
    }
}
