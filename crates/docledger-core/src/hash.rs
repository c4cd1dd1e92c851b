use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::LedgerError;
use crate::UUID_KEY;

/// Content hash of a document, the dedup key of every store.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Nonce(pub [u8; 32]);

impl Nonce {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when `bytes` is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, LedgerError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            LedgerError::validation(format!("nonce MUST be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<Nonce> for String {
    fn from(value: Nonce) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for Nonce {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value)
            .map_err(|err| LedgerError::validation(format!("invalid nonce hex {value}: {err}")))?;
        Self::from_slice(&bytes)
    }
}

/// Which part of a document contributes to its nonce.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoncePolicy {
    /// Hash the document without its `uuid` key.
    #[default]
    ExcludeUuid,
    /// Hash the document exactly as given.
    WholeDoc,
}

pub trait ContentHasher: Send + Sync {
    fn digest(&self, value: &Value) -> Nonce;

    fn nonce_for(&self, doc: &Value, policy: NoncePolicy) -> Nonce {
        match (policy, doc) {
            (NoncePolicy::ExcludeUuid, Value::Object(object)) if object.contains_key(UUID_KEY) => {
                let mut stripped = object.clone();
                stripped.remove(UUID_KEY);
                self.digest(&Value::Object(stripped))
            }
            _ => self.digest(doc),
        }
    }
}

/// SHA-256 over canonical JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest(&self, value: &Value) -> Nonce {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(value).as_bytes());
        Nonce(hasher.finalize().into())
    }
}

/// Serialize with object keys sorted at every depth.
///
/// Maps keep insertion order in this workspace, so two semantically equal
/// documents can serialize differently; hashing and column comparisons go
/// through this form instead.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => {
            let mut keys = object.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = object.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
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
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": null}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":null,"z":[3,{"x":2,"y":1}]},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_unicode_and_escapes() {
        let value = json!({"name": "Zoë \"quoted\"\n"});
        assert_eq!(canonical_json(&value), "{\"name\":\"Zoë \\\"quoted\\\"\\n\"}");
    }

    #[test]
    fn exclude_uuid_policy_ignores_identity() {
        let hasher = Sha256Hasher;
        let a = json!({"uuid": "one", "name": "foo"});
        let b = json!({"uuid": "two", "name": "foo"});
        assert_eq!(
            hasher.nonce_for(&a, NoncePolicy::ExcludeUuid),
            hasher.nonce_for(&b, NoncePolicy::ExcludeUuid)
        );
        assert_ne!(
            hasher.nonce_for(&a, NoncePolicy::WholeDoc),
            hasher.nonce_for(&b, NoncePolicy::WholeDoc)
        );
    }

    #[test]
    fn nonce_hex_round_trips_through_serde() -> Result<(), serde_json::Error> {
        let nonce = Sha256Hasher.digest(&json!({"a": 1}));
        let encoded = serde_json::to_value(nonce)?;
        assert_eq!(encoded, Value::String(nonce.to_hex()));
        let decoded: Nonce = serde_json::from_value(encoded)?;
        assert_eq!(decoded, nonce);
        Ok(())
    }

    proptest! {
        #[test]
        fn property_digest_ignores_key_order(keys in proptest::collection::btree_set("[a-z]{1,6}", 1..8)) {
            let forward = keys.iter().enumerate().map(|(i, k)| (k.clone(), json!(i))).collect::<serde_json::Map<_, _>>();
            let backward = keys.iter().enumerate().rev().map(|(i, k)| (k.clone(), json!(i))).collect::<serde_json::Map<_, _>>();
            prop_assert_eq!(
                Sha256Hasher.digest(&Value::Object(forward)),
                Sha256Hasher.digest(&Value::Object(backward))
            );
        }
    }
}
