//! Standardized provenance baked into every pipeline-produced document's meta.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ids::VersionId;

pub const DEFAULT_SCHEMA_VERSION: &str = "1";

/// One upstream record version an internal document was derived from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceRef {
    pub stream: String,
    pub ext_id: Option<String>,
    pub ext_uuid: Uuid,
    pub ext_version: VersionId,
    pub ext_iat: i64,
}

impl SourceRef {
    fn dedup_key(&self) -> (Uuid, VersionId, &str) {
        (self.ext_uuid, self.ext_version, self.stream.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct InterfaceInfo {
    pub name: String,
    pub id: Option<String>,
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct TransformInfo {
    pub name: String,
    pub version: String,
    pub config_hash: Option<String>,
}

/// Everything the pipeline stamps onto a candidate's meta.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProvenanceStamp<'a> {
    pub schema_version: &'a str,
    pub actor: Option<&'a str>,
    pub interface: &'a InterfaceInfo,
    pub transform: &'a TransformInfo,
}

/// Union of `existing` and `incoming`, first occurrence wins,
/// keyed by `(ext_uuid, ext_version, stream)`.
#[must_use]
pub fn merge_sources(existing: &[SourceRef], incoming: &[SourceRef]) -> Vec<SourceRef> {
    let mut out: Vec<SourceRef> = Vec::with_capacity(existing.len() + incoming.len());
    for source in existing.iter().chain(incoming) {
        if !out.iter().any(|seen| seen.dedup_key() == source.dedup_key()) {
            out.push(source.clone());
        }
    }
    out
}

/// Read the `src` list of a meta object. Entries that do not parse are dropped.
#[must_use]
pub fn sources_of(meta: &Value) -> Vec<SourceRef> {
    meta.get("src")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<SourceRef>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Produce the final meta of a pipeline candidate.
///
/// A schema version already present in `meta` is preserved. Candidate-supplied
/// `src` entries are kept and merged with `prior` and `current`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when `meta` is neither null nor an object.
pub fn bake(
    meta: Option<Value>,
    stamp: &ProvenanceStamp<'_>,
    prior: &[SourceRef],
    current: &SourceRef,
) -> Result<Value, LedgerError> {
    let mut object = match meta {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(object)) => object,
        Some(_) => {
            return Err(LedgerError::validation("candidate meta MUST be a JSON object"));
        }
    };

    let candidate_sources = sources_of(&Value::Object(object.clone()));
    let sources = merge_sources(&merge_sources(prior, &candidate_sources), std::slice::from_ref(current));

    object.entry("schema".to_string()).or_insert_with(|| Value::from(stamp.schema_version));
    if let Some(actor) = stamp.actor {
        object.entry("actor".to_string()).or_insert_with(|| Value::from(actor));
    }
    object.insert("interface".to_string(), serde_json::to_value(stamp.interface)?);
    object.insert("transform".to_string(), serde_json::to_value(stamp.transform)?);
    object.insert("src".to_string(), serde_json::to_value(sources)?);
    Ok(Value::Object(object))
}
