use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::hash::Nonce;
use crate::ids::VersionId;
use crate::period::Period;
use crate::UUID_KEY;

/// Key under which raw stores nest the envelope sidecar.
pub const NESTED_META_KEY: &str = "_meta";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Inserted,
    Updated,
    Unchanged,
}

impl WriteStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Identity of the row a write produced or left in place.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionRow {
    pub uuid: Uuid,
    pub version: VersionId,
    pub iat: i64,
    pub nonce: Nonce,
    pub status: WriteStatus,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnvelopeShape {
    /// Sidecar fields sit next to the document's own fields.
    Flat,
    /// Sidecar fields sit under [`NESTED_META_KEY`], leaving upstream names untouched.
    Nested,
}

/// One stored document plus its sidecar, as handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub uuid: Uuid,
    pub version: VersionId,
    pub doc: Value,
    pub meta: Value,
    pub iat: i64,
    pub uat: Option<i64>,
    pub dat: Option<i64>,
    pub sat: Option<String>,
    pub nonce: Nonce,
    pub ext_id: Option<String>,
    pub period: Option<Period>,
}

impl Envelope {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.dat.is_some()
    }

    #[must_use]
    pub fn version_row(&self, status: WriteStatus) -> VersionRow {
        VersionRow { uuid: self.uuid, version: self.version, iat: self.iat, nonce: self.nonce, status }
    }

    fn sidecar(&self) -> Map<String, Value> {
        let mut sidecar = Map::new();
        sidecar.insert("meta".to_string(), self.meta.clone());
        sidecar.insert("iat".to_string(), Value::from(self.iat));
        sidecar.insert("uat".to_string(), self.uat.map_or(Value::Null, Value::from));
        sidecar.insert("dat".to_string(), self.dat.map_or(Value::Null, Value::from));
        sidecar.insert("sat".to_string(), self.sat.clone().map_or(Value::Null, Value::from));
        sidecar.insert("version".to_string(), Value::from(self.version.to_string()));
        sidecar.insert("nonce".to_string(), Value::from(self.nonce.to_hex()));
        if let Some(ext_id) = &self.ext_id {
            sidecar.insert("ext_id".to_string(), Value::from(ext_id.clone()));
        }
        sidecar
    }

    /// Merge the document with its sidecar into one self-contained value.
    ///
    /// `Flat` writes the row uuid into the doc's `uuid` member. `Nested` leaves
    /// every doc member as stored and carries the row uuid in the sidecar.
    #[must_use]
    pub fn to_value(&self, shape: EnvelopeShape) -> Value {
        let mut out = match &self.doc {
            Value::Object(object) => object.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("doc".to_string(), other.clone());
                wrapped
            }
        };
        let uuid = Value::from(self.uuid.to_string());
        match shape {
            EnvelopeShape::Flat => {
                out.insert(UUID_KEY.to_string(), uuid);
                out.extend(self.sidecar());
            }
            EnvelopeShape::Nested => {
                let mut sidecar = self.sidecar();
                sidecar.insert(UUID_KEY.to_string(), uuid);
                out.insert(NESTED_META_KEY.to_string(), Value::Object(sidecar));
            }
        }
        Value::Object(out)
    }
}

/// Borrow `doc` as an object or fail with a validation error.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for any non-object value.
pub fn require_object(doc: &Value) -> Result<&Map<String, Value>, LedgerError> {
    doc.as_object().ok_or_else(|| {
        LedgerError::validation(format!("document MUST be a JSON object, got {}", kind_of(doc)))
    })
}

/// Parse the `uuid` member of a document, if any.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when `uuid` is present but not a UUID string.
pub fn doc_uuid(doc: &Value) -> Result<Option<Uuid>, LedgerError> {
    match doc.get(UUID_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|err| LedgerError::validation(format!("invalid document uuid {raw}: {err}"))),
        Some(other) => Err(LedgerError::validation(format!(
            "document uuid MUST be a string, got {}",
            kind_of(other)
        ))),
    }
}

/// Return `doc` with its `uuid` member set to `uuid`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when `doc` is not an object.
pub fn with_uuid(doc: Value, uuid: Uuid) -> Result<Value, LedgerError> {
    let Value::Object(mut object) = doc else {
        return Err(LedgerError::validation(format!(
            "document MUST be a JSON object, got {}",
            kind_of(&doc)
        )));
    };
    object.insert(UUID_KEY.to_string(), Value::from(uuid.to_string()));
    Ok(Value::Object(object))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
