//! Value <-> column text helpers shared by the stores.

use docledger_core::{canonical_json, LedgerError};
use serde_json::{Map, Value};

/// Meta defaults to `{}`; anything but an object is rejected.
pub(crate) fn meta_object(meta: Option<Value>) -> Result<Value, LedgerError> {
    match meta {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(object @ Value::Object(_)) => Ok(object),
        Some(_) => Err(LedgerError::validation("meta MUST be a JSON object")),
    }
}

/// Meta is stored canonically so the engine can compare it as text.
pub(crate) fn meta_text(meta: &Value) -> String {
    canonical_json(meta)
}

pub(crate) fn doc_text(doc: &Value) -> Result<String, LedgerError> {
    Ok(serde_json::to_string(doc)?)
}
