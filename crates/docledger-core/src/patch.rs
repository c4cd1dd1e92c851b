//! JSON merge patch (RFC 7396) and related object merges.

use serde_json::{Map, Value};

/// Apply `patch` to `target` in place with RFC 7396 semantics.
///
/// Object members whose patch value is `null` are removed, nested objects
/// merge recursively, and any non-object patch replaces the target wholesale.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_object) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_object) = target else {
        return;
    };

    for (key, value) in patch_object {
        if value.is_null() {
            target_object.remove(key);
        } else {
            merge_patch(target_object.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Returns a patched copy of `target`.
#[must_use]
pub fn merged(target: &Value, patch: &Value) -> Value {
    let mut out = target.clone();
    merge_patch(&mut out, patch);
    out
}

/// A patch that would change nothing: `null` or `{}`.
#[must_use]
pub fn is_empty_patch(patch: &Value) -> bool {
    match patch {
        Value::Null => true,
        Value::Object(object) => object.is_empty(),
        _ => false,
    }
}

/// Copy keys from `extra` into `target` only where `target` has none.
///
/// Unlike [`merge_patch`], nothing already present is ever overwritten.
pub fn merge_absent(target: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (key, value) in extra {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}
