use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::LedgerError;

/// Time-sortable identifier assigned to every accepted write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionId(pub Ulid);

impl VersionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    #[must_use]
    pub fn timestamp_ms(self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VersionId {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| LedgerError::validation(format!("invalid version id {raw}: {err}")))
    }
}

const MAX_TABLE_NAME_LEN: usize = 63;

/// A table identifier that is safe to splice into SQL text.
///
/// Only `[A-Za-z_][A-Za-z0-9_]*` up to 63 characters is accepted, so store
/// constructors can never be handed an injection vector through a table name.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `raw` is not a plain identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            return Err(LedgerError::configuration("table name MUST NOT be empty"));
        };
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(LedgerError::configuration(format!(
                "table name MUST start with a letter or underscore: {raw}"
            )));
        }
        if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(LedgerError::configuration(format!(
                "table name MUST contain only ASCII letters, digits, or underscores: {raw}"
            )));
        }
        if raw.len() > MAX_TABLE_NAME_LEN {
            return Err(LedgerError::configuration(format!(
                "table name exceeds {MAX_TABLE_NAME_LEN} characters: {raw}"
            )));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for use in SQL text.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl FromStr for TableName {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_accepts_identifiers() {
        for raw in ["orders", "_raw", "int_orders_v2", "A1"] {
            assert!(TableName::new(raw).is_ok(), "{raw} should be accepted");
        }
    }

    #[test]
    fn table_name_rejects_injection_and_garbage() {
        for raw in ["", "1orders", "orders; DROP TABLE x", "or\"ders", "or-ders", "ünï"] {
            assert!(
                matches!(TableName::new(raw), Err(LedgerError::Configuration(_))),
                "{raw:?} should be rejected"
            );
        }
        assert!(TableName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn version_ids_sort_by_creation_time() -> Result<(), LedgerError> {
        let early = VersionId(Ulid::from_parts(1_000, 5));
        let late = VersionId(Ulid::from_parts(2_000, 1));
        assert!(early < late);
        assert_eq!(late.to_string().parse::<VersionId>()?, late);
        assert!(early.to_string() < late.to_string());
        Ok(())
    }
}
