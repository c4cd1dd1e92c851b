//! Catalog of ledger tables and the per-kind DDL behind them.

use std::fmt;
use std::str::FromStr;

use docledger_core::{LedgerError, TableName};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::SqlContext;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_tables (
  table_name TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('snapshot','change_log','raw_journal','versioned_raw','linkage')),
  created_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Snapshot,
    ChangeLog,
    RawJournal,
    VersionedRaw,
    Linkage,
}

impl TableKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::ChangeLog => "change_log",
            Self::RawJournal => "raw_journal",
            Self::VersionedRaw => "versioned_raw",
            Self::Linkage => "linkage",
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] for unknown kinds.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "snapshot" => Ok(Self::Snapshot),
            "change_log" => Ok(Self::ChangeLog),
            "raw_journal" => Ok(Self::RawJournal),
            "versioned_raw" => Ok(Self::VersionedRaw),
            "linkage" => Ok(Self::Linkage),
            _ => Err(LedgerError::configuration(format!("unknown table kind: {value}"))),
        }
    }

    fn ddl(self, table: &TableName) -> String {
        let t = table.quoted();
        let name = table.as_str();
        match self {
            Self::Snapshot => format!(
                r"
CREATE TABLE IF NOT EXISTS {t} (
  uuid TEXT PRIMARY KEY,
  version TEXT NOT NULL UNIQUE,
  doc TEXT NOT NULL CHECK (json_valid(doc)),
  meta TEXT NOT NULL CHECK (json_valid(meta)),
  iat INTEGER NOT NULL,
  uat INTEGER NOT NULL,
  dat INTEGER,
  sat TEXT,
  nonce BLOB NOT NULL CHECK (length(nonce) = 32)
);
CREATE INDEX IF NOT EXISTS {name}_live ON {t}(dat);
"
            ),
            Self::ChangeLog => format!(
                r"
CREATE TABLE IF NOT EXISTS {t} (
  version TEXT PRIMARY KEY,
  uuid TEXT NOT NULL,
  doc TEXT NOT NULL CHECK (json_valid(doc)),
  meta TEXT NOT NULL CHECK (json_valid(meta)),
  iat INTEGER NOT NULL,
  dat INTEGER,
  sat TEXT,
  nonce BLOB NOT NULL CHECK (length(nonce) = 32),
  period_start INTEGER NOT NULL,
  period_end INTEGER
);
CREATE INDEX IF NOT EXISTS {name}_by_uuid ON {t}(uuid, iat DESC, version DESC);
"
            ),
            Self::RawJournal => format!(
                r"
CREATE TABLE IF NOT EXISTS {t} (
  uuid TEXT PRIMARY KEY,
  version TEXT NOT NULL,
  ext_id TEXT NOT NULL,
  doc TEXT NOT NULL CHECK (json_valid(doc)),
  meta TEXT NOT NULL CHECK (json_valid(meta)),
  iat INTEGER NOT NULL,
  sat TEXT,
  nonce BLOB NOT NULL CHECK (length(nonce) = 32)
);
CREATE INDEX IF NOT EXISTS {name}_by_ext_id ON {t}(ext_id, iat);
"
            ),
            Self::VersionedRaw => format!(
                r"
CREATE TABLE IF NOT EXISTS {t} (
  uuid TEXT NOT NULL,
  version TEXT NOT NULL,
  ext_id TEXT NOT NULL,
  source TEXT NOT NULL,
  stream TEXT,
  doc TEXT NOT NULL CHECK (json_valid(doc)),
  meta TEXT NOT NULL CHECK (json_valid(meta)),
  iat INTEGER NOT NULL,
  sat TEXT,
  nonce BLOB NOT NULL CHECK (length(nonce) = 32),
  period_start INTEGER NOT NULL,
  period_end INTEGER,
  PRIMARY KEY (uuid, version)
);
CREATE INDEX IF NOT EXISTS {name}_latest ON {t}(uuid, iat DESC, version DESC);
CREATE INDEX IF NOT EXISTS {name}_by_ext_id ON {t}(ext_id);
"
            ),
            Self::Linkage => format!(
                r"
CREATE TABLE IF NOT EXISTS {t} (
  ext_uuid TEXT NOT NULL,
  int_uuid TEXT NOT NULL,
  ext_id TEXT,
  source TEXT,
  meta TEXT NOT NULL CHECK (json_valid(meta)),
  iat INTEGER NOT NULL,
  uat INTEGER NOT NULL,
  PRIMARY KEY (ext_uuid, int_uuid)
);
CREATE INDEX IF NOT EXISTS {name}_by_int ON {t}(int_uuid);
"
            ),
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableKind {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub table_name: String,
    pub kind: TableKind,
    pub created_at: String,
}

/// # Errors
/// Returns [`LedgerError::Storage`] when the migrations table cannot be read or created.
pub fn schema_status(conn: &Connection) -> Result<SchemaStatus, LedgerError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .db("failed to apply ledger_schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
    } else {
        Vec::new()
    };
    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

/// Bring the catalog schema up to [`LATEST_SCHEMA_VERSION`].
///
/// # Errors
/// Returns [`LedgerError::Configuration`] for a database newer than this build,
/// or a storage error when a migration step fails.
pub fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .db("failed to apply ledger_schema_migrations table")?;
    let version = current_schema_version(conn)?;
    if version > LATEST_SCHEMA_VERSION {
        return Err(LedgerError::configuration(format!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        )));
    }
    if version < 1 {
        conn.execute_batch(MIGRATION_001_SQL).db("failed to apply migration v1")?;
        record_schema_version(conn, 1)?;
    }
    Ok(())
}

/// Create `table` as a `kind` table if needed and register it in the catalog.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when `table` is already registered
/// under another kind.
pub fn ensure_table(conn: &Connection, table: &TableName, kind: TableKind) -> Result<(), LedgerError> {
    migrate(conn)?;
    if let Some(existing) = registered_kind(conn, table)? {
        if existing != kind {
            return Err(LedgerError::configuration(format!(
                "table {table} is registered as {existing}, not {kind}"
            )));
        }
        return Ok(());
    }
    conn.execute_batch(&kind.ddl(table))
        .db(&format!("failed to create {kind} table {table}"))?;
    conn.execute(
        "INSERT INTO ledger_tables(table_name, kind, created_at) VALUES (?1, ?2, ?3)",
        params![table.as_str(), kind.as_str(), now_rfc3339()?],
    )
    .db(&format!("failed to register table {table}"))?;
    tracing::debug!(table = %table, kind = kind.as_str(), "registered ledger table");
    Ok(())
}

/// # Errors
/// Returns [`LedgerError::Storage`] when the catalog cannot be read.
pub fn registered_kind(conn: &Connection, table: &TableName) -> Result<Option<TableKind>, LedgerError> {
    let kind = conn
        .query_row(
            "SELECT kind FROM ledger_tables WHERE table_name = ?1",
            params![table.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .db(&format!("failed to look up table {table}"))?;
    kind.as_deref().map(TableKind::parse).transpose()
}

/// # Errors
/// Returns [`LedgerError::Storage`] when the catalog cannot be read.
pub fn list_tables(conn: &Connection) -> Result<Vec<CatalogEntry>, LedgerError> {
    migrate(conn)?;
    let mut stmt = conn
        .prepare("SELECT table_name, kind, created_at FROM ledger_tables ORDER BY table_name ASC")
        .db("failed to prepare catalog listing")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .db("failed to list catalog")?;
    let mut out = Vec::new();
    for row in rows {
        let (table_name, kind, created_at) = row.db("failed to read catalog row")?;
        out.push(CatalogEntry { table_name, kind: TableKind::parse(&kind)?, created_at });
    }
    Ok(out)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, LedgerError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .db(&format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64, LedgerError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM ledger_schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .db("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT OR IGNORE INTO ledger_schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .db(&format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, LedgerError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Serialization(format!("failed to format RFC3339 timestamp: {err}")))
}
