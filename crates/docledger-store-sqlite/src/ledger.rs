use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docledger_core::LedgerError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::SqlContext;
use crate::lock::{InProcessKeyedLock, KeyedLock};
use crate::schema::{self, table_exists, CatalogEntry, SchemaStatus};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Catalog entries whose table is gone from the database.
    pub missing_tables: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok && self.foreign_key_violations.is_empty() && self.missing_tables.is_empty()
    }
}

/// An owned SQLite connection configured for ledger use.
pub struct SqliteLedger {
    conn: Connection,
    locks: Arc<dyn KeyedLock>,
}

impl SqliteLedger {
    /// Open a SQLite database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)
            .db(&format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::configure(Connection::open_in_memory().db("failed to open in-memory database")?)
    }

    fn configure(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .db("failed to configure sqlite pragmas")?;
        Ok(Self { conn, locks: InProcessKeyedLock::global() })
    }

    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn KeyedLock>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// # Errors
    /// Returns [`LedgerError::Busy`] when the write lock cannot be taken.
    pub fn begin(&mut self) -> Result<UnitOfWork<'_>, LedgerError> {
        UnitOfWork::begin_with(&mut self.conn, Arc::clone(&self.locks), None)
    }

    /// # Errors
    /// Returns [`LedgerError::Busy`] when the write lock cannot be taken before `timeout`.
    pub fn begin_with_deadline(&mut self, timeout: Duration) -> Result<UnitOfWork<'_>, LedgerError> {
        UnitOfWork::begin_with(&mut self.conn, Arc::clone(&self.locks), Some(timeout))
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        schema::schema_status(&self.conn)
    }

    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<(), LedgerError> {
        schema::migrate(&self.conn)
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_tables(&self) -> Result<Vec<CatalogEntry>, LedgerError> {
        schema::list_tables(&self.conn)
    }

    /// Run quick-check, foreign-key-check, and catalog health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, LedgerError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .db("failed to run PRAGMA quick_check")?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check").db("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .db("failed to run PRAGMA foreign_key_check")?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.db("failed to read foreign key violation")?);
        }

        let schema_status = self.schema_status()?;
        let mut missing_tables = Vec::new();
        if schema_status.pending_versions.is_empty() {
            for entry in self.list_tables()? {
                if !table_exists(&self.conn, &entry.table_name)? {
                    missing_tables.push(entry.table_name);
                }
            }
        }

        let report = IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            missing_tables,
            schema_status,
        };
        if !report.is_clean() {
            tracing::warn!(?report, "integrity check found problems");
        }
        Ok(report)
    }
}
