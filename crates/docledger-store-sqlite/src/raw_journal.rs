//! Append-only journal of upstream payloads exactly as received.

use docledger_core::{Envelope, LedgerError, NoncePolicy, TableName, VersionRow, WriteStatus};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{doc_text, meta_object, meta_text};
use crate::collaborators::Collaborators;
use crate::error::SqlContext;
use crate::query::{Column, Op, Query};
use crate::schema::{ensure_table, TableKind};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone)]
pub struct RawJournal {
    table: TableName,
    deps: Collaborators,
}

impl RawJournal {
    #[must_use]
    pub fn new(table: TableName) -> Self {
        Self { table, deps: Collaborators::default() }
    }

    #[must_use]
    pub fn with_collaborators(mut self, deps: Collaborators) -> Self {
        self.deps = deps;
        self
    }

    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the table name is taken by another kind.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), LedgerError> {
        ensure_table(conn, &self.table, TableKind::RawJournal)
    }

    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.table.clone(), TableKind::RawJournal)
    }

    /// Store `doc` untouched under a fresh row id. Never deduplicates.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for non-object meta, plus storage errors.
    pub fn append(
        &self,
        uow: &mut UnitOfWork<'_>,
        doc: &Value,
        ext_id: &str,
        meta: Option<Value>,
        sat: Option<&str>,
    ) -> Result<VersionRow, LedgerError> {
        let meta = meta_object(meta)?;
        let uuid = Uuid::new_v4();
        let nonce = self.deps.hasher.nonce_for(doc, NoncePolicy::WholeDoc);
        let iat = self.deps.now_ms();
        let version = self.deps.next_version(iat)?;
        uow.execute(
            &format!(
                "INSERT INTO {} (uuid, version, ext_id, doc, meta, iat, sat, nonce)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.table.quoted()
            ),
            params![
                uuid.to_string(),
                version.to_string(),
                ext_id,
                doc_text(doc)?,
                meta_text(&meta),
                iat,
                sat,
                nonce.as_bytes().as_slice(),
            ],
        )
        .db(&format!("failed to append to {}", self.table))?;
        tracing::debug!(table = %self.table, %uuid, ext_id, "raw payload journaled");
        Ok(VersionRow { uuid, version, iat, nonce, status: WriteStatus::Inserted })
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get(&self, conn: &Connection, uuid: Uuid) -> Result<Option<Envelope>, LedgerError> {
        self.query().by_uuid(uuid).fetch_one(conn)
    }

    /// Every payload received for `ext_id`, oldest first.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn by_ext_id(&self, conn: &Connection, ext_id: &str) -> Result<Vec<Envelope>, LedgerError> {
        self.query().filter(Column::ExtId, Op::Eq, ext_id).oldest_first().fetch_all(conn)
    }
}
