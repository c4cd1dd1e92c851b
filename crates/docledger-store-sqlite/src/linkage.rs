//! Many-to-many provenance edges between raw records and internal documents.

use docledger_core::{LedgerError, TableName};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::meta_object;
use crate::collaborators::Collaborators;
use crate::error::SqlContext;
use crate::query::parse_uuid;
use crate::schema::{ensure_table, TableKind};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub ext_uuid: Uuid,
    pub int_uuid: Uuid,
    pub ext_id: Option<String>,
    pub source: Option<String>,
    pub meta: Value,
    pub iat: i64,
    pub uat: i64,
}

#[derive(Debug, Clone)]
pub struct LinkageStore {
    table: TableName,
    deps: Collaborators,
}

impl LinkageStore {
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
        ensure_table(conn, &self.table, TableKind::Linkage)
    }

    /// Insert the edge, or merge-patch `meta` into the existing one.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for non-object meta, plus storage errors.
    pub fn upsert(
        &self,
        uow: &mut UnitOfWork<'_>,
        ext_uuid: Uuid,
        int_uuid: Uuid,
        ext_id: Option<&str>,
        source: Option<&str>,
        meta: Option<Value>,
    ) -> Result<Link, LedgerError> {
        let meta = meta_object(meta)?;
        let now = self.deps.now_ms();
        let t = self.table.quoted();
        let link = uow
            .query_row(
                &format!(
                    "INSERT INTO {t} (ext_uuid, int_uuid, ext_id, source, meta, iat, uat)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(ext_uuid, int_uuid) DO UPDATE SET
                       ext_id = COALESCE(excluded.ext_id, {t}.ext_id),
                       source = COALESCE(excluded.source, {t}.source),
                       meta = json_patch({t}.meta, excluded.meta),
                       uat = excluded.uat
                     RETURNING ext_uuid, int_uuid, ext_id, source, meta, iat, uat"
                ),
                params![ext_uuid.to_string(), int_uuid.to_string(), ext_id, source, serde_json::to_string(&meta)?, now],
                RawLink::read,
            )
            .db(&format!("failed to upsert link into {}", self.table))?
            .into_link()?;
        tracing::debug!(table = %self.table, %ext_uuid, %int_uuid, "link upserted");
        Ok(link)
    }

    /// Internal documents derived from a raw record.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn links_for_ext(&self, conn: &Connection, ext_uuid: Uuid) -> Result<Vec<Link>, LedgerError> {
        self.select(conn, "ext_uuid", ext_uuid)
    }

    /// Raw records an internal document was derived from.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn links_for_int(&self, conn: &Connection, int_uuid: Uuid) -> Result<Vec<Link>, LedgerError> {
        self.select(conn, "int_uuid", int_uuid)
    }

    fn select(&self, conn: &Connection, column: &'static str, uuid: Uuid) -> Result<Vec<Link>, LedgerError> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT ext_uuid, int_uuid, ext_id, source, meta, iat, uat FROM {}
                 WHERE {column} = ?1 ORDER BY iat ASC, ext_uuid ASC, int_uuid ASC",
                self.table.quoted()
            ))
            .db(&format!("failed to prepare link lookup on {}", self.table))?;
        let rows = stmt
            .query_map(params![uuid.to_string()], RawLink::read)
            .db(&format!("failed to read links from {}", self.table))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.db("failed to read link row")?.into_link()?);
        }
        Ok(out)
    }
}

struct RawLink {
    ext_uuid: String,
    int_uuid: String,
    ext_id: Option<String>,
    source: Option<String>,
    meta: String,
    iat: i64,
    uat: i64,
}

impl RawLink {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ext_uuid: row.get(0)?,
            int_uuid: row.get(1)?,
            ext_id: row.get(2)?,
            source: row.get(3)?,
            meta: row.get(4)?,
            iat: row.get(5)?,
            uat: row.get(6)?,
        })
    }

    fn into_link(self) -> Result<Link, LedgerError> {
        Ok(Link {
            ext_uuid: parse_uuid(&self.ext_uuid)?,
            int_uuid: parse_uuid(&self.int_uuid)?,
            ext_id: self.ext_id,
            source: self.source,
            meta: serde_json::from_str(&self.meta)?,
            iat: self.iat,
            uat: self.uat,
        })
    }
}
