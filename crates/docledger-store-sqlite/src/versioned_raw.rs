//! Upstream payload history keyed by a stable identity derived from
//! `(table, source, ext_id)`.

use docledger_core::{
    identity, require_object, with_uuid, Envelope, LedgerError, TableName, ValidityBounds, VersionRow,
    WriteStatus,
};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{doc_text, meta_object, meta_text};
use crate::collaborators::{Collaborators, StoreConfig};
use crate::error::SqlContext;
use crate::query::{Column, Op, Query};
use crate::schema::{ensure_table, TableKind};
use crate::unit_of_work::UnitOfWork;

/// Input to [`VersionedRawChangeLog::append_if_changed`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawAppend<'a> {
    pub doc: Value,
    pub ext_id: &'a str,
    pub source_name: &'a str,
    pub meta: Option<Value>,
    pub sat: Option<&'a str>,
    pub stream: Option<&'a str>,
    pub uuid_scope: Option<&'a str>,
}

impl<'a> RawAppend<'a> {
    #[must_use]
    pub fn new(doc: Value, ext_id: &'a str, source_name: &'a str) -> Self {
        Self { doc, ext_id, source_name, meta: None, sat: None, stream: None, uuid_scope: None }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn with_sat(mut self, sat: &'a str) -> Self {
        self.sat = Some(sat);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: &'a str) -> Self {
        self.stream = Some(stream);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, uuid_scope: &'a str) -> Self {
        self.uuid_scope = Some(uuid_scope);
        self
    }

    /// Identity discriminator: the explicit scope, else the stream.
    #[must_use]
    pub fn scope(&self) -> Option<&'a str> {
        self.uuid_scope.or(self.stream)
    }
}

#[derive(Debug, Clone)]
pub struct VersionedRawChangeLog {
    table: TableName,
    deps: Collaborators,
    config: StoreConfig,
}

impl VersionedRawChangeLog {
    #[must_use]
    pub fn new(table: TableName) -> Self {
        Self { table, deps: Collaborators::default(), config: StoreConfig::default() }
    }

    #[must_use]
    pub fn with_collaborators(mut self, deps: Collaborators) -> Self {
        self.deps = deps;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the table name is taken by another kind.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), LedgerError> {
        ensure_table(conn, &self.table, TableKind::VersionedRaw)
    }

    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.table.clone(), TableKind::VersionedRaw)
    }

    /// Identity of an upstream record in this table.
    #[must_use]
    pub fn derive_uuid(&self, ext_id: &str, source_name: &str, uuid_scope: Option<&str>) -> Uuid {
        let source = identity::source_key(source_name, uuid_scope);
        identity::stable_id_sourced(self.table.as_str(), &source, ext_id)
    }

    /// Append a new version unless its content matches the latest one.
    ///
    /// The doc's own `uuid` member is overwritten with the derived identity.
    /// Concurrent appends for the same identity serialize on its keyed lock.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for non-object docs or meta, plus
    /// lock and storage errors.
    pub fn append_if_changed(
        &self,
        uow: &mut UnitOfWork<'_>,
        input: RawAppend<'_>,
    ) -> Result<VersionRow, LedgerError> {
        require_object(&input.doc)?;
        let source = identity::source_key(input.source_name, input.scope());
        let uuid = identity::stable_id_sourced(self.table.as_str(), &source, input.ext_id);
        let meta = meta_object(input.meta)?;
        let doc = with_uuid(input.doc, uuid)?;
        let nonce = self.deps.hasher.nonce_for(&doc, self.config.nonce_policy);

        uow.lock(identity::lock_key(uuid))?;
        if let Some(latest) = Query::latest(self.table.clone(), TableKind::VersionedRaw, uuid).fetch_one(uow.conn())? {
            if latest.nonce == nonce {
                tracing::debug!(table = %self.table, %uuid, ext_id = input.ext_id, "raw version unchanged");
                return Ok(latest.version_row(WriteStatus::Unchanged));
            }
        }

        let iat = self.deps.now_ms();
        let version = self.deps.next_version(iat)?;
        let period = self.deps.intervals.period(ValidityBounds::from_meta(&meta, iat, None));
        uow.execute(
            &format!(
                "INSERT INTO {} (uuid, version, ext_id, source, stream, doc, meta, iat, sat, nonce, period_start, period_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                self.table.quoted()
            ),
            params![
                uuid.to_string(),
                version.to_string(),
                input.ext_id,
                source,
                input.stream,
                doc_text(&doc)?,
                meta_text(&meta),
                iat,
                input.sat,
                nonce.as_bytes().as_slice(),
                period.start,
                period.end,
            ],
        )
        .db(&format!("failed to append to {}", self.table))?;

        tracing::debug!(table = %self.table, %uuid, %version, ext_id = input.ext_id, "raw version appended");
        Ok(VersionRow { uuid, version, iat, nonce, status: WriteStatus::Inserted })
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get_latest(&self, conn: &Connection, uuid: Uuid) -> Result<Option<Envelope>, LedgerError> {
        Query::latest(self.table.clone(), TableKind::VersionedRaw, uuid).fetch_one(conn)
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn history(&self, conn: &Connection, uuid: Uuid) -> Result<Vec<Envelope>, LedgerError> {
        self.query().by_uuid(uuid).oldest_first().fetch_all(conn)
    }

    /// All versions recorded under `ext_id`, across sources, oldest first.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn by_ext_id(&self, conn: &Connection, ext_id: &str) -> Result<Vec<Envelope>, LedgerError> {
        self.query().filter(Column::ExtId, Op::Eq, ext_id).oldest_first().fetch_all(conn)
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get_as_of(&self, conn: &Connection, uuid: Uuid, at_ms: i64) -> Result<Option<Envelope>, LedgerError> {
        let candidate = self
            .query()
            .by_uuid(uuid)
            .filter(Column::PeriodStart, Op::Le, at_ms)
            .newest_first()
            .fetch_one(conn)?;
        Ok(candidate.filter(|envelope| envelope.period.is_some_and(|period| period.contains(at_ms))))
    }
}
