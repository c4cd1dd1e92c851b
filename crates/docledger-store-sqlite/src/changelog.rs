//! Append-only version history with consecutive dedup.

use docledger_core::{
    doc_uuid, identity, require_object, with_uuid, Envelope, LedgerError, TableName, ValidityBounds, VersionId,
    VersionRow, WriteStatus,
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

/// One row to append; `dat` marks a deletion event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LogEntry {
    pub doc: Value,
    pub meta: Value,
    pub sat: Option<String>,
    pub dat: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ChangeLog {
    table: TableName,
    deps: Collaborators,
    config: StoreConfig,
}

impl ChangeLog {
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
        ensure_table(conn, &self.table, TableKind::ChangeLog)
    }

    /// A query over this log, to be narrowed by the caller.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.table.clone(), TableKind::ChangeLog)
    }

    /// Append `doc` unless it matches the latest version of the same uuid.
    ///
    /// The uuid comes from `doc.uuid`, or a fresh v4 when absent. A dedup skip
    /// returns the latest row with [`WriteStatus::Unchanged`].
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for non-object docs or meta, and
    /// lock or storage errors from the unit of work.
    pub fn append(
        &self,
        uow: &mut UnitOfWork<'_>,
        doc: Value,
        meta: Option<Value>,
        sat: Option<&str>,
    ) -> Result<VersionRow, LedgerError> {
        let meta = meta_object(meta)?;
        self.append_entry(uow, LogEntry { doc, meta, sat: sat.map(str::to_string), dat: None })
    }

    pub(crate) fn append_entry(&self, uow: &mut UnitOfWork<'_>, entry: LogEntry) -> Result<VersionRow, LedgerError> {
        require_object(&entry.doc)?;
        let uuid = doc_uuid(&entry.doc)?.unwrap_or_else(Uuid::new_v4);
        let doc = with_uuid(entry.doc, uuid)?;
        let nonce = self.deps.hasher.nonce_for(&doc, self.config.nonce_policy);

        uow.lock(identity::lock_key(uuid))?;
        if let Some(latest) = Query::latest(self.table.clone(), TableKind::ChangeLog, uuid).fetch_one(uow.conn())? {
            if latest.nonce == nonce && latest.dat.is_some() == entry.dat.is_some() {
                tracing::debug!(table = %self.table, %uuid, version = %latest.version, "changelog append deduplicated");
                return Ok(latest.version_row(WriteStatus::Unchanged));
            }
        }

        let iat = self.deps.now_ms();
        let version = self.deps.next_version(iat)?;
        let period = self.deps.intervals.period(ValidityBounds::from_meta(&entry.meta, iat, entry.dat));
        uow.execute(
            &format!(
                "INSERT INTO {} (version, uuid, doc, meta, iat, dat, sat, nonce, period_start, period_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                self.table.quoted()
            ),
            params![
                version.to_string(),
                uuid.to_string(),
                doc_text(&doc)?,
                meta_text(&entry.meta),
                iat,
                entry.dat,
                entry.sat,
                nonce.as_bytes().as_slice(),
                period.start,
                period.end,
            ],
        )
        .db(&format!("failed to append to {}", self.table))?;

        tracing::debug!(table = %self.table, %uuid, %version, "changelog version appended");
        Ok(VersionRow { uuid, version, iat, nonce, status: WriteStatus::Inserted })
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get_latest(&self, conn: &Connection, uuid: Uuid) -> Result<Option<Envelope>, LedgerError> {
        Query::latest(self.table.clone(), TableKind::ChangeLog, uuid).fetch_one(conn)
    }

    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get_by_version(&self, conn: &Connection, version: VersionId) -> Result<Option<Envelope>, LedgerError> {
        self.query().filter(Column::Version, Op::Eq, version).fetch_one(conn)
    }

    /// Every version of `uuid`, oldest first.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn history(&self, conn: &Connection, uuid: Uuid) -> Result<Vec<Envelope>, LedgerError> {
        self.query().by_uuid(uuid).oldest_first().fetch_all(conn)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn count(&self, conn: &Connection, uuid: Uuid) -> Result<u64, LedgerError> {
        self.query().by_uuid(uuid).count(conn)
    }

    /// The version valid at `at_ms`: the newest one whose period has started,
    /// provided that period has not yet ended.
    ///
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use docledger_core::ManualClock;
    use serde_json::json;

    use super::*;

    fn fixture(clock: &Arc<ManualClock>) -> anyhow::Result<(Connection, ChangeLog)> {
        let conn = Connection::open_in_memory()?;
        let log = ChangeLog::new(TableName::new("order_log")?)
            .with_collaborators(Collaborators::default().with_clock(clock.clone()));
        log.ensure_schema(&conn)?;
        Ok((conn, log))
    }

    #[test]
    fn consecutive_identical_appends_dedup() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::at(1_000));
        let (mut conn, log) = fixture(&clock)?;
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::begin(&mut conn)?;
        let first = log.append(&mut uow, json!({"uuid": id.to_string(), "a": 1}), None, None)?;
        clock.advance(10);
        let repeat = log.append(&mut uow, json!({"a": 1, "uuid": id.to_string()}), Some(json!({"x": 1})), None)?;
        clock.advance(10);
        let changed = log.append(&mut uow, json!({"uuid": id.to_string(), "a": 2}), None, None)?;
        clock.advance(10);
        let back = log.append(&mut uow, json!({"uuid": id.to_string(), "a": 1}), None, None)?;
        uow.commit()?;

        assert_eq!(first.status, WriteStatus::Inserted);
        assert_eq!(repeat.status, WriteStatus::Unchanged);
        assert_eq!(repeat.version, first.version);
        assert_eq!(changed.status, WriteStatus::Inserted);
        assert_eq!(back.status, WriteStatus::Inserted);
        assert_eq!(log.count(&conn, id)?, 3);

        let history = log.history(&conn, id)?;
        assert_eq!(history.first().map(|row| row.version), Some(first.version));
        assert_eq!(log.get_latest(&conn, id)?.map(|row| row.version), Some(back.version));
        assert!(log.get_by_version(&conn, changed.version)?.is_some());
        Ok(())
    }

    #[test]
    fn missing_uuid_is_generated_and_written_into_doc() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::at(5));
        let (mut conn, log) = fixture(&clock)?;
        let mut uow = UnitOfWork::begin(&mut conn)?;
        let row = log.append(&mut uow, json!({"name": "foo"}), None, Some("2024-01-01T00:00:00Z"))?;
        uow.commit()?;

        let stored = log.get_latest(&conn, row.uuid)?.ok_or_else(|| anyhow::anyhow!("row missing"))?;
        assert_eq!(stored.doc["uuid"], json!(row.uuid.to_string()));
        assert_eq!(stored.sat.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(stored.period.map(|period| period.start), Some(5));
        Ok(())
    }

    #[test]
    fn as_of_respects_nbf_and_supersession() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::at(100));
        let (mut conn, log) = fixture(&clock)?;
        let id = Uuid::new_v4();
        let mut uow = UnitOfWork::begin(&mut conn)?;
        log.append(&mut uow, json!({"uuid": id.to_string(), "v": 1}), None, None)?;
        clock.set(200);
        log.append(&mut uow, json!({"uuid": id.to_string(), "v": 2}), Some(json!({"nbf": 300})), None)?;
        uow.commit()?;

        assert!(log.get_as_of(&conn, id, 50)?.is_none());
        let at_150 = log.get_as_of(&conn, id, 150)?.ok_or_else(|| anyhow::anyhow!("expected v1"))?;
        assert_eq!(at_150.doc["v"], json!(1));
        let at_250 = log.get_as_of(&conn, id, 250)?.ok_or_else(|| anyhow::anyhow!("expected v1"))?;
        assert_eq!(at_250.doc["v"], json!(1));
        let at_300 = log.get_as_of(&conn, id, 300)?.ok_or_else(|| anyhow::anyhow!("expected v2"))?;
        assert_eq!(at_300.doc["v"], json!(2));
        Ok(())
    }

    #[test]
    fn non_object_doc_is_rejected() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::at(1));
        let (mut conn, log) = fixture(&clock)?;
        let mut uow = UnitOfWork::begin(&mut conn)?;
        assert!(matches!(log.append(&mut uow, json!([1, 2]), None, None), Err(LedgerError::Validation(_))));
        Ok(())
    }
}
