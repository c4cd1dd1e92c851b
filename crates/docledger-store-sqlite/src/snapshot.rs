//! Current-state store: one mutable row per uuid, optionally paired with a
//! [`ChangeLog`] that records every effective change.

use docledger_core::{
    doc_uuid, identity, is_empty_patch, merge_absent, merged, require_object, with_uuid, Envelope, LedgerError,
    TableName, VersionRow, WriteStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::changelog::{ChangeLog, LogEntry};
use crate::codec::{doc_text, meta_object, meta_text};
use crate::collaborators::{Collaborators, StoreConfig};
use crate::error::SqlContext;
use crate::query::Query;
use crate::schema::{ensure_table, TableKind};
use crate::unit_of_work::UnitOfWork;

/// Options for [`SnapshotStore::soft_delete`]. The default tombstones the doc.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftDelete {
    pub sat: Option<String>,
    /// Keys added to meta only where absent.
    pub meta_extra: Option<Map<String, Value>>,
    /// Also set the tombstone marker inside the doc.
    pub tombstone: bool,
}

impl Default for SoftDelete {
    fn default() -> Self {
        Self { sat: None, meta_extra: None, tombstone: true }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    table: TableName,
    log: Option<ChangeLog>,
    deps: Collaborators,
    config: StoreConfig,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(table: TableName) -> Self {
        Self { table, log: None, deps: Collaborators::default(), config: StoreConfig::default() }
    }

    /// Pair with a change log. Required by the `*_and_log` operations and [`Self::get_as_of`].
    #[must_use]
    pub fn with_log(mut self, log_table: TableName) -> Self {
        self.log = Some(
            ChangeLog::new(log_table).with_collaborators(self.deps.clone()).with_config(self.config.clone()),
        );
        self
    }

    #[must_use]
    pub fn with_collaborators(mut self, deps: Collaborators) -> Self {
        self.log = self.log.map(|log| log.with_collaborators(deps.clone()));
        self.deps = deps;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.log = self.log.map(|log| log.with_config(config.clone()));
        self.config = config;
        self
    }

    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    #[must_use]
    pub fn log(&self) -> Option<&ChangeLog> {
        self.log.as_ref()
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a table name is taken by another kind.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), LedgerError> {
        ensure_table(conn, &self.table, TableKind::Snapshot)?;
        if let Some(log) = &self.log {
            log.ensure_schema(conn)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.table.clone(), TableKind::Snapshot)
    }

    fn require_log(&self, operation: &str) -> Result<&ChangeLog, LedgerError> {
        self.log.as_ref().ok_or_else(|| {
            LedgerError::configuration(format!("{operation} on {} requires a change log table", self.table))
        })
    }

    /// Insert, or replace when `(doc, meta, sat)` differs from the stored row.
    ///
    /// Unchanged input leaves version, `uat`, and nonce untouched. A put on a
    /// soft-deleted row always writes and clears `dat`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for non-object docs or meta, plus
    /// lock and storage errors.
    pub fn put(
        &self,
        uow: &mut UnitOfWork<'_>,
        doc: Value,
        meta: Option<Value>,
        sat: Option<&str>,
    ) -> Result<VersionRow, LedgerError> {
        let (row, _) = self.put_inner(uow, doc, meta_object(meta)?, sat.map(str::to_string))?;
        Ok(row)
    }

    /// [`Self::put`] plus a change-log append in the same unit. The log dedups
    /// against its own latest row, independently of the snapshot outcome.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] without a log, otherwise as [`Self::put`].
    pub fn put_and_log(
        &self,
        uow: &mut UnitOfWork<'_>,
        doc: Value,
        meta: Option<Value>,
        sat: Option<&str>,
    ) -> Result<VersionRow, LedgerError> {
        let log = self.require_log("put_and_log")?;
        let sat = sat.map(str::to_string);
        let meta = meta_object(meta)?;
        let (row, doc) = self.put_inner(uow, doc, meta.clone(), sat.clone())?;
        log.append_entry(uow, LogEntry { doc, meta, sat, dat: None })?;
        Ok(row)
    }

    fn put_inner(
        &self,
        uow: &mut UnitOfWork<'_>,
        doc: Value,
        meta: Value,
        sat: Option<String>,
    ) -> Result<(VersionRow, Value), LedgerError> {
        require_object(&doc)?;
        let uuid = doc_uuid(&doc)?.unwrap_or_else(Uuid::new_v4);
        let doc = with_uuid(doc, uuid)?;
        let nonce = self.deps.hasher.nonce_for(&doc, self.config.nonce_policy);

        uow.lock(identity::lock_key(uuid))?;
        let existed = self.exists(uow.conn(), uuid)?;
        let now = self.deps.now_ms();
        let version = self.deps.next_version(now)?;
        let t = self.table.quoted();
        let written = uow
            .query_row(
                &format!(
                    "INSERT INTO {t} (uuid, version, doc, meta, iat, uat, dat, sat, nonce)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL, ?6, ?7)
                     ON CONFLICT(uuid) DO UPDATE SET
                       version = excluded.version,
                       doc = excluded.doc,
                       meta = excluded.meta,
                       uat = excluded.uat,
                       dat = NULL,
                       sat = excluded.sat,
                       nonce = excluded.nonce
                     WHERE {t}.nonce IS NOT excluded.nonce
                        OR {t}.meta IS NOT excluded.meta
                        OR {t}.sat IS NOT excluded.sat
                        OR {t}.dat IS NOT NULL
                     RETURNING iat"
                ),
                params![
                    uuid.to_string(),
                    version.to_string(),
                    doc_text(&doc)?,
                    meta_text(&meta),
                    now,
                    sat,
                    nonce.as_bytes().as_slice(),
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .db(&format!("failed to upsert into {}", self.table))?;

        let row = match written {
            Some(iat) => {
                let status = if existed { WriteStatus::Updated } else { WriteStatus::Inserted };
                VersionRow { uuid, version, iat, nonce, status }
            }
            None => self
                .get(uow.conn(), uuid)?
                .ok_or_else(|| LedgerError::not_found(self.table.as_str(), uuid))?
                .version_row(WriteStatus::Unchanged),
        };
        tracing::debug!(table = %self.table, %uuid, version = %row.version, status = row.status.as_str(), "snapshot put");
        Ok((row, doc))
    }

    /// Apply an RFC 7396 merge patch to the doc of a live row. Returns the patched doc.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty patch (before any I/O)
    /// and [`LedgerError::NotFound`] when no live row exists.
    pub fn patch_doc(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        patch: &Value,
        sat: Option<&str>,
    ) -> Result<Value, LedgerError> {
        self.patch(uow, uuid, patch, sat, Target::Doc, false)
    }

    /// # Errors
    /// As [`Self::patch_doc`], plus [`LedgerError::Configuration`] without a log.
    pub fn patch_doc_and_log(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        patch: &Value,
        sat: Option<&str>,
    ) -> Result<Value, LedgerError> {
        self.require_log("patch_doc_and_log")?;
        self.patch(uow, uuid, patch, sat, Target::Doc, true)
    }

    /// Apply an RFC 7396 merge patch to the meta of a live row. Returns the patched meta.
    ///
    /// # Errors
    /// As [`Self::patch_doc`].
    pub fn patch_meta(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        patch: &Value,
        sat: Option<&str>,
    ) -> Result<Value, LedgerError> {
        self.patch(uow, uuid, patch, sat, Target::Meta, false)
    }

    /// # Errors
    /// As [`Self::patch_meta`], plus [`LedgerError::Configuration`] without a log.
    pub fn patch_meta_and_log(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        patch: &Value,
        sat: Option<&str>,
    ) -> Result<Value, LedgerError> {
        self.require_log("patch_meta_and_log")?;
        self.patch(uow, uuid, patch, sat, Target::Meta, true)
    }

    fn patch(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        patch: &Value,
        sat: Option<&str>,
        target: Target,
        logged: bool,
    ) -> Result<Value, LedgerError> {
        if is_empty_patch(patch) {
            return Err(LedgerError::validation("merge patch MUST NOT be empty"));
        }
        uow.lock(identity::lock_key(uuid))?;
        let current = self
            .get(uow.conn(), uuid)?
            .filter(|current| !current.is_deleted())
            .ok_or_else(|| LedgerError::not_found(self.table.as_str(), uuid))?;

        let sat = sat.map(str::to_string).or(current.sat);
        let (doc, meta, patched) = match target {
            Target::Doc => {
                let doc = with_uuid(merged(&current.doc, patch), uuid)?;
                (doc.clone(), current.meta, doc)
            }
            Target::Meta => {
                let meta = meta_object(Some(merged(&current.meta, patch)))?;
                (current.doc, meta.clone(), meta)
            }
        };

        if logged {
            let log = self.require_log("patch_and_log")?;
            let (_, doc) = self.put_inner(uow, doc, meta.clone(), sat.clone())?;
            log.append_entry(uow, LogEntry { doc, meta, sat, dat: None })?;
        } else {
            self.put_inner(uow, doc, meta, sat)?;
        }
        Ok(patched)
    }

    /// Mark a row deleted without removing it.
    ///
    /// Existing meta keys win over `meta_extra`. Deleting an already deleted
    /// row returns its row with [`WriteStatus::Unchanged`].
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the uuid has no row.
    pub fn soft_delete(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        options: &SoftDelete,
    ) -> Result<VersionRow, LedgerError> {
        self.soft_delete_inner(uow, uuid, options).map(|(row, _)| row)
    }

    /// [`Self::soft_delete`] plus a deletion entry in the change log, which
    /// closes the validity period of the deleted state.
    ///
    /// # Errors
    /// As [`Self::soft_delete`], plus [`LedgerError::Configuration`] without a log.
    pub fn soft_delete_and_log(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        options: &SoftDelete,
    ) -> Result<VersionRow, LedgerError> {
        let log = self.require_log("soft_delete_and_log")?;
        let (row, deleted) = self.soft_delete_inner(uow, uuid, options)?;
        if let Some(deleted) = deleted {
            log.append_entry(
                uow,
                LogEntry { doc: deleted.doc, meta: deleted.meta, sat: deleted.sat, dat: deleted.dat },
            )?;
        }
        Ok(row)
    }

    fn soft_delete_inner(
        &self,
        uow: &mut UnitOfWork<'_>,
        uuid: Uuid,
        options: &SoftDelete,
    ) -> Result<(VersionRow, Option<Envelope>), LedgerError> {
        uow.lock(identity::lock_key(uuid))?;
        let current =
            self.get(uow.conn(), uuid)?.ok_or_else(|| LedgerError::not_found(self.table.as_str(), uuid))?;
        if current.is_deleted() {
            return Ok((current.version_row(WriteStatus::Unchanged), None));
        }

        let mut doc = current.doc.clone();
        if options.tombstone {
            if let Value::Object(object) = &mut doc {
                object.insert(self.config.tombstone_key.clone(), Value::Bool(true));
            }
        }
        let mut meta = match current.meta.clone() {
            Value::Object(object) => object,
            _ => Map::new(),
        };
        if let Some(extra) = &options.meta_extra {
            merge_absent(&mut meta, extra);
        }
        let meta = Value::Object(meta);
        let nonce = self.deps.hasher.nonce_for(&doc, self.config.nonce_policy);
        let now = self.deps.now_ms();
        let version = self.deps.next_version(now)?;
        let sat = options.sat.clone().or_else(|| current.sat.clone());

        uow.execute(
            &format!(
                "UPDATE {} SET version = ?1, doc = ?2, meta = ?3, uat = ?4, dat = ?4, sat = ?5, nonce = ?6
                 WHERE uuid = ?7 AND dat IS NULL",
                self.table.quoted()
            ),
            params![
                version.to_string(),
                doc_text(&doc)?,
                meta_text(&meta),
                now,
                sat,
                nonce.as_bytes().as_slice(),
                uuid.to_string(),
            ],
        )
        .db(&format!("failed to soft delete from {}", self.table))?;

        tracing::debug!(table = %self.table, %uuid, %version, "snapshot soft deleted");
        let deleted = Envelope { version, doc, meta, uat: Some(now), dat: Some(now), sat, nonce, ..current };
        Ok((deleted.version_row(WriteStatus::Updated), Some(deleted)))
    }

    /// Current row for `uuid`, deleted or not.
    ///
    /// # Errors
    /// Returns storage or decoding errors.
    pub fn get(&self, conn: &Connection, uuid: Uuid) -> Result<Option<Envelope>, LedgerError> {
        self.query().by_uuid(uuid).fetch_one(conn)
    }

    /// Rows matching `query`, which MUST target this store's table.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for a query over another table.
    pub fn get_all(&self, conn: &Connection, query: &Query) -> Result<Vec<Envelope>, LedgerError> {
        if query.table() != &self.table || query.kind() != TableKind::Snapshot {
            return Err(LedgerError::configuration(format!(
                "query over {} cannot be served by snapshot store {}",
                query.table(),
                self.table
            )));
        }
        query.fetch_all(conn)
    }

    /// State valid at `at_ms`, reconstructed from the change log.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] without a log.
    pub fn get_as_of(&self, conn: &Connection, uuid: Uuid, at_ms: i64) -> Result<Option<Envelope>, LedgerError> {
        self.require_log("get_as_of")?.get_as_of(conn, uuid, at_ms)
    }

    fn exists(&self, conn: &Connection, uuid: Uuid) -> Result<bool, LedgerError> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE uuid = ?1", self.table.quoted()),
                params![uuid.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .db(&format!("failed to probe {}", self.table))?;
        Ok(found.is_some())
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Doc,
    Meta,
}
