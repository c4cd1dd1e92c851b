//! Raw-to-internal ingestion: journal the upstream payload, run a
//! transformer, and write each candidate to its routed stores with
//! provenance, all inside one unit of work.

use std::sync::Arc;
use std::time::Duration;

use docledger_core::{
    identity, merge_patch, provenance, with_uuid, InterfaceInfo, LedgerError, ProvenanceStamp, SourceRef,
    TableName, Transformer, VersionRow, WriteStatus, DEFAULT_SCHEMA_VERSION,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::codec::meta_object;
use crate::collaborators::Collaborators;
use crate::linkage::LinkageStore;
use crate::lock::{InProcessKeyedLock, KeyedLock};
use crate::snapshot::SnapshotStore;
use crate::unit_of_work::UnitOfWork;
use crate::versioned_raw::{RawAppend, VersionedRawChangeLog};

/// Where a class of pipeline output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Table(TableName),
    Disabled,
}

impl Routing {
    #[must_use]
    pub fn table(&self) -> Option<&TableName> {
        match self {
            Self::Table(table) => Some(table),
            Self::Disabled => None,
        }
    }
}

/// What to do when the raw payload matches its latest stored version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Skip,
    Reprocess,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Namespace for `(kind, key)` candidate identities.
    pub if_uuid: String,
    pub stream: String,
    pub log: Routing,
    pub state: Routing,
    pub interface: InterfaceInfo,
    /// Source half of the raw identity; the interface name when unset.
    pub source_name: Option<String>,
    pub uuid_scope: Option<String>,
    pub on_duplicate: DuplicatePolicy,
    pub schema_version: String,
    pub actor: Option<String>,
    /// Overrides the version the transformer reports.
    pub transform_version: Option<String>,
    /// Extra meta merged into every linkage row.
    pub link_meta: Option<Value>,
    pub timeout: Option<Duration>,
}

impl PipelineOptions {
    #[must_use]
    pub fn builder(interface_name: impl Into<String>) -> PipelineOptionsBuilder {
        PipelineOptionsBuilder {
            interface: InterfaceInfo { name: interface_name.into(), ..InterfaceInfo::default() },
            ..PipelineOptionsBuilder::default()
        }
    }

    #[must_use]
    pub fn source_name(&self) -> &str {
        self.source_name.as_deref().unwrap_or(&self.interface.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptionsBuilder {
    interface: InterfaceInfo,
    if_uuid: Option<String>,
    stream: Option<String>,
    log: Option<Routing>,
    state: Option<Routing>,
    source_name: Option<String>,
    uuid_scope: Option<String>,
    on_duplicate: DuplicatePolicy,
    schema_version: Option<String>,
    actor: Option<String>,
    transform_version: Option<String>,
    link_meta: Option<Value>,
    timeout: Option<Duration>,
}

impl PipelineOptionsBuilder {
    #[must_use]
    pub fn if_uuid(mut self, if_uuid: impl Into<String>) -> Self {
        self.if_uuid = Some(if_uuid.into());
        self
    }

    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    #[must_use]
    pub fn log(mut self, log: Routing) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn state(mut self, state: Routing) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn interface_id(mut self, id: impl Into<String>) -> Self {
        self.interface.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn interface_instance(mut self, instance: impl Into<String>) -> Self {
        self.interface.instance = Some(instance.into());
        self
    }

    #[must_use]
    pub fn source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    #[must_use]
    pub fn uuid_scope(mut self, uuid_scope: impl Into<String>) -> Self {
        self.uuid_scope = Some(uuid_scope.into());
        self
    }

    #[must_use]
    pub fn on_duplicate(mut self, policy: DuplicatePolicy) -> Self {
        self.on_duplicate = policy;
        self
    }

    #[must_use]
    pub fn schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = Some(schema_version.into());
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn transform_version(mut self, version: impl Into<String>) -> Self {
        self.transform_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn link_meta(mut self, meta: Value) -> Self {
        self.link_meta = Some(meta);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `if_uuid`, `stream`, `log`,
    /// or `state` is missing, when a required string is empty, or when log
    /// and state route to the same table.
    pub fn build(self) -> Result<PipelineOptions, LedgerError> {
        let if_uuid = required("if_uuid", self.if_uuid)?;
        let stream = required("stream", self.stream)?;
        if self.interface.name.is_empty() {
            return Err(LedgerError::configuration("pipeline option interface name MUST NOT be empty"));
        }
        let log = self.log.ok_or_else(|| LedgerError::configuration("pipeline option log is required"))?;
        let state = self.state.ok_or_else(|| LedgerError::configuration("pipeline option state is required"))?;
        if let (Some(log_table), Some(state_table)) = (log.table(), state.table()) {
            if log_table == state_table {
                return Err(LedgerError::configuration(format!(
                    "log and state cannot share table {log_table}"
                )));
            }
        }
        if let Some(meta) = &self.link_meta {
            if !meta.is_object() {
                return Err(LedgerError::configuration("link_meta MUST be a JSON object"));
            }
        }
        Ok(PipelineOptions {
            if_uuid,
            stream,
            log,
            state,
            interface: self.interface,
            source_name: self.source_name,
            uuid_scope: self.uuid_scope,
            on_duplicate: self.on_duplicate,
            schema_version: self.schema_version.unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_string()),
            actor: self.actor,
            transform_version: self.transform_version,
            link_meta: self.link_meta,
            timeout: self.timeout,
        })
    }
}

fn required(name: &str, value: Option<String>) -> Result<String, LedgerError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(LedgerError::configuration(format!("pipeline option {name} is required"))),
    }
}

/// One upstream payload handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RawIngest {
    pub doc: Value,
    pub ext_id: String,
    pub meta: Option<Value>,
    pub sat: Option<String>,
}

impl RawIngest {
    #[must_use]
    pub fn new(doc: Value, ext_id: impl Into<String>) -> Self {
        Self { doc, ext_id: ext_id.into(), meta: None, sat: None }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn with_sat(mut self, sat: impl Into<String>) -> Self {
        self.sat = Some(sat.into());
        self
    }
}

/// What one candidate produced.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InternalWrite {
    pub uuid: Uuid,
    pub stream: String,
    pub log: Option<VersionRow>,
    pub state: Option<VersionRow>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransformOutcome {
    /// `None` when an unchanged raw payload was skipped.
    pub raw: Option<VersionRow>,
    pub raw_status: WriteStatus,
    pub internal: Vec<InternalWrite>,
}

impl TransformOutcome {
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.raw.is_none()
    }
}

#[derive(Clone)]
pub struct TransformPipeline {
    raw: VersionedRawChangeLog,
    links: LinkageStore,
    deps: Collaborators,
    locks: Arc<dyn KeyedLock>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("raw", self.raw.table())
            .field("links", self.links.table())
            .finish_non_exhaustive()
    }
}

impl TransformPipeline {
    #[must_use]
    pub fn new(raw_table: TableName, link_table: TableName) -> Self {
        Self {
            raw: VersionedRawChangeLog::new(raw_table),
            links: LinkageStore::new(link_table),
            deps: Collaborators::default(),
            locks: InProcessKeyedLock::global(),
        }
    }

    #[must_use]
    pub fn with_collaborators(mut self, deps: Collaborators) -> Self {
        self.raw = self.raw.with_collaborators(deps.clone());
        self.links = self.links.with_collaborators(deps.clone());
        self.deps = deps;
        self
    }

    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn KeyedLock>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn raw(&self) -> &VersionedRawChangeLog {
        &self.raw
    }

    #[must_use]
    pub fn links(&self) -> &LinkageStore {
        &self.links
    }

    /// Store handles for the tables `options` routes to.
    #[must_use]
    pub fn routed(&self, options: &PipelineOptions) -> (Option<ChangeLog>, Option<SnapshotStore>) {
        let log = options.log.table().map(|table| ChangeLog::new(table.clone()).with_collaborators(self.deps.clone()));
        let state = options
            .state
            .table()
            .map(|table| SnapshotStore::new(table.clone()).with_collaborators(self.deps.clone()));
        (log, state)
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a table is registered under another kind.
    pub fn ensure_schema(&self, conn: &Connection, options: &PipelineOptions) -> Result<(), LedgerError> {
        self.raw.ensure_schema(conn)?;
        self.links.ensure_schema(conn)?;
        let (log, state) = self.routed(options);
        if let Some(log) = log {
            log.ensure_schema(conn)?;
        }
        if let Some(state) = state {
            state.ensure_schema(conn)?;
        }
        Ok(())
    }

    /// Run one ingest in its own unit of work on `conn`.
    ///
    /// Any failure, including one raised by the transformer, rolls back every
    /// write of the ingest.
    ///
    /// # Errors
    /// Returns the first error raised by storage, the transformer
    /// ([`LedgerError::Transform`]), or candidate validation.
    pub fn transform_to_internal(
        &self,
        conn: &mut Connection,
        ingest: &RawIngest,
        transformer: &dyn Transformer,
        options: &PipelineOptions,
    ) -> Result<TransformOutcome, LedgerError> {
        let mut uow = UnitOfWork::begin_with(conn, Arc::clone(&self.locks), options.timeout)?;
        match self.run_in(&mut uow, ingest, transformer, options) {
            Ok(outcome) => {
                uow.commit()?;
                tracing::info!(
                    interface = %options.interface.name,
                    ext_id = %ingest.ext_id,
                    raw_status = outcome.raw_status.as_str(),
                    internal = outcome.internal.len(),
                    "ingest committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(
                    interface = %options.interface.name,
                    ext_id = %ingest.ext_id,
                    error = %err,
                    "ingest rolled back"
                );
                if let Err(rollback) = uow.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Run one ingest inside a caller-owned unit of work. The caller commits.
    ///
    /// # Errors
    /// See [`Self::transform_to_internal`].
    pub fn run_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        ingest: &RawIngest,
        transformer: &dyn Transformer,
        options: &PipelineOptions,
    ) -> Result<TransformOutcome, LedgerError> {
        self.ensure_schema(uow.conn(), options)?;
        let source_name = options.source_name();
        let mut append =
            RawAppend::new(ingest.doc.clone(), &ingest.ext_id, source_name).with_stream(&options.stream);
        append.meta = ingest.meta.clone();
        append.sat = ingest.sat.as_deref();
        append.uuid_scope = options.uuid_scope.as_deref();
        let source = identity::source_key(source_name, append.scope());
        let raw_row = self.raw.append_if_changed(uow, append)?;

        if raw_row.status == WriteStatus::Unchanged && options.on_duplicate == DuplicatePolicy::Skip {
            tracing::debug!(ext_id = %ingest.ext_id, uuid = %raw_row.uuid, "unchanged raw payload skipped");
            return Ok(TransformOutcome { raw: None, raw_status: WriteStatus::Unchanged, internal: Vec::new() });
        }

        let (log, state) = self.routed(options);
        let mut info = transformer.info();
        if let Some(version) = &options.transform_version {
            info.version.clone_from(version);
        }
        let stamp = ProvenanceStamp {
            schema_version: &options.schema_version,
            actor: options.actor.as_deref(),
            interface: &options.interface,
            transform: &info,
        };
        let raw_meta = meta_object(ingest.meta.clone())?;

        let mut internal = Vec::new();
        for item in transformer.transform(&ingest.doc, &raw_meta, Some(ingest.ext_id.as_str())) {
            let candidate = item.map_err(LedgerError::Transform)?;
            let uuid = candidate.resolve_uuid(&options.if_uuid)?;
            let doc = with_uuid(candidate.doc, uuid)?;
            let stream = candidate.stream.unwrap_or_else(|| options.stream.clone());
            let sat = candidate.sat.or_else(|| ingest.sat.clone());

            uow.lock(identity::lock_key(uuid))?;
            let prior = prior_sources(uow.conn(), uuid, log.as_ref(), state.as_ref())?;
            let current = SourceRef {
                stream: stream.clone(),
                ext_id: Some(ingest.ext_id.clone()),
                ext_uuid: raw_row.uuid,
                ext_version: raw_row.version,
                ext_iat: raw_row.iat,
            };
            let meta = provenance::bake(candidate.meta, &stamp, &prior, &current)?;

            let log_row = match &log {
                Some(log) => Some(log.append(uow, doc.clone(), Some(meta.clone()), sat.as_deref())?),
                None => None,
            };
            let state_row = match &state {
                Some(state) => Some(state.put(uow, doc, Some(meta), sat.as_deref())?),
                None => None,
            };

            let mut link_meta = options.link_meta.clone().unwrap_or_else(|| json!({}));
            merge_patch(
                &mut link_meta,
                &json!({
                    "stream": stream,
                    "ext_version": raw_row.version.to_string(),
                    "transform": {"name": info.name, "version": info.version},
                }),
            );
            self.links.upsert(uow, raw_row.uuid, uuid, Some(ingest.ext_id.as_str()), Some(source.as_str()), Some(link_meta))?;

            internal.push(InternalWrite { uuid, stream, log: log_row, state: state_row });
        }

        let raw_status = raw_row.status;
        Ok(TransformOutcome { raw: Some(raw_row), raw_status, internal })
    }
}

/// `src` lineage of the current internal state: the snapshot when state is
/// routed, otherwise the latest log version.
fn prior_sources(
    conn: &Connection,
    uuid: Uuid,
    log: Option<&ChangeLog>,
    state: Option<&SnapshotStore>,
) -> Result<Vec<SourceRef>, LedgerError> {
    let current = match (state, log) {
        (Some(state), _) => state.get(conn, uuid)?,
        (None, Some(log)) => log.get_latest(conn, uuid)?,
        (None, None) => None,
    };
    Ok(current.map(|envelope| provenance::sources_of(&envelope.meta)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use docledger_core::{Candidate, FnTransformer, TransformError};

    use super::*;

    fn table(name: &str) -> anyhow::Result<TableName> {
        Ok(TableName::new(name)?)
    }

    fn options() -> anyhow::Result<PipelineOptions> {
        Ok(PipelineOptions::builder("shop")
            .if_uuid("orders")
            .stream("orders")
            .log(Routing::Table(table("orders_log")?))
            .state(Routing::Table(table("orders")?))
            .build()?)
    }

    #[test]
    fn builder_requires_core_options() -> anyhow::Result<()> {
        let missing_state =
            PipelineOptions::builder("shop").if_uuid("orders").stream("s").log(Routing::Disabled).build();
        assert!(matches!(missing_state, Err(LedgerError::Configuration(_))));

        let empty_stream = PipelineOptions::builder("shop")
            .if_uuid("orders")
            .stream("")
            .log(Routing::Disabled)
            .state(Routing::Disabled)
            .build();
        assert!(matches!(empty_stream, Err(LedgerError::Configuration(_))));

        let shared = PipelineOptions::builder("shop")
            .if_uuid("orders")
            .stream("s")
            .log(Routing::Table(table("same")?))
            .state(Routing::Table(table("same")?))
            .build();
        assert!(matches!(shared, Err(LedgerError::Configuration(_))));

        let built = options()?;
        assert_eq!(built.source_name(), "shop");
        assert_eq!(built.schema_version, DEFAULT_SCHEMA_VERSION);
        assert_eq!(built.on_duplicate, DuplicatePolicy::Skip);
        Ok(())
    }

    #[test]
    fn single_candidate_is_routed_linked_and_stamped() -> anyhow::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let pipeline = TransformPipeline::new(table("raw_orders")?, table("order_links")?);
        let transformer = FnTransformer::new("orders", "3", |raw: &Value, _: &Value, ext_id: Option<&str>| {
            let key = ext_id.ok_or_else(|| TransformError::from("ext id required"))?;
            Ok(vec![Candidate::keyed(json!({"total": raw["total"].clone()}), "order", key)])
        });
        let options = options()?;

        let outcome = pipeline.transform_to_internal(
            &mut conn,
            &RawIngest::new(json!({"total": 10}), "E1").with_sat("2024-05-01T00:00:00Z"),
            &transformer,
            &options,
        )?;

        assert_eq!(outcome.raw_status, WriteStatus::Inserted);
        assert_eq!(outcome.internal.len(), 1);
        let written = &outcome.internal[0];
        assert_eq!(written.uuid, identity::stable_id_sourced("orders", "order", "E1"));
        assert_eq!(written.log.as_ref().map(|row| row.status), Some(WriteStatus::Inserted));

        let (_, state) = pipeline.routed(&options);
        let state = state.ok_or_else(|| anyhow::anyhow!("state routed"))?;
        let stored = state.get(&conn, written.uuid)?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(stored.doc["total"], json!(10));
        assert_eq!(stored.sat.as_deref(), Some("2024-05-01T00:00:00Z"));
        assert_eq!(stored.meta["transform"]["version"], json!("3"));
        assert_eq!(stored.meta["interface"]["name"], json!("shop"));
        assert_eq!(provenance::sources_of(&stored.meta).len(), 1);

        let raw_uuid = outcome.raw.map(|row| row.uuid).ok_or_else(|| anyhow::anyhow!("raw row"))?;
        let links = pipeline.links().links_for_ext(&conn, raw_uuid)?;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].int_uuid, written.uuid);
        assert_eq!(links[0].source, Some(identity::source_key("shop", Some("orders"))));
        Ok(())
    }
}
