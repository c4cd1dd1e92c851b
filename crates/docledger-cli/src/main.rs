use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use docledger_core::{Envelope, EnvelopeShape, TableName};
use docledger_store_sqlite::{
    ChangeLog, Column, Field, Op, RawIngest, RawJournal, SnapshotStore, SoftDelete, SqliteLedger,
    TransformPipeline,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod pipeline_config;

use pipeline_config::{parse_json, FanOut, PipelineConfig};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dl")]
#[command(about = "Document ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./docledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
    Changelog {
        #[command(subcommand)]
        command: Box<ChangelogCommand>,
    },
    Raw {
        #[command(subcommand)]
        command: Box<RawCommand>,
    },
    /// Journal a raw payload and transform it per a YAML pipeline config.
    Ingest(IngestArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Tables,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long)]
    table: TableName,
    /// Paired change log; enables logged writes and as-of reads.
    #[arg(long)]
    log: Option<TableName>,
}

#[derive(Debug, Args)]
struct DocArgs {
    #[arg(long, value_parser = parse_json)]
    doc: Value,
    #[arg(long, value_parser = parse_json)]
    meta: Option<Value>,
    #[arg(long)]
    sat: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Put {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        doc: DocArgs,
    },
    Get {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        uuid: Uuid,
    },
    List(SnapshotListArgs),
    Patch(SnapshotPatchArgs),
    Delete(SnapshotDeleteArgs),
    AsOf {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        uuid: Uuid,
        /// Milliseconds since the Unix epoch.
        #[arg(long)]
        at: i64,
    },
}

#[derive(Debug, Args)]
struct SnapshotListArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// `path=value` equality on a doc member; value parsed as JSON when possible.
    #[arg(long = "where")]
    filters: Vec<String>,
    #[arg(long, default_value_t = false)]
    include_deleted: bool,
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Debug, Args)]
struct SnapshotPatchArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(long)]
    uuid: Uuid,
    #[arg(long, value_parser = parse_json, conflicts_with = "meta_patch", required_unless_present = "meta_patch")]
    doc_patch: Option<Value>,
    #[arg(long, value_parser = parse_json)]
    meta_patch: Option<Value>,
    #[arg(long)]
    sat: Option<String>,
}

#[derive(Debug, Args)]
struct SnapshotDeleteArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(long)]
    uuid: Uuid,
    /// Leave the doc without the deletion marker.
    #[arg(long, default_value_t = false)]
    no_tombstone: bool,
    /// Meta keys added only where absent.
    #[arg(long, value_parser = parse_json)]
    meta: Option<Value>,
    #[arg(long)]
    sat: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ChangelogCommand {
    Append {
        #[arg(long)]
        table: TableName,
        #[command(flatten)]
        doc: DocArgs,
    },
    History {
        #[arg(long)]
        table: TableName,
        #[arg(long)]
        uuid: Uuid,
    },
}

#[derive(Debug, Subcommand)]
enum RawCommand {
    Append {
        #[arg(long)]
        table: TableName,
        #[arg(long)]
        ext_id: String,
        #[command(flatten)]
        doc: DocArgs,
    },
    List {
        #[arg(long)]
        table: TableName,
        #[arg(long)]
        ext_id: String,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    ext_id: String,
    #[command(flatten)]
    doc: DocArgs,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn envelope_json(envelope: Option<&Envelope>, shape: EnvelopeShape) -> Value {
    json!({
        "found": envelope.is_some(),
        "envelope": envelope.map(|envelope| envelope.to_value(shape)),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Logs go to stderr so stdout stays one JSON document.
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut ledger = SqliteLedger::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut ledger),
        Command::Snapshot { command } => run_snapshot(*command, &mut ledger),
        Command::Changelog { command } => run_changelog(*command, &mut ledger),
        Command::Raw { command } => run_raw(*command, &mut ledger),
        Command::Ingest(args) => run_ingest(args, &mut ledger),
    }
}

fn run_db(command: DbCommand, ledger: &mut SqliteLedger) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = ledger.schema_status()?;
            emit_json(json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, ledger),
        DbCommand::IntegrityCheck => {
            let report = ledger.integrity_check()?;
            let mut value = serde_json::to_value(&report)?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), Value::Bool(report.is_clean()));
            }
            emit_json(value)
        }
        DbCommand::Tables => emit_json(json!({ "tables": ledger.list_tables()? })),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, ledger: &mut SqliteLedger) -> Result<()> {
    let before = ledger.schema_status()?;
    if args.dry_run {
        return emit_json(json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    ledger.migrate()?;
    let after = ledger.schema_status()?;
    emit_json(json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn snapshot_store(args: &StoreArgs) -> SnapshotStore {
    let store = SnapshotStore::new(args.table.clone());
    match &args.log {
        Some(log) => store.with_log(log.clone()),
        None => store,
    }
}

fn run_snapshot(command: SnapshotCommand, ledger: &mut SqliteLedger) -> Result<()> {
    match command {
        SnapshotCommand::Put { store, doc } => {
            let logged = store.log.is_some();
            let store = snapshot_store(&store);
            let mut uow = ledger.begin()?;
            store.ensure_schema(uow.conn())?;
            let row = if logged {
                store.put_and_log(&mut uow, doc.doc, doc.meta, doc.sat.as_deref())?
            } else {
                store.put(&mut uow, doc.doc, doc.meta, doc.sat.as_deref())?
            };
            uow.commit()?;
            emit_json(serde_json::to_value(&row)?)
        }
        SnapshotCommand::Get { store, uuid } => {
            let store = snapshot_store(&store);
            store.ensure_schema(ledger.conn())?;
            let envelope = store.get(ledger.conn(), uuid)?;
            emit_json(envelope_json(envelope.as_ref(), EnvelopeShape::Flat))
        }
        SnapshotCommand::List(args) => run_snapshot_list(&args, ledger),
        SnapshotCommand::Patch(args) => run_snapshot_patch(args, ledger),
        SnapshotCommand::Delete(args) => run_snapshot_delete(args, ledger),
        SnapshotCommand::AsOf { store, uuid, at } => {
            if store.log.is_none() {
                bail!("snapshot as-of requires --log");
            }
            let store = snapshot_store(&store);
            store.ensure_schema(ledger.conn())?;
            let envelope = store.get_as_of(ledger.conn(), uuid, at)?;
            emit_json(envelope_json(envelope.as_ref(), EnvelopeShape::Flat))
        }
    }
}

fn run_snapshot_list(args: &SnapshotListArgs, ledger: &mut SqliteLedger) -> Result<()> {
    let store = snapshot_store(&args.store);
    store.ensure_schema(ledger.conn())?;
    let mut query = store.query();
    if !args.include_deleted {
        query = query.is_null(Column::Dat);
    }
    for filter in &args.filters {
        let Some((path, raw)) = filter.split_once('=') else {
            bail!("--where expects path=value, got `{filter}`");
        };
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        query = query.filter(Field::doc(path), Op::Eq, &value);
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }
    let rows = store.get_all(ledger.conn(), &query)?;
    emit_json(json!({
        "count": rows.len(),
        "rows": rows.iter().map(|row| row.to_value(EnvelopeShape::Flat)).collect::<Vec<_>>(),
    }))
}

fn run_snapshot_patch(args: SnapshotPatchArgs, ledger: &mut SqliteLedger) -> Result<()> {
    let logged = args.store.log.is_some();
    let store = snapshot_store(&args.store);
    let mut uow = ledger.begin()?;
    store.ensure_schema(uow.conn())?;
    let sat = args.sat.as_deref();
    let (target, patched) = match (args.doc_patch, args.meta_patch) {
        (Some(patch), None) if logged => ("doc", store.patch_doc_and_log(&mut uow, args.uuid, &patch, sat)?),
        (Some(patch), None) => ("doc", store.patch_doc(&mut uow, args.uuid, &patch, sat)?),
        (None, Some(patch)) if logged => ("meta", store.patch_meta_and_log(&mut uow, args.uuid, &patch, sat)?),
        (None, Some(patch)) => ("meta", store.patch_meta(&mut uow, args.uuid, &patch, sat)?),
        _ => bail!("exactly one of --doc-patch or --meta-patch is required"),
    };
    uow.commit()?;
    emit_json(json!({ "uuid": args.uuid, "target": target, "patched": patched }))
}

fn run_snapshot_delete(args: SnapshotDeleteArgs, ledger: &mut SqliteLedger) -> Result<()> {
    let logged = args.store.log.is_some();
    let store = snapshot_store(&args.store);
    let meta_extra = match args.meta {
        None => None,
        Some(Value::Object(object)) => Some(object),
        Some(_) => bail!("--meta must be a JSON object"),
    };
    let options = SoftDelete { sat: args.sat, meta_extra, tombstone: !args.no_tombstone };
    let mut uow = ledger.begin()?;
    store.ensure_schema(uow.conn())?;
    let row = if logged {
        store.soft_delete_and_log(&mut uow, args.uuid, &options)?
    } else {
        store.soft_delete(&mut uow, args.uuid, &options)?
    };
    uow.commit()?;
    emit_json(serde_json::to_value(&row)?)
}

fn run_changelog(command: ChangelogCommand, ledger: &mut SqliteLedger) -> Result<()> {
    match command {
        ChangelogCommand::Append { table, doc } => {
            let log = ChangeLog::new(table);
            let mut uow = ledger.begin()?;
            log.ensure_schema(uow.conn())?;
            let row = log.append(&mut uow, doc.doc, doc.meta, doc.sat.as_deref())?;
            uow.commit()?;
            emit_json(serde_json::to_value(&row)?)
        }
        ChangelogCommand::History { table, uuid } => {
            let log = ChangeLog::new(table);
            log.ensure_schema(ledger.conn())?;
            let versions = log.history(ledger.conn(), uuid)?;
            emit_json(json!({
                "uuid": uuid,
                "count": versions.len(),
                "versions": versions.iter().map(|row| row.to_value(EnvelopeShape::Flat)).collect::<Vec<_>>(),
            }))
        }
    }
}

fn run_raw(command: RawCommand, ledger: &mut SqliteLedger) -> Result<()> {
    match command {
        RawCommand::Append { table, ext_id, doc } => {
            let journal = RawJournal::new(table);
            let mut uow = ledger.begin()?;
            journal.ensure_schema(uow.conn())?;
            let row = journal.append(&mut uow, &doc.doc, &ext_id, doc.meta, doc.sat.as_deref())?;
            uow.commit()?;
            emit_json(serde_json::to_value(&row)?)
        }
        RawCommand::List { table, ext_id } => {
            let journal = RawJournal::new(table);
            journal.ensure_schema(ledger.conn())?;
            let rows = journal.by_ext_id(ledger.conn(), &ext_id)?;
            emit_json(json!({
                "ext_id": ext_id,
                "count": rows.len(),
                "rows": rows.iter().map(|row| row.to_value(EnvelopeShape::Nested)).collect::<Vec<_>>(),
            }))
        }
    }
}

fn run_ingest(args: IngestArgs, ledger: &mut SqliteLedger) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let options = config.options()?;
    tracing::debug!(config = %args.config.display(), interface = %config.interface, "loaded pipeline config");
    let pipeline = TransformPipeline::new(config.raw_table()?, config.link_table()?);
    let transformer = FanOut::new(config.transform.clone())?;

    let mut ingest = RawIngest::new(args.doc.doc, args.ext_id);
    ingest.meta = args.doc.meta;
    ingest.sat = args.doc.sat;

    let outcome = pipeline.transform_to_internal(ledger.conn_mut(), &ingest, &transformer, &options)?;
    let mut value = serde_json::to_value(&outcome)?;
    if let Value::Object(object) = &mut value {
        object.insert("skipped".to_string(), Value::Bool(outcome.is_skipped()));
    }
    emit_json(value)
}
