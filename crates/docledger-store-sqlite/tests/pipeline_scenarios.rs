use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use docledger_core::{
    provenance, Candidate, FnTransformer, LedgerError, ManualClock, TableName, TransformError, WriteStatus,
};
use docledger_store_sqlite::{
    ChangeLog, Collaborators, DuplicatePolicy, PipelineOptions, RawIngest, Routing, SnapshotStore, SqliteLedger,
    TransformPipeline,
};
use serde_json::{json, Value};
use ulid::Ulid;
use uuid::Uuid;

fn table(name: &str) -> Result<TableName> {
    Ok(TableName::new(name)?)
}

fn options(policy: DuplicatePolicy) -> Result<PipelineOptions> {
    Ok(PipelineOptions::builder("shop")
        .if_uuid("orders")
        .stream("orders")
        .log(Routing::Table(table("orders_log")?))
        .state(Routing::Table(table("orders")?))
        .on_duplicate(policy)
        .actor("ingest-test")
        .build()?)
}

fn pipeline() -> Result<TransformPipeline> {
    Ok(TransformPipeline::new(table("raw_orders")?, table("order_links")?))
}

fn state() -> Result<SnapshotStore> {
    Ok(SnapshotStore::new(table("orders")?).with_log(table("orders_log")?))
}

fn log() -> Result<ChangeLog> {
    Ok(ChangeLog::new(table("orders_log")?))
}

/// One internal order per raw payload, keyed by ext id.
fn order_transformer(
) -> FnTransformer<impl Fn(&Value, &Value, Option<&str>) -> Result<Vec<Candidate>, TransformError>> {
    FnTransformer::new("orders", "1", |raw: &Value, _: &Value, ext_id: Option<&str>| {
        let key = ext_id.ok_or_else(|| TransformError::from("missing ext id"))?;
        Ok(vec![Candidate::keyed(json!({"total": raw["total"].clone()}), "order", key)])
    })
}

/// One internal line per element of `lines`.
fn line_transformer(
) -> FnTransformer<impl Fn(&Value, &Value, Option<&str>) -> Result<Vec<Candidate>, TransformError>> {
    FnTransformer::new("order_lines", "1", |raw: &Value, _: &Value, _: Option<&str>| {
        let lines = raw["lines"].as_array().ok_or_else(|| TransformError::from("lines must be an array"))?;
        Ok(lines
            .iter()
            .map(|line| {
                let sku = line["sku"].as_str().unwrap_or_default().to_string();
                Candidate::keyed(line.clone(), "line", sku).with_stream("order_lines")
            })
            .collect())
    })
}

fn raw_row_count(ledger: &SqliteLedger, name: &str) -> Result<i64> {
    let exists: i64 = ledger.conn().query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Ok(0);
    }
    Ok(ledger.conn().query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| row.get(0))?)
}

#[test]
fn transformer_failure_rolls_back_every_write() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let healthy = FnTransformer::new("healthy", "1", |_: &Value, _: &Value, _: Option<&str>| {
        Ok(vec![Candidate::keyed(json!({"ok": true}), "order", "A")])
    });
    let pipeline = pipeline()?;
    let options = options(DuplicatePolicy::Skip)?;

    // First candidate is fine, the second has no identity.
    let broken = FnTransformer::new("broken", "1", |_: &Value, _: &Value, _: Option<&str>| {
        Ok(vec![
            Candidate::keyed(json!({"ok": true}), "order", "A"),
            Candidate::new(json!({"name": "orphan"})),
        ])
    });
    let err = pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"n": 1}), "E1"), &broken, &options);
    assert!(matches!(err, Err(LedgerError::ContractViolation(_))));
    for name in ["raw_orders", "order_links", "orders", "orders_log"] {
        assert_eq!(raw_row_count(&ledger, name)?, 0, "{name} should be empty");
    }

    let raising = FnTransformer::new("raising", "1", |_: &Value, _: &Value, _: Option<&str>| {
        Err::<Vec<Candidate>, TransformError>("upstream schema drift".into())
    });
    let err = pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"n": 1}), "E1"), &raising, &options);
    assert!(matches!(err, Err(LedgerError::Transform(_))));
    assert_eq!(raw_row_count(&ledger, "raw_orders")?, 0);

    let outcome =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"n": 1}), "E1"), &healthy, &options)?;
    assert_eq!(outcome.internal.len(), 1);
    assert_eq!(raw_row_count(&ledger, "raw_orders")?, 1);
    Ok(())
}

#[test]
fn unchanged_raw_payload_is_skipped() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let transformer = order_transformer();
    let options = options(DuplicatePolicy::Skip)?;
    let ingest = RawIngest::new(json!({"total": 10}), "E1");

    let first = pipeline.transform_to_internal(ledger.conn_mut(), &ingest, &transformer, &options)?;
    let second = pipeline.transform_to_internal(ledger.conn_mut(), &ingest, &transformer, &options)?;

    assert_eq!(first.raw_status, WriteStatus::Inserted);
    assert!(second.is_skipped());
    assert_eq!(second.raw_status, WriteStatus::Unchanged);
    assert!(second.internal.is_empty());
    let uuid = first.internal[0].uuid;
    assert_eq!(log()?.count(ledger.conn(), uuid)?, 1);
    Ok(())
}

#[test]
fn reprocess_policy_reruns_transform_but_downstream_dedups() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let transformer = order_transformer();
    let options = options(DuplicatePolicy::Reprocess)?;
    let ingest = RawIngest::new(json!({"total": 10}), "E1");

    let first = pipeline.transform_to_internal(ledger.conn_mut(), &ingest, &transformer, &options)?;
    let again = pipeline.transform_to_internal(ledger.conn_mut(), &ingest, &transformer, &options)?;

    assert_eq!(again.raw_status, WriteStatus::Unchanged);
    assert_eq!(again.raw.as_ref().map(|row| row.version), first.raw.as_ref().map(|row| row.version));
    assert_eq!(again.internal.len(), 1);
    let written = &again.internal[0];
    assert_eq!(written.log.as_ref().map(|row| row.status), Some(WriteStatus::Unchanged));
    assert_eq!(written.state.as_ref().map(|row| row.status), Some(WriteStatus::Unchanged));
    Ok(())
}

#[test]
fn fan_out_writes_distinct_documents_and_links() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let transformer = line_transformer();
    let options = options(DuplicatePolicy::Skip)?;
    let raw = json!({"lines": [{"sku": "a", "qty": 1}, {"sku": "b", "qty": 2}, {"sku": "c", "qty": 3}]});

    let outcome =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(raw, "E1"), &transformer, &options)?;

    assert_eq!(outcome.internal.len(), 3);
    let mut uuids = outcome.internal.iter().map(|write| write.uuid).collect::<Vec<_>>();
    uuids.sort();
    uuids.dedup();
    assert_eq!(uuids.len(), 3);
    assert!(outcome.internal.iter().all(|write| write.stream == "order_lines"));

    let raw_uuid = outcome.raw.map(|row| row.uuid).ok_or_else(|| anyhow!("raw row expected"))?;
    let links = pipeline.links().links_for_ext(ledger.conn(), raw_uuid)?;
    assert_eq!(links.len(), 3);
    for link in &links {
        assert_eq!(link.meta["stream"], json!("order_lines"));
        assert_eq!(pipeline.links().links_for_int(ledger.conn(), link.int_uuid)?.len(), 1);
    }
    Ok(())
}

#[test]
fn upstream_uuid_copied_into_items_does_not_merge_them() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let transformer = line_transformer();
    let options = options(DuplicatePolicy::Skip)?;
    let shared = Uuid::new_v4().to_string();
    let raw = json!({"lines": [{"uuid": shared, "sku": "1"}, {"uuid": shared, "sku": "2"}]});

    let outcome =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(raw, "E1"), &transformer, &options)?;
    let uuids = outcome.internal.iter().map(|write| write.uuid).collect::<Vec<_>>();
    assert_eq!(
        uuids,
        vec![
            docledger_core::identity::stable_id_sourced("orders", "line", "1"),
            docledger_core::identity::stable_id_sourced("orders", "line", "2"),
        ]
    );
    assert!(outcome
        .internal
        .iter()
        .all(|write| write.state.as_ref().map(|row| row.status) == Some(WriteStatus::Inserted)));

    let stored = state()?.get(ledger.conn(), uuids[0])?.ok_or_else(|| anyhow!("line 1 missing"))?;
    assert_eq!(stored.doc["uuid"], json!(uuids[0].to_string()));
    assert_eq!(stored.doc["sku"], json!("1"));

    let garbage = json!({"lines": [{"uuid": "upstream-123", "sku": "3"}]});
    let outcome =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(garbage, "E2"), &transformer, &options)?;
    assert_eq!(outcome.internal.len(), 1);
    Ok(())
}

#[test]
fn lineage_accumulates_across_raw_versions() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let transformer = order_transformer();
    let options = options(DuplicatePolicy::Skip)?;

    let first =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"total": 1}), "E1"), &transformer, &options)?;
    pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"total": 2}), "E1"), &transformer, &options)?;

    let uuid = first.internal[0].uuid;
    let stored = state()?.get(ledger.conn(), uuid)?.ok_or_else(|| anyhow!("state row expected"))?;
    let sources = provenance::sources_of(&stored.meta);
    assert_eq!(sources.len(), 2);
    assert!(sources.iter().all(|source| source.ext_id.as_deref() == Some("E1")));
    assert_eq!(stored.meta["actor"], json!("ingest-test"));
    assert_eq!(log()?.history(ledger.conn(), uuid)?.len(), 2);
    Ok(())
}

#[test]
fn as_of_reads_follow_the_pipeline_clock() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let clock = Arc::new(ManualClock::at(1_000));
    let deps = Collaborators::default().with_clock(clock.clone());
    let pipeline = pipeline()?.with_collaborators(deps.clone());
    let transformer = order_transformer();
    let options = options(DuplicatePolicy::Skip)?;

    let first =
        pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"total": 1}), "E1"), &transformer, &options)?;
    clock.set(2_000);
    pipeline.transform_to_internal(ledger.conn_mut(), &RawIngest::new(json!({"total": 2}), "E1"), &transformer, &options)?;

    let uuid = first.internal[0].uuid;
    let store = state()?.with_collaborators(deps);
    assert!(store.get_as_of(ledger.conn(), uuid, 999)?.is_none());
    let early = store.get_as_of(ledger.conn(), uuid, 1_500)?.ok_or_else(|| anyhow!("v1 expected"))?;
    assert_eq!(early.doc["total"], json!(1));
    let late = store.get_as_of(ledger.conn(), uuid, 2_000)?.ok_or_else(|| anyhow!("v2 expected"))?;
    assert_eq!(late.doc["total"], json!(2));
    Ok(())
}

#[test]
fn disabled_routes_write_nothing_but_links() -> Result<()> {
    let mut ledger = SqliteLedger::open_in_memory()?;
    let pipeline = pipeline()?;
    let options = PipelineOptions::builder("shop")
        .if_uuid("orders")
        .stream("orders")
        .log(Routing::Table(table("orders_log")?))
        .state(Routing::Disabled)
        .build()?;

    let outcome = pipeline.transform_to_internal(
        ledger.conn_mut(),
        &RawIngest::new(json!({"total": 3}), "E9"),
        &order_transformer(),
        &options,
    )?;
    assert!(outcome.internal[0].state.is_none());
    assert!(outcome.internal[0].log.is_some());
    assert_eq!(raw_row_count(&ledger, "orders")?, 0);
    Ok(())
}

#[test]
fn concurrent_identical_ingests_produce_one_raw_version() -> Result<()> {
    let db_path: PathBuf = std::env::temp_dir().join(format!("docledger-concurrency-{}.sqlite3", Ulid::new()));
    {
        let mut init = SqliteLedger::open(&db_path)?;
        init.migrate()?;
        pipeline()?.ensure_schema(init.conn(), &options(DuplicatePolicy::Skip)?)?;
    }

    let threads = 6;
    let mut handles = Vec::new();
    for _ in 0..threads {
        let path = db_path.clone();
        handles.push(thread::spawn(move || -> Result<Option<Uuid>> {
            let mut ledger = SqliteLedger::open(&path)?;
            let outcome = pipeline()?.transform_to_internal(
                ledger.conn_mut(),
                &RawIngest::new(json!({"total": 42}), "E-shared"),
                &order_transformer(),
                &options(DuplicatePolicy::Skip)?,
            )?;
            Ok(outcome.raw.filter(|row| row.status == WriteStatus::Inserted).map(|row| row.uuid))
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        let Ok(result) = handle.join() else {
            return Err(anyhow!("ingest thread panicked"));
        };
        if result?.is_some() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);

    let ledger = SqliteLedger::open(&db_path)?;
    assert_eq!(raw_row_count(&ledger, "raw_orders")?, 1);
    assert_eq!(raw_row_count(&ledger, "orders_log")?, 1);
    assert!(ledger.integrity_check()?.is_clean());
    drop(ledger);

    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
