use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_dl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_dl"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute dl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_dl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "dl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn db_args<'a>(db: &'a Path, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["--db", path_str(db)];
    args.extend_from_slice(rest);
    args
}

#[test]
fn db_migrate_reports_contract_version_and_is_idempotent() {
    let dir = unique_temp_dir("dl-migrate");
    let db = dir.join("ledger.sqlite3");

    let dry = run_json(db_args(&db, &["db", "migrate", "--dry-run"]));
    assert_eq!(as_str(&dry, "contract_version"), "cli.v1");
    assert_eq!(dry["dry_run"], Value::Bool(true));

    let first = run_json(db_args(&db, &["db", "migrate"]));
    assert_eq!(first["up_to_date"], Value::Bool(true));
    let second = run_json(db_args(&db, &["db", "migrate"]));
    assert_eq!(second["applied_versions"], serde_json::json!([]));

    let status = run_json(db_args(&db, &["db", "schema-version"]));
    assert_eq!(status["current_version"], status["target_version"]);

    let integrity = run_json(db_args(&db, &["db", "integrity-check"]));
    assert_eq!(integrity["clean"], Value::Bool(true));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn snapshot_lifecycle_through_the_cli() {
    let dir = unique_temp_dir("dl-snapshot");
    let db = dir.join("ledger.sqlite3");
    let store = ["--table", "customers", "--log", "customers_log"];

    let mut put = vec!["snapshot", "put"];
    put.extend_from_slice(&store);
    put.extend_from_slice(&["--doc", r#"{"name":"Ada","tier":"gold"}"#, "--sat", "2024-01-01T00:00:00Z"]);
    let inserted = run_json(db_args(&db, &put));
    assert_eq!(as_str(&inserted, "status"), "inserted");
    let uuid = as_str(&inserted, "uuid").to_string();

    let doc = format!(r#"{{"uuid":"{uuid}","name":"Ada","tier":"gold"}}"#);
    let mut again = vec!["snapshot", "put"];
    again.extend_from_slice(&store);
    again.extend_from_slice(&["--doc", &doc, "--sat", "2024-01-01T00:00:00Z"]);
    let unchanged = run_json(db_args(&db, &again));
    assert_eq!(as_str(&unchanged, "status"), "unchanged");
    assert_eq!(unchanged["version"], inserted["version"]);

    let mut patch = vec!["snapshot", "patch"];
    patch.extend_from_slice(&store);
    patch.extend_from_slice(&["--uuid", &uuid, "--doc-patch", r#"{"tier":null,"city":"London"}"#]);
    let patched = run_json(db_args(&db, &patch));
    assert_eq!(patched["patched"]["city"], Value::from("London"));
    assert!(patched["patched"].get("tier").is_none());

    let mut get = vec!["snapshot", "get"];
    get.extend_from_slice(&store);
    get.extend_from_slice(&["--uuid", &uuid]);
    let fetched = run_json(db_args(&db, &get));
    assert_eq!(fetched["found"], Value::Bool(true));
    assert_eq!(fetched["envelope"]["name"], Value::from("Ada"));
    assert_eq!(fetched["envelope"]["sat"], Value::from("2024-01-01T00:00:00Z"));

    let mut list = vec!["snapshot", "list"];
    list.extend_from_slice(&store);
    list.extend_from_slice(&["--where", "city=London"]);
    let listed = run_json(db_args(&db, &list));
    assert_eq!(listed["count"], Value::from(1));

    let mut delete = vec!["snapshot", "delete"];
    delete.extend_from_slice(&store);
    delete.extend_from_slice(&["--uuid", &uuid, "--meta", r#"{"reason":"gdpr"}"#]);
    let deleted = run_json(db_args(&db, &delete));
    assert_eq!(as_str(&deleted, "status"), "updated");

    let tombstoned = run_json(db_args(&db, &get));
    assert_eq!(tombstoned["envelope"]["_deleted"], Value::Bool(true));
    assert_eq!(tombstoned["envelope"]["meta"]["reason"], Value::from("gdpr"));

    let live = run_json(db_args(&db, &list));
    assert_eq!(live["count"], Value::from(0));

    let history = run_json(db_args(&db, &["changelog", "history", "--table", "customers_log", "--uuid", &uuid]));
    assert_eq!(history["count"], Value::from(3));

    let mut patch_deleted = vec!["--db", path_str(&db), "snapshot", "patch"];
    patch_deleted.extend_from_slice(&store);
    patch_deleted.extend_from_slice(&["--uuid", &uuid, "--meta-patch", r#"{"a":1}"#]);
    let failed = run_dl(patch_deleted);
    assert!(!failed.status.success());
    assert!(String::from_utf8_lossy(&failed.stderr).contains("no current row"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn raw_append_keeps_every_delivery() {
    let dir = unique_temp_dir("dl-raw");
    let db = dir.join("ledger.sqlite3");
    let append = ["raw", "append", "--table", "raw_hooks", "--ext-id", "EVT-1", "--doc", r#"{"id":"EVT-1"}"#];

    let first = run_json(db_args(&db, &append));
    let second = run_json(db_args(&db, &append));
    assert_eq!(as_str(&first, "status"), "inserted");
    assert_eq!(as_str(&second, "status"), "inserted");
    assert_ne!(first["uuid"], second["uuid"]);

    let listed = run_json(db_args(&db, &["raw", "list", "--table", "raw_hooks", "--ext-id", "EVT-1"]));
    assert_eq!(listed["count"], Value::from(2));
    assert_eq!(listed["rows"][0]["_meta"]["ext_id"], Value::from("EVT-1"));

    let _ = fs::remove_dir_all(dir);
}

const ORDERS_PIPELINE: &str = r"
interface: shop
interface_id: shop-eu
if_uuid: orders
stream: orders
raw_table: raw_orders
link_table: order_links
log: order_lines_log
state: order_lines
actor: ingest-bot
transform:
  name: order-lines
  version: '1'
  kind: line
  items: lines
  key_field: sku
  fields: [sku, qty]
";

#[test]
fn ingest_fans_out_and_skips_identical_redelivery() {
    let dir = unique_temp_dir("dl-ingest");
    let db = dir.join("ledger.sqlite3");
    let config = dir.join("orders.yaml");
    fs::write(&config, ORDERS_PIPELINE)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", config.display()));

    let payload = r#"{"id":"O-1","lines":[{"sku":"A","qty":1},{"sku":"B","qty":2}]}"#;
    let ingest = ["ingest", "--config", path_str(&config), "--ext-id", "O-1", "--doc", payload];

    let first = run_json(db_args(&db, &ingest));
    assert_eq!(as_str(&first, "raw_status"), "inserted");
    assert_eq!(first["skipped"], Value::Bool(false));
    let internal = first["internal"]
        .as_array()
        .unwrap_or_else(|| panic!("internal should be an array: {first}"));
    assert_eq!(internal.len(), 2);
    assert_ne!(internal[0]["uuid"], internal[1]["uuid"]);

    let uuid = as_str(&internal[0], "uuid").to_string();
    let line = run_json(db_args(&db, &["snapshot", "get", "--table", "order_lines", "--uuid", &uuid]));
    assert_eq!(line["envelope"]["sku"], Value::from("A"));
    assert_eq!(line["envelope"]["meta"]["interface"]["name"], Value::from("shop"));
    assert_eq!(line["envelope"]["meta"]["actor"], Value::from("ingest-bot"));
    assert_eq!(line["envelope"]["meta"]["src"][0]["ext_id"], Value::from("O-1"));

    let second = run_json(db_args(&db, &ingest));
    assert_eq!(second["skipped"], Value::Bool(true));
    assert_eq!(as_str(&second, "raw_status"), "unchanged");

    let tables = run_json(db_args(&db, &["db", "tables"]));
    let names = tables["tables"]
        .as_array()
        .unwrap_or_else(|| panic!("tables should be an array: {tables}"))
        .iter()
        .filter_map(|entry| entry.get("table_name").and_then(Value::as_str))
        .collect::<Vec<_>>();
    for expected in ["raw_orders", "order_links", "order_lines_log", "order_lines"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn invalid_json_argument_is_rejected_before_touching_the_database() {
    let dir = unique_temp_dir("dl-badjson");
    let db = dir.join("ledger.sqlite3");
    let output = run_dl(db_args(&db, &["changelog", "append", "--table", "events", "--doc", "{not json"]));
    assert!(!output.status.success());
    assert!(!db.exists());
    let _ = fs::remove_dir_all(dir);
}
