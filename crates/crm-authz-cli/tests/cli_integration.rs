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
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_crm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_crm"))
        .args(args)
        .env_remove("CRM_PRINCIPAL")
        .env_remove("CRM_DB")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute crm binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_crm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "crm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run a command that must fail and return its stderr.
fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_crm(args);
    assert!(
        !output.status.success(),
        "crm command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
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

struct Cast {
    manager: String,
    seller: String,
    other_seller: String,
    support: String,
}

fn add_principal(db: &str, username: &str, role: &str) -> String {
    let account =
        run_json(["--db", db, "principal", "add", "--username", username, "--role", role]);
    assert_eq!(as_str(&account, "role"), role);
    as_str(&account, "id").to_string()
}

fn cast(db: &str) -> Cast {
    Cast {
        manager: add_principal(db, "max", "management"),
        seller: add_principal(db, "sam", "sales"),
        other_seller: add_principal(db, "tess", "sales"),
        support: add_principal(db, "sue", "support"),
    }
}

fn customer_json(is_customer: bool) -> String {
    serde_json::json!({
        "first_name": "Kevin",
        "last_name": "Casey",
        "email": "kevin@startup.example",
        "company_name": "Cool Startup LLC",
        "is_customer": is_customer
    })
    .to_string()
}

fn contract_json(customer_id: &str, is_signed: bool) -> String {
    serde_json::json!({
        "customer_id": customer_id,
        "amount_cents": 1_250_000,
        "payment_due_date": "2027-03-01T00:00:00Z",
        "is_signed": is_signed
    })
    .to_string()
}

fn event_json(contract_id: &str, is_finished: bool) -> String {
    serde_json::json!({
        "contract_id": contract_id,
        "event_name": "Spring Gala",
        "event_date": "2027-04-18T18:00:00Z",
        "attendees": 200,
        "is_finished": is_finished
    })
    .to_string()
}

// Test IDs: TCLI-001
#[test]
fn db_commands_report_schema_and_integrity() {
    let dir = unique_temp_dir("crm-cli-db");
    let db = dir.join("crm.sqlite3");
    let db = path_str(&db);

    let dry_run = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(as_str(&dry_run, "contract_version"), "crm-cli.v1");

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(migrated.get("up_to_date").and_then(Value::as_bool), Some(true));

    let version = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(version.get("current_version").and_then(Value::as_i64), Some(1));

    let report = run_json(["--db", db, "db", "integrity-check"]);
    assert_eq!(report.get("quick_check_ok").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn entity_commands_require_a_known_principal() {
    let dir = unique_temp_dir("crm-cli-auth");
    let db = dir.join("crm.sqlite3");
    let db = path_str(&db);
    run_json(["--db", db, "db", "migrate"]);

    let stderr = run_failure(["--db", db, "customer", "list"]);
    assert!(stderr.contains("unauthenticated"), "stderr: {stderr}");

    let stderr = run_failure(["--db", db, "customer", "list", "--as", "not-a-ulid"]);
    assert!(stderr.contains("unauthenticated"), "stderr: {stderr}");

    let stderr =
        run_failure(["--db", db, "customer", "list", "--as", "01ARZ3NDEKTSV4RRFFQ69G5FAV"]);
    assert!(stderr.contains("unauthenticated"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn sales_workflow_respects_ownership_and_locks() {
    let dir = unique_temp_dir("crm-cli-flow");
    let db = dir.join("crm.sqlite3");
    let db = path_str(&db);
    let cast = cast(db);

    let customer = run_json([
        "--db",
        db,
        "customer",
        "create",
        "--as",
        cast.seller.as_str(),
        "--json",
        customer_json(true).as_str(),
    ]);
    let customer_id = as_str(&customer, "id").to_string();
    assert_eq!(as_str(&customer, "sales_contact"), cast.seller);

    let stderr = run_failure([
        "--db",
        db,
        "customer",
        "create",
        "--as",
        cast.support.as_str(),
        "--json",
        customer_json(true).as_str(),
    ]);
    assert!(stderr.contains("forbidden"), "stderr: {stderr}");

    let stderr = run_failure([
        "--db",
        db,
        "customer",
        "show",
        "--as",
        cast.other_seller.as_str(),
        "--id",
        customer_id.as_str(),
    ]);
    assert!(stderr.contains("not_found"), "stderr: {stderr}");

    let contract = run_json([
        "--db",
        db,
        "contract",
        "create",
        "--as",
        cast.seller.as_str(),
        "--json",
        contract_json(&customer_id, true).as_str(),
    ]);
    let contract_id = as_str(&contract, "id").to_string();

    let stderr = run_failure([
        "--db",
        db,
        "contract",
        "update",
        "--as",
        cast.seller.as_str(),
        "--id",
        contract_id.as_str(),
        "--json",
        contract_json(&customer_id, true).as_str(),
    ]);
    assert!(stderr.contains("contract_locked"), "stderr: {stderr}");

    let assigned = run_json([
        "--db",
        db,
        "assign",
        "support",
        "--as",
        cast.manager.as_str(),
        "--contract",
        contract_id.as_str(),
        "--to",
        cast.support.as_str(),
    ]);
    assert_eq!(as_str(&assigned, "support_contact"), cast.support);

    let event = run_json([
        "--db",
        db,
        "event",
        "create",
        "--as",
        cast.support.as_str(),
        "--json",
        event_json(&contract_id, false).as_str(),
    ]);
    let event_id = as_str(&event, "id").to_string();

    let listed = run_json(["--db", db, "event", "list", "--as", cast.support.as_str()]);
    let events = listed
        .get("events")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing events array: {listed}"));
    assert_eq!(events.len(), 1);

    let listed = run_json(["--db", db, "event", "list", "--as", cast.other_seller.as_str()]);
    assert_eq!(listed.get("events").and_then(Value::as_array).map(Vec::len), Some(0));

    let stderr = run_failure([
        "--db",
        db,
        "event",
        "create",
        "--as",
        cast.manager.as_str(),
        "--json",
        event_json(&contract_id, false).as_str(),
    ]);
    assert!(stderr.contains("duplicate_event"), "stderr: {stderr}");

    let deleted = run_json([
        "--db",
        db,
        "event",
        "delete",
        "--as",
        cast.manager.as_str(),
        "--id",
        event_id.as_str(),
    ]);
    assert_eq!(as_str(&deleted, "kind"), "event");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn prospects_block_contracts_and_can_be_deleted_by_management() {
    let dir = unique_temp_dir("crm-cli-prospect");
    let db = dir.join("crm.sqlite3");
    let db = path_str(&db);
    let cast = cast(db);

    let prospect = run_json([
        "--db",
        db,
        "customer",
        "create",
        "--as",
        cast.seller.as_str(),
        "--json",
        customer_json(false).as_str(),
    ]);
    let prospect_id = as_str(&prospect, "id").to_string();
    assert!(prospect.get("sales_contact").is_some_and(Value::is_null));

    let stderr = run_failure([
        "--db",
        db,
        "contract",
        "create",
        "--as",
        cast.manager.as_str(),
        "--json",
        contract_json(&prospect_id, false).as_str(),
    ]);
    assert!(stderr.contains("customer_not_converted"), "stderr: {stderr}");

    let deleted = run_json([
        "--db",
        db,
        "customer",
        "delete",
        "--as",
        cast.manager.as_str(),
        "--id",
        prospect_id.as_str(),
    ]);
    assert_eq!(as_str(&deleted, "id"), prospect_id);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-005
#[test]
fn export_and_backup_write_snapshot_files() {
    let dir = unique_temp_dir("crm-cli-export");
    let db = dir.join("crm.sqlite3");
    let db = path_str(&db);
    let _cast = cast(db);

    let export_dir = dir.join("export");
    let exported = run_json(["--db", db, "db", "export", "--out", path_str(&export_dir)]);
    let files = exported
        .get("manifest")
        .and_then(|manifest| manifest.get("files"))
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing manifest files: {exported}"));
    assert_eq!(files.len(), 4);
    assert!(export_dir.join("manifest.json").exists());
    assert!(export_dir.join("principals.ndjson").exists());

    let backup = dir.join("backup.sqlite3");
    let backed_up = run_json(["--db", db, "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(as_str(&backed_up, "status"), "ok");
    assert!(backup.exists());

    let restored_db = dir.join("restored.sqlite3");
    let restored =
        run_json(["--db", path_str(&restored_db), "db", "restore", "--in", path_str(&backup)]);
    assert_eq!(restored.get("current_version").and_then(Value::as_i64), Some(1));

    let principals = run_json(["--db", path_str(&restored_db), "principal", "list"]);
    assert_eq!(principals.get("principals").and_then(Value::as_array).map(Vec::len), Some(4));

    let _ = fs::remove_dir_all(&dir);
}
