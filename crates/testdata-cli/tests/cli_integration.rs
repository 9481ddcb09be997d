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

fn run_tdl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tdl"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tdl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tdl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "tdl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn db_args(sandbox: &Path) -> [String; 4] {
    [
        "--db".to_string(),
        path_str(&sandbox.join("data.sqlite3")).to_string(),
        "--payloads".to_string(),
        path_str(&sandbox.join("payloads")).to_string(),
    ]
}

#[test]
fn db_commands_cover_schema_version_and_migrate() {
    let sandbox = unique_temp_dir("tdl-cli-db");
    let base = db_args(&sandbox);

    let before = run_json(base.iter().map(String::as_str).chain(["db", "schema-version"]));
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_i64(&before, "target_version"), 1);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let dry_run = run_json(
        base.iter().map(String::as_str).chain(["db", "migrate", "--dry-run"]),
    );
    assert_eq!(dry_run.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 1);

    let applied = run_json(base.iter().map(String::as_str).chain(["db", "migrate"]));
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&applied, "after_version"), 1);

    let after = run_json(base.iter().map(String::as_str).chain(["db", "schema-version"]));
    assert_eq!(as_i64(&after, "current_version"), 1);
}

#[test]
fn repository_lifecycle_moves_forward_only() {
    let sandbox = unique_temp_dir("tdl-cli-repo");
    let base = db_args(&sandbox);

    let created = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "create",
        "--owner",
        "u1",
        "--name",
        "orders-db",
        "--source-uri",
        "postgres://localhost/orders",
    ]));
    assert_eq!(as_str(&created, "status"), "active");
    let repository_id = as_str(&created, "repository_id").to_string();

    let shown = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "show",
        "--id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_str(&shown, "name"), "orders-db");

    // Foreign requesters see absence, not denial.
    let foreign = run_tdl(base.iter().map(String::as_str).chain([
        "repo",
        "show",
        "--id",
        repository_id.as_str(),
        "--requester",
        "u2",
    ]));
    assert!(!foreign.status.success());

    let archived = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "archive",
        "--id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_str(&archived, "status"), "archived");

    let deleted = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "delete",
        "--id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_str(&deleted, "status"), "deleted");

    // A second delete is a backward transition and fails.
    let repeat = run_tdl(base.iter().map(String::as_str).chain([
        "repo",
        "delete",
        "--id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert!(!repeat.status.success());

    let listed = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "list",
        "--requester",
        "u1",
        "--status",
        "deleted",
    ]));
    assert_eq!(as_array(&listed, "repositories").len(), 1);
}

#[test]
fn snapshot_capture_and_restore_round_trip() {
    let sandbox = unique_temp_dir("tdl-cli-snapshot");
    let base = db_args(&sandbox);

    let created = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "create",
        "--owner",
        "u1",
        "--name",
        "orders-db",
        "--source-uri",
        "postgres://localhost/orders",
    ]));
    let repository_id = as_str(&created, "repository_id").to_string();

    for (key, amount) in [("1001", "40"), ("1002", "75")] {
        let payload = format!(r#"{{"order":"{key}","amount":{amount}}}"#);
        run_json(base.iter().map(String::as_str).chain([
            "record",
            "add",
            "--repository-id",
            repository_id.as_str(),
            "--requester",
            "u1",
            "--key",
            key,
            "--payload",
            payload.as_str(),
        ]));
    }

    let snapshot = run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "capture",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--label",
        "pre-test-run",
    ]));
    let snapshot_id = as_str(&snapshot, "snapshot_id").to_string();
    assert_eq!(as_str(&snapshot, "checksum"), as_str(&snapshot, "payload_ref"));

    run_json(base.iter().map(String::as_str).chain([
        "record",
        "add",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--key",
        "1003",
        "--payload",
        r#"{"order":"1003","amount":12}"#,
    ]));

    let restored = run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "restore",
        "--id",
        snapshot_id.as_str(),
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_i64(&restored, "restored_records"), 2);

    let records = run_json(base.iter().map(String::as_str).chain([
        "record",
        "list",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_array(&records, "records").len(), 2);

    let removed = run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "delete",
        "--id",
        snapshot_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(removed.get("deleted"), Some(&Value::Bool(true)));

    // Idempotent: the second delete reports absence instead of failing.
    let repeat = run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "delete",
        "--id",
        snapshot_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(repeat.get("deleted"), Some(&Value::Bool(false)));
}

#[test]
fn cleanup_rule_evaluation_is_idempotent() {
    let sandbox = unique_temp_dir("tdl-cli-rule");
    let base = db_args(&sandbox);

    let created = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "create",
        "--owner",
        "u1",
        "--name",
        "orders-db",
        "--source-uri",
        "postgres://localhost/orders",
    ]));
    let repository_id = as_str(&created, "repository_id").to_string();

    run_json(base.iter().map(String::as_str).chain([
        "record",
        "add",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--key",
        "1001",
        "--payload",
        r#"{"order":"1001"}"#,
    ]));

    run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "capture",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--label",
        "stale",
        "--captured-at",
        "2026-01-01T00:00:00Z",
    ]));
    run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "capture",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--label",
        "fresh",
        "--captured-at",
        "2026-05-25T00:00:00Z",
    ]));

    let rule = run_json(base.iter().map(String::as_str).chain([
        "rule",
        "add",
        "--scope",
        "repository",
        "--repository-id",
        repository_id.as_str(),
        "--predicate",
        "max-age",
        "--days",
        "30",
        "--action",
        "delete-snapshot",
    ]));
    let rule_id = as_str(&rule, "rule_id").to_string();

    let first = run_json(base.iter().map(String::as_str).chain([
        "rule",
        "evaluate",
        "--id",
        rule_id.as_str(),
        "--now",
        "2026-06-01T00:00:00Z",
    ]));
    assert_eq!(as_i64(&first, "applied"), 1);
    assert_eq!(as_array(&first, "results").len(), 2);

    let second = run_json(base.iter().map(String::as_str).chain([
        "rule",
        "evaluate",
        "--id",
        rule_id.as_str(),
        "--now",
        "2026-06-01T00:00:00Z",
    ]));
    assert_eq!(as_i64(&second, "applied"), 0);
    assert_eq!(as_array(&second, "results").len(), 1);

    let snapshots = run_json(base.iter().map(String::as_str).chain([
        "snapshot",
        "list",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    let remaining = as_array(&snapshots, "snapshots");
    assert_eq!(remaining.len(), 1);
    assert_eq!(as_str(&remaining[0], "label"), "fresh");
}

#[test]
fn templates_generate_and_preview_synthetic_data() {
    let sandbox = unique_temp_dir("tdl-cli-template");
    let base = db_args(&sandbox);

    let schema_path = sandbox.join("orders-schema.json");
    fs::write(
        &schema_path,
        r#"{
  "generators": {
    "seq": { "kind": "sequence", "start": 1000 },
    "amount": { "kind": "int_range", "min": 1, "max": 500 },
    "label": { "kind": "format", "pattern": "order-{order_id}" }
  },
  "fields": [
    { "name": "order_id", "generator": "seq" },
    { "name": "amount", "generator": "amount" },
    { "name": "label", "generator": "label" }
  ],
  "key_field": "order_id"
}"#,
    )
    .unwrap_or_else(|err| panic!("failed to write schema file: {err}"));

    let created = run_json(base.iter().map(String::as_str).chain([
        "repo",
        "create",
        "--owner",
        "u1",
        "--name",
        "orders-db",
        "--source-uri",
        "postgres://localhost/orders",
    ]));
    let repository_id = as_str(&created, "repository_id").to_string();

    let template = run_json(base.iter().map(String::as_str).chain([
        "template",
        "add",
        "--owner",
        "u1",
        "--name",
        "orders",
        "--schema-file",
        path_str(&schema_path),
        "--format",
        "csv",
    ]));
    let template_id = as_str(&template, "template_id").to_string();

    let preview = run_json(base.iter().map(String::as_str).chain([
        "template",
        "preview",
        "--id",
        template_id.as_str(),
        "--requester",
        "u1",
        "--count",
        "2",
        "--seed",
        "42",
    ]));
    let rendered = as_str(&preview, "rendered");
    let lines = rendered.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "order_id,amount,label");
    assert!(lines[1].starts_with("1000,"));

    let report = run_json(base.iter().map(String::as_str).chain([
        "generate",
        "--template-id",
        template_id.as_str(),
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--count",
        "10",
        "--seed",
        "42",
    ]));
    assert_eq!(as_i64(&report, "requested"), 10);
    assert_eq!(as_i64(&report, "written"), 10);
    assert_eq!(as_i64(&report, "failed"), 0);

    // Same seed, same keys: a rerun conflicts on every record.
    let rerun = run_json(base.iter().map(String::as_str).chain([
        "generate",
        "--template-id",
        template_id.as_str(),
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
        "--count",
        "10",
        "--seed",
        "42",
    ]));
    assert_eq!(as_i64(&rerun, "written"), 0);
    assert_eq!(as_i64(&rerun, "failed"), 10);

    let records = run_json(base.iter().map(String::as_str).chain([
        "record",
        "list",
        "--repository-id",
        repository_id.as_str(),
        "--requester",
        "u1",
    ]));
    assert_eq!(as_array(&records, "records").len(), 10);
}
