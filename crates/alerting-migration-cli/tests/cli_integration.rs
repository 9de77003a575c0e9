use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use alerting_migration_core::{NotificationChannel, ResourcePermission, ACTION_DASHBOARDS_READ};
use alerting_migration_store_sqlite::{ResourceKind, SqliteStore};
use serde_json::{json, Value};

const SETTINGS: &str = r#"{
  "conditions": [{
    "evaluator": {"type": "lt", "params": [1]},
    "operator": {"type": "and"},
    "query": {"params": ["A", "10m", "now"], "datasourceUid": "loki", "model": {"refId": "A", "expr": "up"}},
    "reducer": {"type": "last"}
  }],
  "noDataState": "keep_state",
  "executionErrorState": "keep_state",
  "frequency": "1m",
  "for": "5m",
  "notifications": []
}"#;

fn run_ualert<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ualert"))
        .args(args)
        .env("UALERT_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ualert binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ualert(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ualert command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
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

/// One general-root dashboard readable by user 9, with one alert.
fn seed(db: &Path) {
    let mut store = SqliteStore::open(db).unwrap_or_else(|err| panic!("open store: {err}"));
    store.migrate().unwrap_or_else(|err| panic!("migrate store: {err}"));
    let dashboard = store
        .insert_dashboard(1, "edge", "Edge", None)
        .unwrap_or_else(|err| panic!("insert dashboard: {err}"));
    store
        .insert_permission(
            1,
            ResourceKind::Dashboards,
            "edge",
            &ResourcePermission {
                id: 0,
                role_name: "managed:users:9:permissions".to_string(),
                is_managed: true,
                is_inherited: false,
                user_id: Some(9),
                team_id: None,
                builtin_role: None,
                actions: vec![ACTION_DASHBOARDS_READ.to_string()],
            },
        )
        .unwrap_or_else(|err| panic!("insert permission: {err}"));
    store
        .insert_notification_channel(&NotificationChannel {
            id: 0,
            uid: "email-all".to_string(),
            org_id: 1,
            name: "Everyone".to_string(),
            kind: "email".to_string(),
            is_default: true,
            settings: json!({"addresses": "ops@example.com"}),
        })
        .unwrap_or_else(|err| panic!("insert channel: {err}"));
    store
        .insert_legacy_alert(1, dashboard.id, 4, "edge down", SETTINGS)
        .unwrap_or_else(|err| panic!("insert alert: {err}"));
}

#[test]
fn db_migrate_reports_applied_versions() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(before["contract_version"], "cli.v1");
    assert_eq!(before["up_to_date"], false);

    let dry = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry["would_apply_versions"], json!([1]));

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(migrated["applied_versions"], json!([1]));
    assert_eq!(migrated["up_to_date"], true);
}

#[test]
fn migration_run_is_idempotent_and_keeps_legacy_alerts() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");
    let data = dir.path().join("data");
    seed(&db);
    let base = ["--db", path_str(&db), "--data-path", path_str(&data)];

    let first = run_json(base.iter().copied().chain(["migration", "run"]));
    assert_eq!(as_str(&first, "outcome"), "migrated");
    assert_eq!(first["alerts"], 1);
    assert_eq!(first["rules"]["1"], 1);

    let rules = run_json(["--db", path_str(&db), "rules", "list"]);
    let rules = rules["rules"].as_array().cloned().unwrap_or_default();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["title"], "edge down");
    assert_eq!(rules[0]["for_seconds"], 300);

    // General-root dashboards land in "General Alerting" or a permission folder under it.
    let folders = run_json(["--db", path_str(&db), "folders", "list", "--org-id", "1"]);
    let titles = folders["folders"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|folder| folder["title"].as_str().map(str::to_string))
        .collect::<Vec<_>>();
    assert!(titles.iter().any(|title| title == "General Alerting"), "{titles:?}");
    assert!(titles.iter().any(|title| title.starts_with("General Alerting Alerts - ")), "{titles:?}");

    // keep_state alerts get a silence file.
    assert!(data.join("alerting").join("1").join("silences").is_file());

    let second = run_json(base.iter().copied().chain(["migration", "run"]));
    assert_eq!(as_str(&second, "outcome"), "noop");

    let status = run_json(["--db", path_str(&db), "migration", "status"]);
    assert_eq!(status["migrated"], true);
    assert_eq!(status["plan"], "noop");
}

#[test]
fn disabling_without_force_is_refused() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");
    let data = dir.path().join("data");
    seed(&db);
    run_json(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "run"]);

    let output = run_ualert([
        "--db",
        path_str(&db),
        "--data-path",
        path_str(&data),
        "--unified-alerting",
        "false",
        "migration",
        "run",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("force_migration=true"), "{stderr}");

    let status = run_json(["--db", path_str(&db), "--unified-alerting", "false", "migration", "status"]);
    assert_eq!(status["migrated"], true);
    assert_eq!(status["plan"], Value::Null);
    assert!(as_str(&status, "plan_error").contains("force_migration"));
}

#[test]
fn disabling_with_force_reverts_everything() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");
    let data = dir.path().join("data");
    seed(&db);
    run_json(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "run"]);

    let reverted = run_json([
        "--db",
        path_str(&db),
        "--data-path",
        path_str(&data),
        "--unified-alerting",
        "false",
        "--force-migration",
        "migration",
        "run",
    ]);
    assert_eq!(as_str(&reverted, "outcome"), "reverted");
    assert_eq!(reverted["removed_silence_files"], 1);

    let rules = run_json(["--db", path_str(&db), "rules", "list"]);
    assert_eq!(rules["rules"], json!([]));
    let folders = run_json(["--db", path_str(&db), "folders", "list"]);
    assert_eq!(folders["folders"], json!([]));
    assert!(!data.join("alerting").join("1").join("silences").exists());

    // Re-enabling migrates again from the untouched legacy alerts.
    let again =
        run_json(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "run"]);
    assert_eq!(as_str(&again, "outcome"), "migrated");
}

#[test]
fn legacy_disabled_leaves_migrated_data_alone() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");
    let data = dir.path().join("data");
    let config = dir.path().join("alerting.yaml");
    seed(&db);
    run_json(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "run"]);

    let yaml = format!(
        "unified_alerting:\n  enabled: false\nalerting:\n  enabled: false\ndata_path: {}\n",
        path_str(&data)
    );
    std::fs::write(&config, yaml).unwrap_or_else(|err| panic!("write config: {err}"));
    let outcome = run_json(["--db", path_str(&db), "--config", path_str(&config), "migration", "run"]);
    assert_eq!(as_str(&outcome, "outcome"), "noop");

    let rules = run_json(["--db", path_str(&db), "rules", "list"]);
    assert_eq!(rules["rules"].as_array().map(Vec::len), Some(1));
}

#[test]
fn revert_command_needs_force_but_not_a_disabled_config() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let db = dir.path().join("grafana.sqlite3");
    let data = dir.path().join("data");
    seed(&db);
    run_json(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "run"]);

    let refused =
        run_ualert(["--db", path_str(&db), "--data-path", path_str(&data), "migration", "revert"]);
    assert!(!refused.status.success());
    let stderr = String::from_utf8_lossy(&refused.stderr);
    assert!(stderr.contains("force_migration=true"), "{stderr}");
    let rules = run_json(["--db", path_str(&db), "rules", "list"]);
    assert_eq!(rules["rules"].as_array().map(Vec::len), Some(1));

    let reverted = run_json([
        "--db",
        path_str(&db),
        "--data-path",
        path_str(&data),
        "--force-migration",
        "migration",
        "revert",
    ]);
    assert_eq!(as_str(&reverted, "outcome"), "reverted");
    assert_eq!(reverted["deleted_folders"]["1"].as_array().map(Vec::len), Some(2));

    let status = run_json(["--db", path_str(&db), "migration", "status"]);
    assert_eq!(status["migrated"], false);
    assert_eq!(status["plan"], "migrate");
}
