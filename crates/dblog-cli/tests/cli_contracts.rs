#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn dblog_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_dblog") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/dblog");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "dblog-cli", "--bin", "dblog"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build dblog binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(label: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!("dblog-cli-{label}-{}.sqlite3", Ulid::new())),
        }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(self.path.with_extension("sqlite3-wal"));
        let _ = std::fs::remove_file(self.path.with_extension("sqlite3-shm"));
    }
}

fn dblog_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(dblog_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run dblog command {:?}: {err}", args),
    }
}

fn dblog_success(db_path: &Path, args: &[&str]) -> Output {
    let output = dblog_output(db_path, args);
    assert!(
        output.status.success(),
        "dblog {:?} failed\nstdout={}\nstderr={}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn write_log(db_path: &Path, log_type: &str, message: &str) -> Value {
    stdout_json(&dblog_success(
        db_path,
        &["write", "--type", log_type, "--message", message],
    ))
}

fn row_count(db_path: &Path, table: &str) -> i64 {
    let conn = match Connection::open(db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    match conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get::<_, i64>(0)
    }) {
        Ok(value) => value,
        Err(err) => panic!("failed to count rows: {err}"),
    }
}

#[test]
fn help_lists_every_command() {
    let output = match Command::new(dblog_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["write", "search", "types", "dedup", "gc", "truncate", "monitor"] {
        assert!(stdout.contains(required), "help output missing {required}");
    }
}

#[test]
fn write_prints_stored_record_with_request_origin() {
    let db = TempDb::new("write");
    let output = dblog_success(
        &db.path,
        &[
            "write",
            "--type",
            "error",
            "--message",
            "payment failed",
            "--context",
            r#"{"order": 991}"#,
            "--request",
            r#"{"server": {"REMOTE_ADDR": "10.0.0.7", "HTTP_REFERER": "https://shop.test/cart"}, "user_id": 17}"#,
        ],
    );
    let record = stdout_json(&output);

    assert_eq!(record["id"], 1);
    assert_eq!(record["type"], "error");
    assert_eq!(record["message"], "payment failed");
    assert_eq!(record["count"], 1);
    assert_eq!(record["ip"], "10.0.0.7");
    assert_eq!(record["refer"], "https://shop.test/cart");

    let context: Value = match record["context"].as_str() {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => panic!("stored context is not JSON: {err}"),
        },
        None => panic!("context should be rendered text"),
    };
    assert_eq!(context["order"], 991);
    assert_eq!(context["user_id"], 17);
    assert_eq!(context["headers"]["REMOTE_ADDR"], "10.0.0.7");
}

#[test]
fn write_with_blank_type_fails_without_storing() {
    let db = TempDb::new("blank");
    let output = dblog_output(&db.path, &["write", "--type", "  ", "--message", "x"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation"));
    assert_eq!(row_count(&db.path, "database_logs"), 0);
}

#[test]
fn search_and_types_reflect_written_rows() {
    let db = TempDb::new("search");
    let _ = write_log(&db.path, "warn", "disk low");
    let _ = write_log(&db.path, "error", "disk full");
    let _ = write_log(&db.path, "error", "queue stalled");

    let types = stdout_json(&dblog_success(&db.path, &["--json", "types"]));
    assert_eq!(types, serde_json::json!(["error", "warn"]));

    let by_type = stdout_json(&dblog_success(
        &db.path,
        &["--json", "search", "--query", "type@error"],
    ));
    assert_eq!(by_type.as_array().map(Vec::len), Some(2));

    let by_message = stdout_json(&dblog_success(
        &db.path,
        &["--json", "search", "--query", "disk"],
    ));
    assert_eq!(by_message.as_array().map(Vec::len), Some(2));

    let text = dblog_success(&db.path, &["search", "--query", "queue", "--limit", "1"]);
    let stdout = String::from_utf8_lossy(&text.stdout);
    assert!(stdout.contains(": error\nqueue stalled"));
}

#[test]
fn dedup_reports_updates_and_leaves_one_row_per_pair() {
    let db = TempDb::new("dedup");
    for _ in 0..3 {
        let _ = write_log(&db.path, "warn", "disk low");
    }
    let _ = write_log(&db.path, "error", "disk full");

    let report = stdout_json(&dblog_success(&db.path, &["dedup"]));
    assert_eq!(report["updated"], 1);
    assert_eq!(report["deleted"], 2);
    assert_eq!(row_count(&db.path, "database_logs"), 2);

    let warn = stdout_json(&dblog_success(
        &db.path,
        &["--json", "search", "--query", "type@warn"],
    ));
    assert_eq!(warn[0]["count"], 3);
    assert_eq!(warn[0]["id"], 3);

    let again = stdout_json(&dblog_success(&db.path, &["dedup"]));
    assert_eq!(again["updated"], 0);
}

#[test]
fn gc_enforces_row_limit() {
    let db = TempDb::new("gc");
    for index in 0..6 {
        let _ = write_log(&db.path, "info", &format!("line {index}"));
    }

    let report = stdout_json(&dblog_success(&db.path, &["gc", "--limit", "2"]));
    assert_eq!(report["by_age"], 0);
    assert_eq!(report["by_count"], 4);
    assert_eq!(report["total"], 4);

    let remaining = stdout_json(&dblog_success(&db.path, &["--json", "search"]));
    let ids: Vec<i64> = match remaining.as_array() {
        Some(rows) => rows.iter().filter_map(|row| row["id"].as_i64()).collect(),
        None => panic!("expected array of rows"),
    };
    assert_eq!(ids, vec![6, 5]);
}

#[test]
fn gc_rejects_zero_limit() {
    let db = TempDb::new("gc-zero");
    let output = dblog_output(&db.path, &["gc", "--limit", "0"]);
    assert!(!output.status.success());
}

#[test]
fn truncate_empties_table_and_restarts_ids() {
    let db = TempDb::new("truncate");
    let _ = write_log(&db.path, "info", "one");
    let _ = write_log(&db.path, "info", "two");

    let report = stdout_json(&dblog_success(&db.path, &["truncate"]));
    assert_eq!(report["deleted"], 2);
    assert_eq!(row_count(&db.path, "database_logs"), 0);

    let record = write_log(&db.path, "info", "three");
    assert_eq!(record["id"], 1);
}

#[test]
fn config_file_applies_table_and_level_override() {
    let db = TempDb::new("config");
    let config_path = db.path.with_extension("json");
    if let Err(err) = std::fs::write(
        &config_path,
        r#"{"type": "audit", "model": "audit_logs", "limit": 10}"#,
    ) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.to_string_lossy().to_string();

    let record = stdout_json(&dblog_success(
        &db.path,
        &["--config", &config_arg, "write", "--type", "debug", "--message", "login"],
    ));
    assert_eq!(record["type"], "audit");
    assert_eq!(row_count(&db.path, "audit_logs"), 1);

    let _ = std::fs::remove_file(&config_path);
}

#[test]
fn config_file_with_unknown_key_is_rejected() {
    let db = TempDb::new("config-unknown");
    let config_path = db.path.with_extension("json");
    if let Err(err) = std::fs::write(&config_path, r#"{"retention": "forever"}"#) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.to_string_lossy().to_string();

    let output = dblog_output(&db.path, &["--config", &config_arg, "types"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("configuration"));

    let _ = std::fs::remove_file(&config_path);
}

#[test]
fn invalid_table_name_is_rejected() {
    let db = TempDb::new("table");
    let output = dblog_output(&db.path, &["--table", "logs; DROP TABLE x", "types"]);
    assert!(!output.status.success());
}

#[test]
fn monitor_notifies_named_listener_with_matching_rows() {
    let db = TempDb::new("monitor");
    let _ = write_log(&db.path, "error", "disk full");
    let _ = write_log(&db.path, "info", "all good");

    let output = dblog_success(
        &db.path,
        &["monitor", "--query", "type@error", "--callback", "stderr"],
    );
    let report = stdout_json(&output);
    assert_eq!(report["matched"], 1);
    assert_eq!(report["delivered"], 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("disk full"));

    let silent = stdout_json(&dblog_success(&db.path, &["monitor", "--query", "type@error"]));
    assert_eq!(silent["matched"], 1);
    assert_eq!(silent["delivered"], 0);
}

#[test]
fn monitor_with_unknown_callback_fails() {
    let db = TempDb::new("monitor-unknown");
    let output = dblog_output(
        &db.path,
        &["monitor", "--query", "boom", "--callback", "pagerduty"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("pagerduty"));
}
