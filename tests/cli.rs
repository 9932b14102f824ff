//! Binary smoke tests.

use assert_cmd::Command;
use tempfile::TempDir;

fn cm(db: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("cm").unwrap();
    cmd.env("CM_DB", db)
        .env_remove("RUST_LOG")
        .env_remove("ONSHAPE_ACCESS_KEY")
        .env_remove("ONSHAPE_SECRET_KEY");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn version_prints_package_version() {
    let dir = TempDir::new().unwrap();
    let output = cm(&dir.path().join("m.db"))
        .args(["version", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn stats_before_init_is_not_initialized() {
    let dir = TempDir::new().unwrap();
    let output = cm(&dir.path().join("m.db"))
        .args(["stats", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let err: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(err["error"]["code"], "NOT_INITIALIZED");
}

#[test]
fn init_then_stats_and_jobs() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("data/m.db");

    cm(&db).args(["init", "--json"]).assert().success();
    assert!(db.exists());

    let stats = cm(&db).args(["stats", "--json"]).output().unwrap();
    assert!(stats.status.success());
    let stats = stdout_json(&stats);
    assert_eq!(stats["documents"], 0);
    assert_eq!(stats["recent_jobs"], serde_json::json!([]));

    let jobs = cm(&db).args(["jobs", "list", "--json"]).output().unwrap();
    assert!(jobs.status.success());
    assert_eq!(stdout_json(&jobs)["count"], 0);

    cm(&db).args(["init"]).assert().failure();
    cm(&db).args(["init", "--force", "--json"]).assert().success();
}

#[test]
fn show_unknown_part_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("m.db");
    cm(&db).args(["init", "--json"]).assert().success();

    let output = cm(&db)
        .args(["show", "part", "nope", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn sync_without_credentials_is_config_error() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("m.db");
    cm(&db).args(["init", "--json"]).assert().success();

    let output = cm(&db)
        .env("HOME", dir.path())
        .args(["sync", "documents", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
}
