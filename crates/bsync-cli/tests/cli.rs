//! CLI command integration tests.
//! Each test uses a temp directory via BSYNC_DATA_DIR; engines point at a
//! closed local port so every call fails fast.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const ENGINES_DOWN: &str = r#"
[engines.HURAII]
endpoint = "http://127.0.0.1:9"
timeout_secs = 2.0

[engines.CLOE]
endpoint = "http://127.0.0.1:9"
timeout_secs = 2.0

[engines.HORACE]
endpoint = "http://127.0.0.1:9"
timeout_secs = 2.0

[engines.THORIUS]
endpoint = "http://127.0.0.1:9"
timeout_secs = 2.0

[engines.ARCHER]
endpoint = "http://127.0.0.1:9"
timeout_secs = 2.0
"#;

fn data_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bsync.toml"), ENGINES_DOWN).unwrap();
    dir
}

fn bsync(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("bsync").unwrap();
    cmd.env("BSYNC_DATA_DIR", data_dir.path());
    cmd
}

#[test]
fn token_is_generated_once() {
    let dir = data_dir();
    let first = bsync(&dir).arg("token").output().unwrap();
    assert!(first.status.success());
    let token = String::from_utf8_lossy(&first.stdout).trim().to_string();
    assert_eq!(token.len(), 32);

    bsync(&dir)
        .arg("token")
        .assert()
        .success()
        .stdout(predicate::str::contains(token.as_str()));
}

#[test]
fn configured_token_is_printed() {
    let dir = data_dir();
    let config = dir.path().join("custom.toml");
    std::fs::write(&config, "sync_token = \"letmein\"\n").unwrap();
    bsync(&dir)
        .arg("token")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::diff("letmein\n"));
}

#[test]
fn activity_is_batched() {
    let dir = data_dir();
    bsync(&dir)
        .args(["enqueue", r#"{"action":"user_activity","user_id":7,"page_url":"/gallery"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued user_activity"))
        .stdout(predicate::str::contains("priority 5 (batched)"));

    bsync(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending:   1"))
        .stdout(predicate::str::contains("processed: 0"));
}

#[test]
fn purchase_dispatches_immediately_and_requeues() {
    let dir = data_dir();
    bsync(&dir)
        .args([
            "enqueue",
            r#"{"action":"purchase_completed","user_id":3,"order_id":10,"total_amount":25.0}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("priority 8 (immediate)"))
        .stdout(predicate::str::contains("queue: 1 pending, 0 processed, 0 failed"));

    bsync(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("CLOE"))
        .stdout(predicate::str::contains("degraded"));
}

#[test]
fn flush_counts_a_retry() {
    let dir = data_dir();
    bsync(&dir)
        .args(["enqueue", r#"{"action":"page_view","user_id":2}"#])
        .assert()
        .success();

    bsync(&dir)
        .arg("flush")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "dispatched 1: 0 delivered, 1 retried, 0 failed, 0 deferred",
        ));
}

#[test]
fn flush_on_empty_queue() {
    let dir = data_dir();
    bsync(&dir)
        .args(["flush", "--batch-size", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dispatched 0"))
        .stdout(predicate::str::contains("0 left in queue"));
}

#[test]
fn health_marks_unreachable_engines_degraded() {
    let dir = data_dir();
    let output = bsync(&dir).arg("health").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 5);
    assert!(stdout.lines().all(|l| l.contains("degraded")), "{stdout}");
}

#[test]
fn invalid_event_is_rejected() {
    let dir = data_dir();
    bsync(&dir)
        .args(["enqueue", r#"{"action":"teleport","user_id":1}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid domain event"));
}

#[test]
fn unknown_engine_in_config_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("bsync.toml"),
        "[engines.SKYNET]\nendpoint = \"http://127.0.0.1:9\"\n",
    )
    .unwrap();
    bsync(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn empty_user_reads() {
    let dir = data_dir();
    bsync(&dir)
        .args(["metrics", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no metrics)"));
    bsync(&dir)
        .args(["insights", "42", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no insights)"));
}
