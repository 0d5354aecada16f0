use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn cli_track_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("dreamlake");
    cmd.args(["track", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("append"))
        .stdout(predicate::str::contains("read"))
        .stdout(predicate::str::contains("stats"));
}

#[test]
fn cli_init_creates_session_directory() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = temp_dir.path().join("store");

    let mut cmd = cargo_bin_cmd!("dreamlake");
    cmd.args(["init", "demo/run-1", "--root"])
        .arg(&root)
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized session at demo/run-1"));

    assert!(root.join("demo/run-1/session.json").exists(), "session.json should exist");
}

#[test]
fn cli_params_set_then_get_round_trips() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = temp_dir.path().join("store");

    cargo_bin_cmd!("dreamlake")
        .args(["params", "demo/run-1", "--root"])
        .arg(&root)
        .args(["set", "lr=0.01", "model=\"resnet\""])
        .assert()
        .success();

    cargo_bin_cmd!("dreamlake")
        .args(["params", "demo/run-1", "--root"])
        .arg(&root)
        .arg("get")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"lr\": 0.01"))
        .stdout(predicate::str::contains("\"model\": \"resnet\""));
}

#[test]
fn cli_log_appends_a_record() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = temp_dir.path().join("store");

    cargo_bin_cmd!("dreamlake")
        .args(["log", "demo/run-1", "--root"])
        .arg(&root)
        .arg("training started")
        .assert()
        .success()
        .stdout(predicate::str::contains("#0 [info] training started"));

    let logs_path = root.join("demo/run-1/logs/logs.jsonl");
    assert!(logs_path.exists(), "logs.jsonl should exist");
}

#[test]
fn cli_track_append_then_read_round_trips() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = temp_dir.path().join("store");

    cargo_bin_cmd!("dreamlake")
        .args(["track", "demo/run-1", "--root"])
        .arg(&root)
        .args(["append", "loss", "value=0.5", "epoch=1"])
        .assert()
        .success();

    cargo_bin_cmd!("dreamlake")
        .args(["track", "demo/run-1", "--root"])
        .arg(&root)
        .args(["read", "loss"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"value\":0.5"));
}

#[test]
fn cli_rejects_prefix_without_workspace_segment() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = temp_dir.path().join("store");

    cargo_bin_cmd!("dreamlake")
        .args(["init", "just-a-name", "--root"])
        .arg(&root)
        .assert()
        .failure();
}
