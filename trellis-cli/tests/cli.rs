//! End-to-end tests for the `trellis` binary that need no network access.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn trellis(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("trellis").expect("binary built");
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("trellis.toml");
    fs::write(&path, body).expect("write config");
    path
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    trellis(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync").and(predicate::str::contains("status")));
}

#[test]
fn status_without_database_is_a_database_error() {
    let dir = TempDir::new().unwrap();
    trellis(dir.path())
        .args(["status", "--db", "missing.db"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Database not found"));
}

#[test]
fn sync_with_missing_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    trellis(dir.path())
        .args(["sync", "--config", "nope.toml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn sync_with_invalid_pattern_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[patterns]
tracker_keys = ["([A-Z]+-"]
"#,
    );
    trellis(dir.path())
        .arg("sync")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid pattern"));
}

#[test]
fn sync_with_unset_token_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[source_control]
token_env = "TRELLIS_CLI_TEST_UNSET_TOKEN"

[source_control.repositories]
core = ["acme/widgets"]
"#,
    );
    trellis(dir.path())
        .arg("sync")
        .arg("--config")
        .arg(&config)
        .env_remove("TRELLIS_CLI_TEST_UNSET_TOKEN")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("TRELLIS_CLI_TEST_UNSET_TOKEN"));
}

#[test]
fn empty_sync_then_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    trellis(dir.path())
        .arg("--quiet")
        .arg("sync")
        .arg("--config")
        .arg(&config)
        .assert()
        .success();
    assert!(dir.path().join("trellis.db").exists());

    trellis(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Nodes: 0 total")
                .and(predicate::str::contains("activity_watermark: (none)"))
                .and(predicate::str::contains("Entities upserted: 0")),
        );
}
