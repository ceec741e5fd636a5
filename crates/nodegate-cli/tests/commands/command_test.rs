//! Tests for the `command` subcommand in dry-run mode.

use predicates::prelude::*;
use tempfile::TempDir;

use super::AC_DOCUMENT;
use crate::nodegate;

fn schema_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ac.json"), AC_DOCUMENT).unwrap();
    dir
}

#[test]
fn test_dry_run_prints_command() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", r#"{"temp": 21, "mode": "mode2"}"#])
        .args(["--device-type", "AC", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("down/command/24A160"))
        .stdout(predicate::str::contains(r#""temp":21"#))
        .stdout(predicate::str::contains(r#""mode":"mode2""#));
}

#[test]
fn test_topic_prefix_from_environment() {
    let dir = schema_dir();

    nodegate()
        .env("NODEGATE_TOPIC_PREFIX", "site-a")
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", r#"{"temp": 22}"#, "-t", "AC", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("site-a/down/command/24A160"));
}

#[test]
fn test_non_commandable_channel_is_refused() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", r#"{"relay01": true}"#, "-t", "AC", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("relay01"))
        .stdout(predicate::str::contains("down/command").not());
}

#[test]
fn test_out_of_range_value_is_refused() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", r#"{"temp": 35}"#, "-t", "AC", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("temp"));
}

#[test]
fn test_unknown_device_type() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", r#"{"temp": 21}"#, "-t", "heater", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No schema for device type: heater"));
}

#[test]
fn test_channels_must_be_object() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "24A160", "[1, 2]", "-t", "AC", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn test_multi_segment_device_id_is_refused() {
    let dir = schema_dir();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["command", "a/b", r#"{"temp": 21}"#, "-t", "AC", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid topic"))
        .stdout(predicate::str::contains("down/command").not());
}
