//! Basic CLI tests for the nodegate command-line interface.

use assert_cmd::Command;
use predicates::prelude::*;

mod commands;

/// A `nodegate` command that ignores the caller's `NODEGATE_*` environment.
pub fn nodegate() -> Command {
    let mut cmd = Command::cargo_bin("nodegate").unwrap();
    for var in [
        "NODEGATE_MQTT_HOST",
        "NODEGATE_MQTT_PORT",
        "NODEGATE_TOPIC_PREFIX",
        "NODEGATE_SCHEMA_DIR",
        "NODEGATE_SCHEMA_STORE",
        "NODEGATE_DEFAULT_DEVICE_TYPE",
        "NODEGATE_LOG_JSON",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    nodegate()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("schema"))
        .stdout(predicate::str::contains("command"));
}

#[test]
fn test_cli_version() {
    nodegate()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodegate"));
}

/// Clap exits with code 2 when the subcommand is missing.
#[test]
fn test_no_subcommand_shows_error() {
    nodegate().assert().failure().code(2);
}

#[test]
fn test_missing_config_file_fails() {
    nodegate()
        .args(["--config", "/nonexistent/nodegate.toml", "schema", "list"])
        .assert()
        .failure();
}
