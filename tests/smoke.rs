//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Sensor-stream anomaly detection",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("sensorwarden"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_train_subcommand_exists() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .args(["train", "--help"])
        .assert()
        .success();
}

#[test]
fn test_score_now_subcommand_exists() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .args(["score-now", "--help"])
        .assert()
        .success();
}

#[test]
fn test_simulate_subcommand_exists() {
    Command::cargo_bin("sensorwarden")
        .unwrap()
        .args(["simulate", "--help"])
        .assert()
        .success();
}
