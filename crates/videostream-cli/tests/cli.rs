// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;

fn videostream() -> Command {
    Command::cargo_bin("videostream").expect("binary should build")
}

#[test]
fn help_lists_subcommands() {
    videostream()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("stream"))
        .stdout(predicate::str::contains("receive"))
        .stdout(predicate::str::contains("bench"));
}

#[test]
fn version_prints() {
    videostream()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("videostream"));
}

#[test]
fn stream_rejects_bad_resolution() {
    videostream()
        .args(["stream", "/tmp/vsl_cli_badres.sock", "--resolution", "bogus"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid arguments"));
}

#[test]
fn stream_rejects_bad_fourcc() {
    videostream()
        .args(["stream", "/tmp/vsl_cli_badcc.sock", "--format", "TOOLONG"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn receive_times_out_without_producer() {
    // Reconnect is enabled, so a missing host surfaces as a receive timeout.
    videostream()
        .args([
            "receive",
            &format!("/tmp/vsl_cli_nohost_{}.sock", std::process::id()),
            "--frames",
            "1",
            "--timeout",
            "0.2",
        ])
        .assert()
        .failure()
        .code(6)
        .stderr(predicate::str::contains("Timeout"));
}

#[test]
#[serial]
fn bench_loopback_reports_json_metrics() {
    let assert = videostream()
        .args([
            "--json",
            "--quiet",
            "bench",
            "--frames",
            "20",
            "--resolution",
            "64x64",
            "--format",
            "GREY",
        ])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let metrics: serde_json::Value =
        serde_json::from_str(&stdout).expect("bench --json should print a JSON report");
    assert_eq!(metrics["frames_processed"], 20);
    assert_eq!(metrics["dropped_frames"], 0);
}

#[test]
fn bench_rejects_zero_frames() {
    videostream()
        .args(["bench", "--frames", "0"])
        .assert()
        .failure()
        .code(2);
}
