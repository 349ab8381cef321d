//! CLI behaviour of the officesync_daemon binary.
use assert_cmd::Command;

#[test]
fn help_prints_usage_and_exits_cleanly() {
    let out = Command::cargo_bin("officesync_daemon")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("--workspace"));
    assert!(stdout.contains("--retention-days"));
}

#[test]
fn missing_workspace_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    Command::cargo_bin("officesync_daemon")
        .unwrap()
        .env_remove("OFFICESYNC_WORKSPACE")
        .args(["--workspace", missing.to_str().unwrap(), "-p", "0", "--http-port", "0"])
        .assert()
        .failure();
}

#[test]
fn bad_port_is_rejected() {
    Command::cargo_bin("officesync_daemon")
        .unwrap()
        .args(["--port", "not-a-port"])
        .assert()
        .failure();
}
