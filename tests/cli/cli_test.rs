//! CLI contract tests.

use std::path::Path;

use assert_cmd::Command;

const UNIT: &str = r#"
command = "cat input.txt"
inputs = ["1"]

[definition]
version = 1
"#;

fn sentinel_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sentinel").expect("binary built");
    cmd.current_dir(dir)
        .env_remove("SENTINEL_CONFIG_PATH")
        .env_remove("SENTINEL_LEDGER_DIR")
        .env("HOME", dir)
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn identity_prints_stable_identifier() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("unit.toml"), UNIT).expect("write unit");

    let first = sentinel_cmd(tmp.path())
        .args(["identity", "unit.toml"])
        .output()
        .expect("runs");
    let second = sentinel_cmd(tmp.path())
        .args(["identity", "unit.toml"])
        .output()
        .expect("runs");

    assert!(first.status.success());
    let id = stdout_of(&first);
    assert_eq!(id.trim().len(), 16);
    assert_eq!(id, stdout_of(&second));
}

#[test]
fn ledger_show_on_empty_ledger() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let output = sentinel_cmd(tmp.path())
        .args(["ledger", "show"])
        .output()
        .expect("runs");
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("version: (none)"));
    assert!(tmp.path().join("data/kernel/versions").is_dir());
}

#[test]
fn ledger_rollback_without_history_fails() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    sentinel_cmd(tmp.path())
        .args(["ledger", "rollback"])
        .assert()
        .failure();
}

#[test]
fn monitor_rejects_malformed_identifier() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    sentinel_cmd(tmp.path())
        .args(["monitor", "not-an-id", "--trait", "speed_ms=5"])
        .assert()
        .failure();
}

#[test]
fn monitor_within_envelope_succeeds() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let output = sentinel_cmd(tmp.path())
        .args([
            "monitor",
            "0123456789abcdef",
            "--trait",
            "speed_ms=100",
            "--trait",
            "memory_mb=50",
            "--trait",
            "reliability=1",
        ])
        .output()
        .expect("runs");
    assert!(output.status.success());
    assert!(stdout_of(&output).starts_with("ok vp="));
}

#[cfg(unix)]
#[test]
fn certify_then_show_lists_unit() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("unit.toml"), UNIT).expect("write unit");
    std::fs::write(
        tmp.path().join("sentinel.toml"),
        "[chamber]\nbackend = \"direct\"\n",
    )
    .expect("write config");

    let certify = sentinel_cmd(tmp.path())
        .args(["certify", "unit.toml"])
        .output()
        .expect("runs");
    assert!(certify.status.success(), "{}", stdout_of(&certify));
    let text = stdout_of(&certify);
    let id = text
        .lines()
        .find_map(|line| line.strip_prefix("certified "))
        .expect("certified line")
        .to_owned();

    let show = sentinel_cmd(tmp.path())
        .args(["ledger", "show"])
        .output()
        .expect("runs");
    assert!(stdout_of(&show).contains(&id));
}

#[test]
fn check_reports_direct_backend() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(
        tmp.path().join("sentinel.toml"),
        "[chamber]\nbackend = \"direct\"\n",
    )
    .expect("write config");
    let output = sentinel_cmd(tmp.path())
        .arg("check")
        .output()
        .expect("runs");
    assert!(output.status.success());
    assert!(stdout_of(&output).starts_with("direct: degraded"));
}
