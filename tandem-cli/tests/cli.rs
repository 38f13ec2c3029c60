use std::fs;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn frame(cmd: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{cmd:>10}{:>10}", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

fn tandem() -> assert_cmd::Command {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("tandem"))
}

#[test]
fn server_mode_answers_on_stdout_and_exits_cleanly() {
    let dir = TempDir::new().expect("tree");
    let mut input = frame("ping", b"");
    input.extend(frame("shutdown", b""));

    tandem()
        .arg("--server")
        .arg(dir.path())
        .write_stdin(input)
        .assert()
        .success()
        .stdout(format!("{:>10}pong{:>10}", 4, 0));

    assert!(dir.path().join(".tandem/files").is_dir());
    assert!(!dir.path().join(".tandem/pid").exists(), "pid marker removed on exit");
}

#[test]
fn server_mode_rejects_unknown_commands_with_exit_code_one() {
    let dir = TempDir::new().expect("tree");
    tandem()
        .arg("--server")
        .arg(dir.path())
        .write_stdin(frame("explode", b""))
        .assert()
        .failure()
        .code(1)
        .stdout("")
        .stderr(contains("unknown command"));
}

#[test]
fn client_mode_without_config_fails() {
    let dir = TempDir::new().expect("tree");
    fs::create_dir_all(dir.path().join(".tandem")).expect("repo dir");
    tandem()
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(contains("config file not found"));
}

#[test]
fn tiny_memory_ceiling_is_refused() {
    let dir = TempDir::new().expect("tree");
    tandem()
        .args(["--server", "--max-memory", "16"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(contains("--max-memory"));
}
