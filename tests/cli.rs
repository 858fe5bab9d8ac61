use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("zapai")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("status"));
}

#[test]
fn serve_fails_without_private_key() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join(".env");
    fs::write(&env_path, "GEMINI_API_KEY=k\nNOSTR_RELAYS=wss://r1\n").unwrap();

    Command::cargo_bin("zapai")
        .unwrap()
        .env_remove("BOT_PRIVATE_KEY")
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("BOT_PRIVATE_KEY"));
}

#[test]
fn serve_fails_without_relays() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join(".env");
    fs::write(
        &env_path,
        "BOT_PRIVATE_KEY=0000000000000000000000000000000000000000000000000000000000000001\nGEMINI_API_KEY=k\n",
    )
    .unwrap();

    Command::cargo_bin("zapai")
        .unwrap()
        .env_remove("NOSTR_RELAYS")
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("NOSTR_RELAYS"));
}

#[test]
fn status_fails_when_nothing_listens() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join(".env");
    fs::write(
        &env_path,
        concat!(
            "BOT_PRIVATE_KEY=0000000000000000000000000000000000000000000000000000000000000001\n",
            "GEMINI_API_KEY=k\n",
            "NOSTR_RELAYS=wss://r1\n",
        ),
    )
    .unwrap();

    Command::cargo_bin("zapai")
        .unwrap()
        .args([
            "--env",
            env_path.to_str().unwrap(),
            "status",
            "--url",
            "http://127.0.0.1:1/status",
        ])
        .assert()
        .failure();
}
