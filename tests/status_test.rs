use predicates::prelude::*;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn status_lists_tracked_chats_and_masks_key() {
    let tmp = tempdir().expect("tempdir");
    assert_cmd::cargo::cargo_bin_cmd!("chat-relay")
        .current_dir(tmp.path())
        .env("CHAT_RELAY_HOME", tmp.path())
        .env_remove("CHAT_RELAY_TRACKED_DIR")
        .args([
            "track",
            "--chat-id",
            "chat_abc",
            "--session-key",
            "agent:main:main",
            "--gateway-url",
            "http://127.0.0.1:18789",
            "--label",
            "Deck",
            "--no-spawn",
        ])
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("chat-relay")
        .current_dir(tmp.path())
        .env("CHAT_RELAY_HOME", tmp.path())
        .env_remove("CHAT_RELAY_TRACKED_DIR")
        .env("CHAT_RELAY_API_KEY", "sk_live_secretvalue")
        .arg("status")
        .assert()
        .success()
        .stdout(contains("tracked_chats=1"))
        .stdout(contains("chat=chat_abc listeners=1 label=Deck"))
        .stdout(contains("CHAT_RELAY_API_KEY=sk_liv...(set)"))
        .stdout(contains("daemon_running=false"))
        .stdout(contains("secretvalue").not());
}

#[test]
fn status_flags_missing_api_key_as_json() {
    let tmp = tempdir().expect("tempdir");
    assert_cmd::cargo::cargo_bin_cmd!("chat-relay")
        .current_dir(tmp.path())
        .env("CHAT_RELAY_HOME", tmp.path())
        .env_remove("CHAT_RELAY_API_KEY")
        .args(["--json", "status"])
        .assert()
        .code(2)
        .stdout(contains("\"command\": \"status\""))
        .stdout(contains("CHAT_RELAY_API_KEY is not set"));
}
