//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;

const CONFIG: &str = r#"
[general]
throttle_limit = 2

[[targets]]
name = "web"
hosts = ["web01", "web02", "web03"]

[[commands]]
name = "up"
script = "uptime"
"#;

/// Get the binary to test, pointed at an isolated config file.
fn fanout(dir: &assert_fs::TempDir) -> Command {
    let config = dir.child("fanout.toml");
    if !config.exists() {
        config.write_str(CONFIG).unwrap();
    }
    let mut cmd = Command::cargo_bin("fanout").unwrap();
    cmd.current_dir(dir.path()).arg("--config").arg(config.path());
    cmd
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    Command::cargo_bin("fanout")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run one command against many targets"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("fanout")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_invoke_help_lists_flags() {
    Command::cargo_bin("fanout")
        .unwrap()
        .args(["invoke", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--throttle-limit"))
        .stdout(predicate::str::contains("--disconnect"));
}

// ============================================================================
// Invoke Tests
// ============================================================================

#[test]
fn test_invoke_simulated_targets() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "web02", "--command", "uptime", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[web01] web01: uptime"))
        .stdout(predicate::str::contains("[web02] web02: uptime"));
}

#[test]
fn test_invoke_group_and_alias() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "--group", "web", "--alias", "up", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[web01] web01: uptime"))
        .stdout(predicate::str::contains("[web03] web03: uptime"));
}

#[test]
fn test_invoke_script_file() {
    let dir = assert_fs::TempDir::new().unwrap();
    let script = dir.child("check.sh");
    script.write_str("systemctl is-active nginx").unwrap();

    fanout(&dir)
        .args(["invoke", "web01", "--simulate", "--file"])
        .arg(script.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[web01] web01: systemctl is-active nginx"));
}

#[test]
fn test_invoke_json_output() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "-c", "uptime", "--simulate", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sequence\""))
        .stdout(predicate::str::contains("web01: uptime"));
}

#[test]
fn test_invoke_and_disconnect() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "web02", "-c", "backup", "--simulate", "--disconnect", "--session-name", "nightly"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disconnected session 'nightly' from 2 target(s)"))
        .stdout(predicate::str::contains("web02"))
        .stderr(predicate::str::contains("commands end when fanout exits"));
}

#[test]
fn test_invoke_as_job() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "-c", "uptime", "--simulate", "--as-job"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\":\"uptime\""))
        .stdout(predicate::str::contains("Completed"));
}

#[cfg(unix)]
#[test]
fn test_invoke_local_process() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "local", "-c", "echo hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[localhost] hello"));
}

#[cfg(unix)]
#[test]
fn test_invoke_local_failure_exit_code() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "local", "-c", "exit 4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exit code 4"));
}

// ============================================================================
// Usage Errors
// ============================================================================

#[test]
fn test_zero_throttle_limit() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "-c", "uptime", "--simulate", "--throttle-limit", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("throttle limit must be greater than zero"));
}

#[test]
fn test_no_targets() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "-c", "uptime", "--simulate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no targets given"));
}

#[test]
fn test_as_job_conflicts_with_disconnect() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "-c", "uptime", "--simulate", "--as-job", "--disconnect"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot combine"));
}

#[test]
fn test_session_name_requires_disconnect() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "-c", "uptime", "--simulate", "--session-name", "nightly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("session name"));
}

#[test]
fn test_missing_command() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "web01", "--simulate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("give exactly one of"));
}

#[test]
fn test_unknown_group() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .args(["invoke", "--group", "db", "-c", "uptime", "--simulate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no target group named 'db'"));
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_show() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[general]"))
        .stdout(predicate::str::contains("throttle_limit = 2"));
}

#[test]
fn test_config_path() {
    let dir = assert_fs::TempDir::new().unwrap();
    fanout(&dir).args(["config", "--path"]).assert().success().stdout(predicate::str::contains("fanout.toml"));
}
