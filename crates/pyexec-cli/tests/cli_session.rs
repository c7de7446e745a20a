//! End-to-end tests for `pyexec session` and its single-instance guard.
// Test module - relaxed lint rules
#![cfg(target_os = "linux")]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]

use pyexec::instance::holder_pid;
use pyexec_fixtures::{catalog_row, fake_environment, temp_dir, write_script};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const LOCK_NAME: &str = "pyexec-cli-test";

/// Settings file pointing the instance lock into `root`.
fn settings_file(root: &Path) -> PathBuf {
    let path = root.join("settings.json");
    let settings = json!({
        "terminal": "xterm",
        "instance": {
            "lock_name": LOCK_NAME,
            "lock_dir": root.join("locks"),
            "window_title": "PyExec Session Test",
        },
    });
    std::fs::write(&path, settings.to_string()).unwrap();
    path
}

fn session(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pyexec"));
    cmd.env("XDG_CONFIG_HOME", root.join("config"))
        .env_remove("PYEXEC_DEFAULT_ROOT")
        .env_remove("RUST_LOG")
        .env_remove("DISPLAY")
        .env_remove("WAYLAND_DISPLAY")
        .arg("--config")
        .arg(settings_file(root))
        .arg("session");
    cmd
}

#[test]
fn session_runs_requests_and_exits_when_input_closes() {
    let root = temp_dir("cli-session");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let first = write_script(&root, "first.py", "echo one\n");
    let second = write_script(&root, "second.py", "echo two\nexit 1\n");

    let mut child = session(&root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn session");
    {
        let mut stdin = child.stdin.take().unwrap();
        let env = env.display().to_string();
        for script in [&first, &second] {
            let request = json!({ "script": catalog_row("", script, &env, false, false) });
            writeln!(stdin, "{request}").unwrap();
        }
        writeln!(stdin, "not json").unwrap();
    }
    let output = child.wait_with_output().expect("session did not finish");

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("session line is not JSON"))
        .collect();
    assert_eq!(lines.len(), 3);

    assert!(lines.iter().any(|line| line["code"] == "E_CONFIG"));
    let by_name = |name: &str| {
        lines
            .iter()
            .find(|line| line["name"] == name)
            .unwrap_or_else(|| panic!("no result for {name}"))
            .clone()
    };
    assert_eq!(by_name("first")["log"][0]["text"], "one");
    assert_eq!(by_name("second")["exit_code"], 1);
}

#[test]
fn second_session_exits_when_primary_window_is_missing() {
    let root = temp_dir("cli-session-guard");
    let mut primary = session(&root)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn primary");

    let deadline = Instant::now() + Duration::from_secs(10);
    while holder_pid(LOCK_NAME, &root.join("locks")) != Some(primary.id()) {
        assert!(Instant::now() < deadline, "primary never took the lock");
        std::thread::sleep(Duration::from_millis(50));
    }

    let secondary = session(&root)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run secondary");

    drop(primary.stdin.take());
    let primary_status = primary.wait().expect("primary did not exit");

    assert_eq!(
        secondary.status.code(),
        Some(5),
        "stderr: {}",
        String::from_utf8_lossy(&secondary.stderr)
    );
    assert!(String::from_utf8_lossy(&secondary.stderr).contains("another instance is running"));
    assert_eq!(primary_status.code(), Some(0));
}
