//! End-to-end tests for `pyexec run`, `resolve`, `info` and `completions`.
// Test module - relaxed lint rules
#![cfg(unix)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use pyexec_fixtures::{catalog_row, fake_environment, temp_dir, write_catalog, write_script};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};

/// The binary with user settings and desktop detection isolated from the host.
fn pyexec_bin(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pyexec"));
    cmd.env("XDG_CONFIG_HOME", home.join("config"))
        .env("HOME", home)
        .env_remove("PYEXEC_DEFAULT_ROOT")
        .env_remove("RUST_LOG")
        .env_remove("DISPLAY")
        .env_remove("WAYLAND_DISPLAY")
        .arg("--color=never");
    cmd
}

fn json_line(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().last().expect("no output on stdout");
    serde_json::from_str(line).expect("stdout is not JSON")
}

// =============================================================================
// run
// =============================================================================

#[test]
fn run_json_reports_child_exit_code_and_log() {
    let root = temp_dir("cli-run");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(&root, "job.py", "echo hello\necho oops >&2\nexit 3\n");

    let output = pyexec_bin(&root)
        .args(["run", "--json", "--venv"])
        .arg(&env)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(3));
    let result = json_line(&output);
    assert_eq!(result["status"], "completed");
    assert_eq!(result["exit_code"], 3);
    assert_eq!(result["mode"]["kind"], "interpreter");
    assert_eq!(result["log"][0]["stream"], "output");
    assert_eq!(result["log"][0]["text"], "hello");
    assert_eq!(result["log"][1]["stream"], "error");
}

#[test]
fn run_text_prints_tagged_lines() {
    let root = temp_dir("cli-run-text");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(&root, "job.py", "echo hello\n");

    let output = pyexec_bin(&root)
        .args(["run", "--default-root"])
        .arg(&env)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert!(
        output.status.success(),
        "run should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
}

#[test]
fn inherited_python_home_is_not_passed_on() {
    let root = temp_dir("cli-run-pythonhome");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(
        &root,
        "job.py",
        "echo \"home=${PYTHONHOME:-unset} path=${PYTHONPATH:-unset}\"\n",
    );

    let output = pyexec_bin(&root)
        .env("PYTHONHOME", "/opt/global-python")
        .env("PYTHONPATH", "/opt/global-python/lib")
        .args(["run", "--json", "--venv"])
        .arg(&env)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        json_line(&output)["log"][0]["text"],
        "home=unset path=unset"
    );
}

#[test]
fn run_from_catalog_entry() {
    let root = temp_dir("cli-run-catalog");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(&root, "job.py", "echo from-catalog\n");
    let catalog = root.join("scripts.json");
    write_catalog(
        &catalog,
        &[catalog_row("Job", &script, &env.display().to_string(), false, false)],
    );

    let output = pyexec_bin(&root)
        .args(["run", "--json", "--catalog"])
        .arg(&catalog)
        .args(["--entry", "job"])
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(0));
    let result = json_line(&output);
    assert_eq!(result["name"], "Job");
    assert_eq!(result["log"][0]["text"], "from-catalog");
}

#[test]
fn run_without_environment_exits_3() {
    let root = temp_dir("cli-run-noenv");
    let script = write_script(&root, "job.py", "echo never\n");

    let output = pyexec_bin(&root)
        .args(["run", "--json"])
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(3));
    let result = json_line(&output);
    assert_eq!(result["status"], "failed_to_start");
    assert_eq!(result["error"]["code"], "E_ENVIRONMENT_NOT_FOUND");
    assert_eq!(result["log"].as_array().map(Vec::len), Some(0));
}

#[test]
fn run_unknown_extension_without_confirmation_exits_4() {
    let root = temp_dir("cli-run-unknown");
    let notes = write_script(&root, "notes.txt", "hello\n");

    let output = pyexec_bin(&root)
        .args(["run", "--json"])
        .arg(&notes)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(4));
    assert_eq!(json_line(&output)["error"]["code"], "E_UNSUPPORTED_EXTENSION");
}

#[test]
fn run_timeout_exits_124() {
    let root = temp_dir("cli-run-timeout");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(&root, "job.py", "sleep 30\n");

    let output = pyexec_bin(&root)
        .args(["run", "--json", "--timeout", "1", "--venv"])
        .arg(&env)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(124));
    assert_eq!(json_line(&output)["status"], "timed_out");
}

#[test]
fn run_without_target_is_a_config_error() {
    let root = temp_dir("cli-run-usage");
    let output = pyexec_bin(&root)
        .args(["run", "--json"])
        .output()
        .expect("failed to execute");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(json_line(&output)["code"], "E_CONFIG");
}

#[test]
fn uv_and_shell_conflict() {
    let root = temp_dir("cli-run-conflict");
    let output = pyexec_bin(&root)
        .args(["run", "--uv", "--shell", "job.py"])
        .output()
        .expect("failed to execute");
    assert!(!output.status.success(), "--uv with --shell should be rejected");
}

// =============================================================================
// resolve
// =============================================================================

#[test]
fn resolve_prints_environment_and_interpreter() {
    let root = temp_dir("cli-resolve");
    let envs = root.join("envs");
    fake_environment(&envs.join(".venv"), "bin", "python");
    let script = write_script(&root, "job.py", "");

    let output = pyexec_bin(&root)
        .args(["resolve", "--default-root"])
        .arg(&envs)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("{} [default root/.venv]", envs.join(".venv").display())));
    assert!(stdout.contains("interpreter: "));
}

#[test]
fn resolve_reads_default_root_file() {
    let root = temp_dir("cli-resolve-file");
    let envs = fake_environment(&root.join("envs"), "bin", "python");
    let script = write_script(&root, "job.py", "");
    let stored = root.join("default_venv_root.json");
    std::fs::write(&stored, serde_json::to_string(&envs.display().to_string()).unwrap()).unwrap();

    let output = pyexec_bin(&root)
        .args(["resolve", "--json", "--default-root-file"])
        .arg(&stored)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(0));
    let resolution = json_line(&output);
    assert_eq!(resolution["status"], "found");
    assert_eq!(resolution["root"], envs.display().to_string());
}

#[test]
fn resolve_not_found_exits_3() {
    let root = temp_dir("cli-resolve-missing");
    let script = write_script(&root, "job.py", "");
    let output = pyexec_bin(&root)
        .args(["resolve", "--json", "--venv"])
        .arg(root.join("nowhere"))
        .arg(&script)
        .output()
        .expect("failed to execute");
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(json_line(&output)["status"], "not_found");
}

#[test]
fn resolve_assess_requires_acknowledgement() {
    let root = temp_dir("cli-assess");
    let plain = root.join("plain");
    std::fs::create_dir_all(&plain).unwrap();

    let refused = pyexec_bin(&root)
        .args(["resolve", "--assess"])
        .arg(&plain)
        .output()
        .expect("failed to execute");
    assert_eq!(refused.status.code(), Some(3));

    let accepted = pyexec_bin(&root)
        .args(["resolve", "--accept-unresolved", "--assess"])
        .arg(&plain)
        .output()
        .expect("failed to execute");
    assert!(accepted.status.success());
}

// =============================================================================
// info and completions
// =============================================================================

#[test]
fn info_runs_the_diagnostics_script() {
    let root = temp_dir("cli-info");
    let env = fake_environment(&root.join("env"), "bin", "python");
    let script = write_script(&root, "job.py", "echo user-script\n");
    let probe = write_script(&root, "probe.py", "echo probe-ran\n");

    let output = pyexec_bin(&root)
        .args(["info", "--diagnostics-script"])
        .arg(&probe)
        .arg("--venv")
        .arg(&env)
        .arg(&script)
        .output()
        .expect("failed to execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--- Pre-Execution Environment Setup ---"));
    assert!(stdout.contains("probe-ran"));
    assert!(!stdout.contains("user-script"));
}

#[test]
fn completions_generate_for_bash() {
    let root = temp_dir("cli-completions");
    let output = pyexec_bin(&root)
        .args(["completions", "bash"])
        .output()
        .expect("failed to execute");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("pyexec"));
}
