//! Test utilities and fixtures for pyexec integration tests.
//!
//! - [`temp_dir`] - Create unique temporary directories
//! - [`fake_environment`] - Lay out a virtual environment whose interpreter is a shell shim
//! - [`write_script`] / [`write_executable`] - Drop script files into a directory
//! - [`write_catalog`] - Serialize legacy catalog rows to JSON
//!
//! The fake interpreter forwards its arguments to `/bin/sh`, so a "Python" script
//! written by these helpers is really a POSIX shell script. That keeps the process
//! tests independent of any Python installation.
//!
//! # Example
//!
//! ```ignore
//! use pyexec_fixtures::{fake_environment, temp_dir, write_script};
//!
//! let root = temp_dir("resolver");
//! let env = fake_environment(&root.join("venv"), "bin", "python");
//! let script = write_script(&root, "hello.py", "echo hello");
//! ```

// Test fixtures crate - relaxed lints for test utilities
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Interpreter shim body: runs the script argument with `/bin/sh`.
pub const SHIM: &str = "#!/bin/sh\nexec /bin/sh \"$@\"\n";

/// Create a unique temporary directory for a test.
///
/// The directory name includes a timestamp and a process-wide counter to avoid
/// collisions between parallel test runs. The directory is created immediately.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!(
        "pyexec-{prefix}-{}-{stamp}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("failed to create temp directory");
    dir
}

/// Lay out `root/<bin_dir>/<interpreter>` as an executable shim plus an
/// `activate` file, and return `root`.
///
/// Pass an empty `interpreter` to create only the binaries folder.
pub fn fake_environment(root: &Path, bin_dir: &str, interpreter: &str) -> PathBuf {
    let bin = root.join(bin_dir);
    fs::create_dir_all(&bin).expect("failed to create environment bin dir");
    if !interpreter.is_empty() {
        write_executable(&bin, interpreter, SHIM);
    }
    fs::write(bin.join("activate"), "# activation stub\n").expect("failed to write activate");
    root.to_path_buf()
}

/// Write `body` into `dir/name` and return the full path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("failed to create script dir");
    let path = dir.join(name);
    fs::write(&path, body).expect("failed to write script");
    path
}

/// Write `body` into `dir/name` and mark it executable (no-op on non-Unix).
pub fn write_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = write_script(dir, name, body);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

/// One catalog row in the legacy PascalCase shape.
#[must_use]
pub fn catalog_row(name: &str, path: &Path, venv: &str, use_uv: bool, run_in_cmd: bool) -> Value {
    json!({
        "Name": name,
        "Path": path.display().to_string(),
        "VirtualEnvPath": venv,
        "UseUvRun": use_uv,
        "RunInCmd": run_in_cmd,
    })
}

/// Write `rows` as a pretty-printed JSON catalog file.
pub fn write_catalog(path: &Path, rows: &[Value]) {
    let data = serde_json::to_vec_pretty(rows).expect("failed to serialize catalog");
    fs::write(path, data).expect("failed to write catalog");
}
