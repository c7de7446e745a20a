// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Catalog files written by the desktop launcher.

use pyexec::model::{find_entry, load_catalog_file, RunnerKind};
use pyexec::ErrorCode;
use pyexec_fixtures::{catalog_row, temp_dir, write_catalog, write_script};
use std::path::Path;

#[test]
fn legacy_json_catalog_loads_every_runner_kind() {
    let dir = temp_dir("catalog-json");
    let path = dir.join("scripts.json");
    write_catalog(
        &path,
        &[
            catalog_row("Backup", Path::new("/s/backup.py"), "/envs/b", false, false),
            catalog_row("Sync", Path::new("/s/sync.py"), "", true, false),
            catalog_row("Console", Path::new("/s/console.py"), "  ", false, true),
        ],
    );

    let entries = load_catalog_file(&path).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].runner, RunnerKind::Interpreter);
    assert_eq!(entries[0].effective_override(), Some(Path::new("/envs/b")));
    assert_eq!(entries[1].runner, RunnerKind::ExternalRunner);
    assert_eq!(entries[1].effective_override(), None);
    assert_eq!(entries[2].runner, RunnerKind::InteractiveShell);
    assert_eq!(entries[2].effective_override(), None);

    let sync = find_entry(&entries, "SYNC").unwrap();
    assert_eq!(sync.path, Path::new("/s/sync.py"));
}

#[test]
fn yaml_catalog_loads() {
    let dir = temp_dir("catalog-yaml");
    let path = write_script(
        &dir,
        "scripts.yaml",
        "- name: report\n  path: /s/report.py\n  use_uv_run: true\n\
         - Name: Tool\n  Path: /s/tool.exe\n",
    );
    let entries = load_catalog_file(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].runner, RunnerKind::ExternalRunner);
    assert_eq!(entries[1].name, "Tool");
    assert_eq!(entries[1].extension().as_deref(), Some("exe"));
}

#[test]
fn malformed_catalog_is_a_config_error() {
    let dir = temp_dir("catalog-bad");
    let path = write_script(&dir, "scripts.json", "{ not json");
    let err = load_catalog_file(&path).unwrap_err();
    assert_eq!(err.code, ErrorCode::Config);

    let err = load_catalog_file(&dir.join("missing.json")).unwrap_err();
    assert_eq!(err.code, ErrorCode::Config);
}
