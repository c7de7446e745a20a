// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Environment resolution against real folders.

use pyexec::environment::{
    assess_override, resolve, EnvironmentSource, InterpreterLayout, OverrideAssessment,
    Resolution,
};
use pyexec::{ErrorCode, ScriptDescriptor};
use pyexec_fixtures::{fake_environment, temp_dir, write_script};
use std::fs;
use std::path::Path;

fn layout() -> InterpreterLayout {
    InterpreterLayout::posix()
}

fn descriptor(root: &Path) -> ScriptDescriptor {
    ScriptDescriptor::from_path(root.join("scripts").join("job.py"))
}

fn found(resolution: &Resolution) -> (&Path, &EnvironmentSource) {
    match resolution {
        Resolution::Found(env) => (env.root.as_path(), &env.source),
        Resolution::NotFound { .. } => panic!("expected an environment, got {:?}", resolution),
    }
}

// =============================================================================
// Precedence
// =============================================================================

#[test]
fn override_wins_over_default_root() {
    let root = temp_dir("resolve-override");
    let default_root = fake_environment(&root.join("default"), "bin", "python");
    let own = fake_environment(&root.join("own"), "bin", "python");

    let d = descriptor(&root).with_override(&own);
    let resolution = resolve(&d, Some(default_root.as_path()), &layout());
    let (env, source) = found(&resolution);
    assert_eq!(env, own);
    assert_eq!(*source, EnvironmentSource::Override);
}

#[test]
fn broken_override_does_not_fall_back() {
    let root = temp_dir("resolve-broken");
    let default_root = fake_environment(&root.join("default"), "bin", "python");
    let empty = root.join("empty");
    fs::create_dir_all(&empty).unwrap();

    let d = descriptor(&root).with_override(&empty);
    match resolve(&d, Some(default_root.as_path()), &layout()) {
        Resolution::NotFound {
            override_path,
            default_root: reported,
        } => {
            assert_eq!(override_path.as_deref(), Some(empty.as_path()));
            assert_eq!(reported.as_deref(), Some(default_root.as_path()));
        }
        other => panic!("override must not fall back, got {:?}", other),
    }
}

#[test]
fn blank_override_means_default_root() {
    let root = temp_dir("resolve-blank");
    let default_root = fake_environment(&root.join("default"), "bin", "python");
    let d = descriptor(&root).with_override("   ");
    let resolution = resolve(&d, Some(default_root.as_path()), &layout());
    assert_eq!(*found(&resolution).1, EnvironmentSource::DefaultRoot);
}

#[test]
fn nested_venv_folder_is_found() {
    let root = temp_dir("resolve-nested");
    let project = root.join("project");
    fake_environment(&project.join("venv"), "bin", "python");

    let d = descriptor(&root).with_override(&project);
    let resolution = resolve(&d, None, &layout());
    let (env, source) = found(&resolution);
    assert_eq!(env, project.join("venv"));
    assert_eq!(*source, EnvironmentSource::OverrideVenv);
}

#[test]
fn venv_under_default_root_is_found() {
    let root = temp_dir("resolve-default-venv");
    let default_root = root.join("Venvs");
    fake_environment(&default_root.join("venv"), "bin", "python");

    let resolution = resolve(&descriptor(&root), Some(default_root.as_path()), &layout());
    let (env, source) = found(&resolution);
    assert_eq!(env, default_root.join("venv"));
    assert_eq!(*source, EnvironmentSource::DefaultRootVenv);
}

#[test]
fn conventional_folders_are_tried_in_order_under_default_root() {
    let root = temp_dir("resolve-convention");
    let default_root = root.join("envs");
    fake_environment(&default_root.join("env"), "bin", "python");
    fake_environment(&default_root.join("virtualenv"), "bin", "python");

    let resolution = resolve(&descriptor(&root), Some(default_root.as_path()), &layout());
    let (env, source) = found(&resolution);
    assert_eq!(env, default_root.join("env"));
    assert_eq!(*source, EnvironmentSource::Convention("env".to_string()));

    fake_environment(&default_root.join(".venv"), "bin", "python");
    let resolution = resolve(&descriptor(&root), Some(default_root.as_path()), &layout());
    assert_eq!(found(&resolution).0, default_root.join(".venv"));
}

#[test]
fn conventional_folders_are_not_tried_under_an_override() {
    let root = temp_dir("resolve-override-convention");
    let project = root.join("project");
    fake_environment(&project.join(".venv"), "bin", "python");

    let d = descriptor(&root).with_override(&project);
    assert!(resolve(&d, None, &layout()).found().is_none());
}

#[test]
fn nothing_configured_is_not_found() {
    let root = temp_dir("resolve-nothing");
    let err = resolve(&descriptor(&root), None, &layout())
        .into_result()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::EnvironmentNotFound);
}

#[test]
fn resolution_sees_folders_created_later() {
    let root = temp_dir("resolve-late");
    let default_root = root.join("envs");
    fs::create_dir_all(&default_root).unwrap();
    let d = descriptor(&root);
    assert!(resolve(&d, Some(default_root.as_path()), &layout()).found().is_none());

    fake_environment(&default_root, "bin", "python");
    assert!(resolve(&d, Some(default_root.as_path()), &layout()).found().is_some());
}

// =============================================================================
// Interpreter selection
// =============================================================================

#[test]
fn alternate_interpreter_is_used_when_primary_is_missing() {
    let root = temp_dir("resolve-alternate");
    let env_root = fake_environment(&root.join("env"), "bin", "python3");
    let d = descriptor(&root).with_override(&env_root);
    let resolution = resolve(&d, None, &layout());
    let env = resolution.found().unwrap();
    assert_eq!(
        env.interpreter(&layout()),
        Some(env_root.join("bin").join("python3"))
    );
}

#[test]
fn environment_without_interpreter_resolves_but_has_none() {
    let root = temp_dir("resolve-no-interpreter");
    let env_root = fake_environment(&root.join("env"), "bin", "");
    let d = descriptor(&root).with_override(&env_root);
    let resolution = resolve(&d, None, &layout());
    let env = resolution.found().unwrap();
    assert!(env.interpreter(&layout()).is_none());
    assert_eq!(
        env.activate_script(&layout()),
        Some(env_root.join("bin").join("activate"))
    );
}

// =============================================================================
// Override assessment
// =============================================================================

#[test]
fn choosing_the_default_root_clears_the_override() {
    let root = temp_dir("assess-default");
    let default_root = fake_environment(&root.join("envs"), "bin", "python");
    let candidate = root.join("envs").join("");
    let assessment = assess_override(&candidate, Some(default_root.as_path()), &layout());
    assert_eq!(assessment, OverrideAssessment::ResetToDefault);
    assert_eq!(assessment.accept(false).unwrap(), None);
}

#[test]
fn unresolved_override_needs_acknowledgement() {
    let root = temp_dir("assess-unresolved");
    let candidate = root.join("plain");
    fs::create_dir_all(&candidate).unwrap();
    write_script(&candidate, "readme.txt", "not an environment");

    let assessment = assess_override(&candidate, None, &layout());
    assert_eq!(
        assessment,
        OverrideAssessment::RequiresAcknowledgement(candidate.clone())
    );
    let err = assessment.clone().accept(false).unwrap_err();
    assert_eq!(err.code, ErrorCode::EnvironmentNotFound);
    assert_eq!(assessment.accept(true).unwrap(), Some(candidate));
}

#[test]
fn valid_override_is_stored() {
    let root = temp_dir("assess-valid");
    let env_root = fake_environment(&root.join("env"), "bin", "python");
    let assessment = assess_override(&env_root, None, &layout());
    assert_eq!(assessment.accept(false).unwrap(), Some(env_root));
}
