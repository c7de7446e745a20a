//! Environment resolution.
//!
//! Decides which virtual environment folder applies to a script. Resolution is a
//! pure function of the descriptor, the configured default root and the current
//! filesystem; nothing is cached, so a folder created or deleted between two
//! launches is picked up by the second one.

use crate::error::{RunnerError, RunnerResult};
use crate::model::ScriptDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Conventional environment folder names tried under the default root, in order.
pub const CONVENTIONAL_FOLDERS: [&str; 4] = [".venv", "env", ".env", "virtualenv"];

/// Names of the well-known files inside an environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterLayout {
    /// Binaries subfolder whose presence marks an environment root.
    pub bin_dir: String,
    pub interpreter: String,
    /// Used when `interpreter` is missing.
    pub alternate_interpreter: String,
    pub activate_script: String,
}

impl InterpreterLayout {
    pub fn windows() -> Self {
        Self {
            bin_dir: "Scripts".to_string(),
            interpreter: "python.exe".to_string(),
            alternate_interpreter: "pythonw.exe".to_string(),
            activate_script: "activate.bat".to_string(),
        }
    }

    pub fn posix() -> Self {
        Self {
            bin_dir: "bin".to_string(),
            interpreter: "python".to_string(),
            alternate_interpreter: "python3".to_string(),
            activate_script: "activate".to_string(),
        }
    }

    /// Layout of environments created on the host platform.
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::posix()
        }
    }
}

impl Default for InterpreterLayout {
    fn default() -> Self {
        Self::native()
    }
}

/// Which resolution rule produced the environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "folder")]
pub enum EnvironmentSource {
    /// The override folder is itself an environment.
    Override,
    /// `<override>/venv`.
    OverrideVenv,
    DefaultRoot,
    /// `<default root>/venv`.
    DefaultRootVenv,
    /// One of the conventional folder names under the default root.
    Convention(String),
}

impl fmt::Display for EnvironmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override => f.write_str("override"),
            Self::OverrideVenv => f.write_str("override/venv"),
            Self::DefaultRoot => f.write_str("default root"),
            Self::DefaultRootVenv => f.write_str("default root/venv"),
            Self::Convention(name) => write!(f, "default root/{name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEnvironment {
    pub root: PathBuf,
    pub source: EnvironmentSource,
}

impl ResolvedEnvironment {
    pub fn bin_dir(&self, layout: &InterpreterLayout) -> PathBuf {
        self.root.join(&layout.bin_dir)
    }

    /// Primary interpreter, or the alternate variant when the primary is missing.
    pub fn interpreter(&self, layout: &InterpreterLayout) -> Option<PathBuf> {
        let bin = self.bin_dir(layout);
        [&layout.interpreter, &layout.alternate_interpreter]
            .into_iter()
            .map(|name| bin.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn activate_script(&self, layout: &InterpreterLayout) -> Option<PathBuf> {
        Some(self.bin_dir(layout).join(&layout.activate_script)).filter(|p| p.is_file())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Resolution {
    Found(ResolvedEnvironment),
    NotFound {
        override_path: Option<PathBuf>,
        default_root: Option<PathBuf>,
    },
}

impl Resolution {
    pub fn found(&self) -> Option<&ResolvedEnvironment> {
        match self {
            Self::Found(env) => Some(env),
            Self::NotFound { .. } => None,
        }
    }

    pub fn into_result(self) -> RunnerResult<ResolvedEnvironment> {
        match self {
            Self::Found(env) => Ok(env),
            Self::NotFound {
                override_path,
                default_root,
            } => Err(RunnerError::environment_not_found(
                override_path.as_deref(),
                default_root.as_deref(),
            )),
        }
    }
}

/// Resolve the environment for `descriptor`.
///
/// The override, when set, is the only root probed: a broken override never
/// falls back to the default root. Conventional folder names are only tried
/// under the default root.
pub fn resolve(
    descriptor: &ScriptDescriptor,
    default_root: Option<&Path>,
    layout: &InterpreterLayout,
) -> Resolution {
    let override_path = descriptor.effective_override();
    let not_found = || Resolution::NotFound {
        override_path: override_path.map(Path::to_path_buf),
        default_root: default_root.map(Path::to_path_buf),
    };

    let (root, is_default) = match (override_path, default_root) {
        (Some(root), _) => (root, false),
        (None, Some(root)) => (root, true),
        (None, None) => {
            tracing::debug!(script = %descriptor.name, "no override and no default root");
            return not_found();
        }
    };

    match probe_root(root, is_default, layout) {
        Some(env) => {
            tracing::debug!(
                script = %descriptor.name,
                root = %env.root.display(),
                rule = %env.source,
                "environment resolved"
            );
            Resolution::Found(env)
        }
        None => {
            tracing::debug!(script = %descriptor.name, root = %root.display(), "environment not found");
            not_found()
        }
    }
}

fn probe_root(root: &Path, is_default: bool, layout: &InterpreterLayout) -> Option<ResolvedEnvironment> {
    if !root.is_dir() {
        return None;
    }
    let has_bin = |dir: &Path| dir.join(&layout.bin_dir).is_dir();
    let found = |root: PathBuf, source| Some(ResolvedEnvironment { root, source });

    if has_bin(root) {
        let source = if is_default {
            EnvironmentSource::DefaultRoot
        } else {
            EnvironmentSource::Override
        };
        return found(root.to_path_buf(), source);
    }
    let nested = root.join("venv");
    if has_bin(&nested) {
        let source = if is_default {
            EnvironmentSource::DefaultRootVenv
        } else {
            EnvironmentSource::OverrideVenv
        };
        return found(nested, source);
    }
    if !is_default {
        return None;
    }
    CONVENTIONAL_FOLDERS.iter().find_map(|name| {
        let candidate = root.join(name);
        if has_bin(&candidate) {
            found(candidate, EnvironmentSource::Convention((*name).to_string()))
        } else {
            None
        }
    })
}

/// Path equality as the host filesystem sees it: case-insensitive on Windows
/// and macOS, exact elsewhere. Trailing separators are ignored.
pub fn same_path(a: &Path, b: &Path) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if cfg!(any(windows, target_os = "macos")) {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy();
    let text = if cfg!(windows) {
        text.replace('/', "\\")
    } else {
        text.into_owned()
    };
    let trimmed = text.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        text
    } else {
        trimmed.to_string()
    }
}

/// Verdict on a candidate environment override chosen by a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "path")]
pub enum OverrideAssessment {
    /// The candidate is the default root: clear the override instead.
    ResetToDefault,
    /// The candidate contains an environment.
    Valid(PathBuf),
    /// The candidate contains no environment; store it only if the user insists.
    RequiresAcknowledgement(PathBuf),
}

impl OverrideAssessment {
    /// The override to store (`None` clears it).
    ///
    /// An unresolved candidate is only accepted when `acknowledged` is set.
    pub fn accept(self, acknowledged: bool) -> RunnerResult<Option<PathBuf>> {
        match self {
            Self::ResetToDefault => Ok(None),
            Self::Valid(path) => Ok(Some(path)),
            Self::RequiresAcknowledgement(path) if acknowledged => {
                tracing::warn!(path = %path.display(), "storing override without a detectable environment");
                Ok(Some(path))
            }
            Self::RequiresAcknowledgement(path) => {
                Err(RunnerError::environment_not_found(Some(&path), None))
            }
        }
    }
}

pub fn assess_override(
    candidate: &Path,
    default_root: Option<&Path>,
    layout: &InterpreterLayout,
) -> OverrideAssessment {
    if default_root.is_some_and(|root| same_path(root, candidate)) {
        return OverrideAssessment::ResetToDefault;
    }
    if probe_root(candidate, false, layout).is_some() {
        OverrideAssessment::Valid(candidate.to_path_buf())
    } else {
        OverrideAssessment::RequiresAcknowledgement(candidate.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_ignores_trailing_separator() {
        assert!(same_path(Path::new("/envs/a/"), Path::new("/envs/a")));
        assert!(!same_path(Path::new("/envs/a"), Path::new("/envs/b")));
        assert!(same_path(Path::new("/"), Path::new("/")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn same_path_is_case_sensitive_on_linux() {
        assert!(!same_path(Path::new("/Envs"), Path::new("/envs")));
    }

    #[test]
    fn source_display_names_the_rule() {
        assert_eq!(EnvironmentSource::Convention(".venv".into()).to_string(), "default root/.venv");
        assert_eq!(EnvironmentSource::OverrideVenv.to_string(), "override/venv");
    }

    #[test]
    fn unacknowledged_candidate_is_rejected() {
        let verdict = OverrideAssessment::RequiresAcknowledgement(PathBuf::from("/x"));
        assert!(verdict.clone().accept(false).is_err());
        assert!(matches!(verdict.accept(true), Ok(Some(_))));
        assert!(matches!(OverrideAssessment::ResetToDefault.accept(false), Ok(None)));
    }
}
