//! Launcher settings.
//!
//! Settings come from a JSON or YAML file (chosen by extension) with every field
//! optional. `PYEXEC_DEFAULT_ROOT` overrides the default environment root.

use crate::environment::InterpreterLayout;
use crate::error::{RunnerError, RunnerResult};
use crate::model::descriptor::is_yaml;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding [`Settings::default_root`].
pub const DEFAULT_ROOT_ENV: &str = "PYEXEC_DEFAULT_ROOT";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folder probed when a script has no environment override.
    pub default_root: Option<PathBuf>,
    /// External runner tool invoked as `<tool> run <script>`.
    pub runner_tool: String,
    /// Terminal emulator used for interactive-shell launches on Linux.
    pub terminal: Option<String>,
    pub layout: InterpreterLayout,
    pub instance: InstanceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_root: None,
            runner_tool: "uv".to_string(),
            terminal: None,
            layout: InterpreterLayout::native(),
            instance: InstanceSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    pub lock_name: String,
    /// Substring searched in window titles when looking for the running instance.
    pub window_title: String,
    /// Process name of the running instance; defaults to this executable's stem.
    pub process_name: Option<String>,
    pub lock_dir: Option<PathBuf>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            lock_name: "pyexec-single-instance".to_string(),
            window_title: "PyExec".to_string(),
            process_name: None,
            lock_dir: None,
        }
    }
}

impl InstanceSettings {
    pub fn effective_process_name(&self) -> String {
        self.process_name.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "pyexec".to_string())
        })
    }

    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(default_lock_dir)
    }
}

/// System-wide directory shared by every user session.
pub fn default_lock_dir() -> PathBuf {
    if cfg!(windows) {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    } else {
        PathBuf::from("/tmp")
    }
}

pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pyexec").join("settings.json"))
}

pub fn load_settings_file(path: &Path) -> RunnerResult<Settings> {
    let data = fs::read_to_string(path)
        .map_err(|err| RunnerError::config("failed to read settings file", err))?;
    if is_yaml(path) {
        serde_yml::from_str(&data)
            .map_err(|err| RunnerError::config("failed to parse settings yaml", err))
    } else {
        serde_json::from_str(&data)
            .map_err(|err| RunnerError::config("failed to parse settings json", err))
    }
}

/// Load settings from `explicit`, or the default location if it exists, then
/// apply environment overrides.
///
/// An explicit path that cannot be read is an error; a missing default file is not.
pub fn load_settings(explicit: Option<&Path>) -> RunnerResult<Settings> {
    let mut settings = match explicit {
        Some(path) => load_settings_file(path)?,
        None => match default_settings_path() {
            Some(path) if path.is_file() => load_settings_file(&path)?,
            _ => Settings::default(),
        },
    };
    if let Some(root) = std::env::var_os(DEFAULT_ROOT_ENV).filter(|v| !v.is_empty()) {
        settings.default_root = Some(PathBuf::from(root));
    }
    tracing::debug!(
        default_root = ?settings.default_root,
        runner_tool = %settings.runner_tool,
        "settings loaded"
    );
    Ok(settings)
}

/// Read the desktop launcher's `default_venv_root.json`: a single JSON string.
///
/// A stored root whose folder no longer exists is dropped.
pub fn load_default_root_file(path: &Path) -> RunnerResult<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .map_err(|err| RunnerError::config("failed to read default root file", err))?;
    let stored: Option<String> = serde_json::from_str(&data)
        .map_err(|err| RunnerError::config("failed to parse default root file", err))?;
    let Some(stored) = stored.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let root = PathBuf::from(stored);
    if root.is_dir() {
        Ok(Some(root))
    } else {
        tracing::warn!(path = %root.display(), "stored default root no longer exists; ignoring it");
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        fs::write(&path, "runner_tool: uvx\ninstance:\n  window_title: Launcher\n").unwrap();
        let settings = load_settings_file(&path).unwrap();
        assert_eq!(settings.runner_tool, "uvx");
        assert_eq!(settings.instance.window_title, "Launcher");
        assert_eq!(settings.instance.lock_name, "pyexec-single-instance");
        assert_eq!(settings.layout, InterpreterLayout::native());
    }

    #[test]
    fn explicit_missing_file_is_config_error() {
        let err = load_settings(Some(Path::new("/nonexistent/pyexec.json"))).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::Config);
    }

    #[test]
    fn default_root_file_drops_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default_venv_root.json");
        fs::write(&path, "\"/definitely/not/here\"").unwrap();
        assert_eq!(load_default_root_file(&path).unwrap(), None);

        let json = serde_json::to_string(&dir.path().display().to_string()).unwrap();
        fs::write(&path, json).unwrap();
        assert_eq!(load_default_root_file(&path).unwrap(), Some(dir.path().to_path_buf()));
    }
}
