use crate::error::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a Python script should be run.
///
/// The catalog stores this as two booleans; folding them into one enum makes the
/// "both set" state unrepresentable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// Run the resolved environment's interpreter directly, output captured.
    #[default]
    Interpreter,
    /// Delegate to the external runner tool (`uv run`), output captured.
    ExternalRunner,
    /// Open a visible shell with the environment activated and leave it open.
    InteractiveShell,
}

/// One runnable catalog entry. Read-only from the launcher's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub name: String,
    pub path: PathBuf,
    /// Explicit environment folder. Takes precedence over the default root.
    pub environment_override: Option<PathBuf>,
    pub runner: RunnerKind,
}

impl ScriptDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            environment_override: None,
            runner: RunnerKind::Interpreter,
        }
    }

    /// Descriptor named after the file stem of `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self::new(name, path)
    }

    #[must_use]
    pub fn with_override(mut self, root: impl Into<PathBuf>) -> Self {
        self.environment_override = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    /// Flag-style setter: enabling the external runner clears the interactive shell.
    pub fn set_external_runner(&mut self, enabled: bool) {
        if enabled {
            self.runner = RunnerKind::ExternalRunner;
        } else if self.runner == RunnerKind::ExternalRunner {
            self.runner = RunnerKind::Interpreter;
        }
    }

    /// Flag-style setter: enabling the interactive shell clears the external runner.
    pub fn set_interactive_shell(&mut self, enabled: bool) {
        if enabled {
            self.runner = RunnerKind::InteractiveShell;
        } else if self.runner == RunnerKind::InteractiveShell {
            self.runner = RunnerKind::Interpreter;
        }
    }

    /// The override, ignoring empty or whitespace-only paths.
    pub fn effective_override(&self) -> Option<&Path> {
        self.environment_override
            .as_deref()
            .filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
    }

    /// Lower-cased file extension, without the dot.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }
}

fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// =============================================================================
// Catalog Serde Compatibility Layer
// =============================================================================

/// On-disk catalog entry. Field names follow the catalog file written by the
/// desktop launcher (PascalCase); snake_case spellings are accepted too.
#[derive(Deserialize, Serialize)]
struct CatalogEntry {
    #[serde(rename = "Name", alias = "name", default)]
    name: String,
    #[serde(rename = "Path", alias = "path")]
    path: PathBuf,
    #[serde(
        rename = "VirtualEnvPath",
        alias = "virtual_env_path",
        alias = "environment_override",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    virtual_env_path: Option<String>,
    #[serde(rename = "UseUvRun", alias = "use_uv_run", default)]
    use_uv_run: bool,
    #[serde(rename = "RunInCmd", alias = "run_in_cmd", default)]
    run_in_cmd: bool,
}

impl From<CatalogEntry> for ScriptDescriptor {
    fn from(entry: CatalogEntry) -> Self {
        // Both flags set: the external runner wins.
        let runner = if entry.use_uv_run {
            RunnerKind::ExternalRunner
        } else if entry.run_in_cmd {
            RunnerKind::InteractiveShell
        } else {
            RunnerKind::Interpreter
        };
        let name = if entry.name.trim().is_empty() {
            display_name(&entry.path)
        } else {
            entry.name
        };
        let environment_override = entry
            .virtual_env_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self {
            name,
            path: entry.path,
            environment_override,
            runner,
        }
    }
}

impl From<ScriptDescriptor> for CatalogEntry {
    fn from(descriptor: ScriptDescriptor) -> Self {
        Self {
            name: descriptor.name,
            path: descriptor.path,
            virtual_env_path: descriptor
                .environment_override
                .map(|p| p.display().to_string()),
            use_uv_run: descriptor.runner == RunnerKind::ExternalRunner,
            run_in_cmd: descriptor.runner == RunnerKind::InteractiveShell,
        }
    }
}

impl Serialize for ScriptDescriptor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        CatalogEntry::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScriptDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        CatalogEntry::deserialize(deserializer).map(ScriptDescriptor::from)
    }
}

/// Read a catalog file (JSON array, or YAML for `.yaml`/`.yml`).
pub fn load_catalog_file(path: &Path) -> RunnerResult<Vec<ScriptDescriptor>> {
    let data = fs::read_to_string(path)
        .map_err(|err| RunnerError::config("failed to read catalog file", err))?;
    if is_yaml(path) {
        serde_yml::from_str(&data)
            .map_err(|err| RunnerError::config("failed to parse catalog yaml", err))
    } else {
        serde_json::from_str(&data)
            .map_err(|err| RunnerError::config("failed to parse catalog json", err))
    }
}

/// Look an entry up by name: exact match first, then case-insensitive.
pub fn find_entry<'a>(entries: &'a [ScriptDescriptor], name: &str) -> Option<&'a ScriptDescriptor> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .or_else(|| {
            entries
                .iter()
                .find(|entry| entry.name.eq_ignore_ascii_case(name))
        })
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}
