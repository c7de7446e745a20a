use crate::error::{ErrorCode, RunnerError};
use crate::model::RunId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Deadline for captured script runs.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Deadline for the diagnostics probe.
pub const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(15);

/// How a planned launch will be carried out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionMode {
    Interpreter,
    ExternalRunner,
    InteractiveShell,
    NativeBinary,
    /// A non-script file handed to the platform's default handler.
    Unknown { extension: String },
}

impl ExecutionMode {
    /// Captured modes have their output collected and their deadline enforced.
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Interpreter | Self::ExternalRunner)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Interpreter => "interpreter",
            Self::ExternalRunner => "external runner",
            Self::InteractiveShell => "interactive shell",
            Self::NativeBinary => "native binary",
            Self::Unknown { .. } => "default handler",
        }
    }
}

/// Environment changes layered over the inherited environment.
///
/// Removals are applied before sets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOverlay {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl EnvOverlay {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn apply(&self, command: &mut tokio::process::Command) {
        for key in &self.remove {
            command.env_remove(key);
        }
        for (key, value) in &self.set {
            command.env(key, value);
        }
    }

    /// Effective value of `key` for a child, given the parent's value.
    pub fn resolve_var(&self, key: &str, inherited: Option<String>) -> Option<String> {
        if let Some(value) = self.set.get(key) {
            return Some(value.clone());
        }
        if self.remove.iter().any(|k| k == key) {
            return None;
        }
        inherited
    }
}

/// A fully planned launch: everything the engine needs, nothing it must look up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub name: String,
    pub mode: ExecutionMode,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Resolved environment root, if any.
    pub environment: Option<PathBuf>,
    #[serde(default)]
    pub env: EnvOverlay,
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Output,
    Error,
}

/// One captured line, tagged with the stream it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: StreamKind,
    pub text: String,
    pub at_ms: u64,
}

impl LogLine {
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Output,
            text: text.into(),
            at_ms: unix_ms(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Error,
            text: text.into(),
            at_ms: unix_ms(),
        }
    }

    /// Display form: error lines carry an `ERROR: ` prefix.
    pub fn render(&self) -> String {
        match self.stream {
            StreamKind::Output => self.text.clone(),
            StreamKind::Error => format!("ERROR: {}", self.text),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Exited on its own; `exit_code` is set.
    Completed,
    /// Deadline hit; the process was terminated.
    TimedOut,
    /// Never started.
    FailedToStart,
    /// Ended by a signal without an exit code.
    Killed,
    /// Started and handed off; not tracked further.
    Launched,
}

/// Observable lifecycle of a launch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LaunchState {
    Created,
    Starting,
    Running { pid: Option<u32> },
    Finished { status: RunStatus },
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

/// Terminal record of one launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub name: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub environment: Option<String>,
    pub log: Vec<LogLine>,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub error: Option<ErrorInfo>,
}

impl ExecutionResult {
    /// Skeleton result for `request`; the engine fills in the outcome.
    pub fn for_request(request: &ExecutionRequest) -> Self {
        let now = unix_ms();
        Self {
            run_id: request.run_id,
            name: request.name.clone(),
            mode: request.mode.clone(),
            status: RunStatus::FailedToStart,
            exit_code: None,
            pid: None,
            command: request.program.display().to_string(),
            args: request.args.clone(),
            cwd: request.cwd.display().to_string(),
            environment: request.environment.as_ref().map(|p| p.display().to_string()),
            log: Vec::new(),
            started_at_ms: now,
            ended_at_ms: now,
            error: None,
        }
    }

    /// Result for a launch that could not even be planned.
    pub fn not_started(name: &str, path: &std::path::Path, mode: ExecutionMode, err: &RunnerError) -> Self {
        let now = unix_ms();
        Self {
            run_id: RunId::new(),
            name: name.to_string(),
            mode,
            status: RunStatus::FailedToStart,
            exit_code: None,
            pid: None,
            command: path.display().to_string(),
            args: Vec::new(),
            cwd: String::new(),
            environment: None,
            log: Vec::new(),
            started_at_ms: now,
            ended_at_ms: now,
            error: Some(err.to_error_info()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Launched
            || (self.status == RunStatus::Completed && self.exit_code == Some(0))
    }

    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.log
            .iter()
            .filter(|line| line.stream == StreamKind::Output)
            .map(|line| line.text.as_str())
    }

    pub fn error_lines(&self) -> impl Iterator<Item = &str> {
        self.log
            .iter()
            .filter(|line| line.stream == StreamKind::Error)
            .map(|line| line.text.as_str())
    }
}

pub fn unix_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_removal_then_set() {
        let mut overlay = EnvOverlay::default();
        overlay.remove.push("PYTHONHOME".into());
        overlay.set.insert("VIRTUAL_ENV".into(), "/env".into());
        assert_eq!(overlay.resolve_var("PYTHONHOME", Some("/x".into())), None);
        assert_eq!(overlay.resolve_var("VIRTUAL_ENV", None), Some("/env".into()));
        assert_eq!(overlay.resolve_var("HOME", Some("/h".into())), Some("/h".into()));
    }

    #[test]
    fn error_lines_render_with_prefix() {
        assert_eq!(LogLine::error("boom").render(), "ERROR: boom");
        assert_eq!(LogLine::output("ok").render(), "ok");
    }

    #[test]
    fn only_interpreter_and_runner_are_captured() {
        assert!(ExecutionMode::Interpreter.is_captured());
        assert!(ExecutionMode::ExternalRunner.is_captured());
        assert!(!ExecutionMode::InteractiveShell.is_captured());
        assert!(!ExecutionMode::NativeBinary.is_captured());
        assert!(!ExecutionMode::Unknown { extension: "txt".into() }.is_captured());
    }
}
