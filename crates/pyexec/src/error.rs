//! Error taxonomy shared by every pyexec subsystem.
//!
//! All fallible library operations return [`RunnerError`]: a stable
//! [`ErrorCode`], a human-readable message and optional JSON context. Launch
//! failures are additionally folded into [`ExecutionResult`](crate::model::ExecutionResult)
//! as an [`ErrorInfo`](crate::model::ErrorInfo) so a bad launch never escapes as an `Err`.

use crate::model::ErrorInfo;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Stable error codes. The string form (`E_*`) is part of the JSON output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No interpreter environment could be resolved for the script.
    #[serde(rename = "E_ENVIRONMENT_NOT_FOUND")]
    EnvironmentNotFound,
    /// The interpreter, runner tool or other target binary is missing.
    #[serde(rename = "E_EXECUTABLE_NOT_FOUND")]
    ExecutableNotFound,
    /// The script file itself does not exist.
    #[serde(rename = "E_SCRIPT_NOT_FOUND")]
    ScriptNotFound,
    /// The OS refused to spawn the process.
    #[serde(rename = "E_PROCESS_START")]
    ProcessStartFailure,
    /// The process outlived its deadline and was terminated.
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    /// The file type is not runnable without explicit confirmation.
    #[serde(rename = "E_UNSUPPORTED_EXTENSION")]
    UnsupportedExtension,
    /// A running instance exists but could not be brought to the foreground.
    #[serde(rename = "E_ACTIVATION_FAILED")]
    ActivationFailure,
    /// The single-instance lock could not be created or inspected.
    #[serde(rename = "E_LOCK")]
    Lock,
    /// Settings or catalog files are missing or malformed.
    #[serde(rename = "E_CONFIG")]
    Config,
    /// Generic I/O failure.
    #[serde(rename = "E_IO")]
    Io,
    /// Invariant violated inside pyexec itself.
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnvironmentNotFound => "E_ENVIRONMENT_NOT_FOUND",
            Self::ExecutableNotFound => "E_EXECUTABLE_NOT_FOUND",
            Self::ScriptNotFound => "E_SCRIPT_NOT_FOUND",
            Self::ProcessStartFailure => "E_PROCESS_START",
            Self::Timeout => "E_TIMEOUT",
            Self::UnsupportedExtension => "E_UNSUPPORTED_EXTENSION",
            Self::ActivationFailure => "E_ACTIVATION_FAILED",
            Self::Lock => "E_LOCK",
            Self::Config => "E_CONFIG",
            Self::Io => "E_IO",
            Self::Internal => "E_INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RunnerError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl RunnerError {
    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn environment_not_found(
        override_path: Option<&Path>,
        default_root: Option<&Path>,
    ) -> Self {
        Self::new(
            ErrorCode::EnvironmentNotFound,
            "no valid Python virtual environment could be resolved",
            serde_json::json!({
                "override": override_path.map(|p| p.display().to_string()),
                "default_root": default_root.map(|p| p.display().to_string()),
                "fix": "point the script or the default root at a folder containing a virtual environment",
            }),
        )
    }

    pub fn executable_not_found(program: impl AsRef<Path>) -> Self {
        let program = program.as_ref();
        Self::new(
            ErrorCode::ExecutableNotFound,
            format!("executable '{}' could not be found", program.display()),
            serde_json::json!({
                "program": program.display().to_string(),
                "fix": "install it or make sure its folder is on PATH",
            }),
        )
    }

    pub fn script_not_found(path: &Path) -> Self {
        Self::new(
            ErrorCode::ScriptNotFound,
            format!("script file not found: {}", path.display()),
            serde_json::json!({ "path": path.display().to_string() }),
        )
    }

    pub fn start_failure(program: impl AsRef<Path>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ProcessStartFailure,
            format!("failed to start '{}'", program.as_ref().display()),
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            "process did not exit before its deadline and was terminated",
            serde_json::json!({ "timeout_ms": u64::try_from(limit.as_millis()).unwrap_or(u64::MAX) }),
        )
    }

    pub fn unsupported_extension(path: &Path, extension: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedExtension,
            format!("unsupported file type '{extension}'; confirmation required to open it with the default handler"),
            serde_json::json!({ "path": path.display().to_string(), "extension": extension }),
        )
    }

    pub fn activation_failure(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::ActivationFailure, message, context)
    }

    pub fn lock(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Lock,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn config(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Config,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl Diagnostic for RunnerError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let fix = self.context.as_ref()?.get("fix")?.as_str()?;
        Some(Box::new(fix.to_string()))
    }
}
