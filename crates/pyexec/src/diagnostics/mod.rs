//! Diagnostics probe.
//!
//! Runs a bundled introspection script (never the user's script) with the same
//! interpreter and environment a real launch would use, and reports both the
//! configured and the actually resolved environment so that mismatches show up.

use crate::config::Settings;
use crate::environment::ResolvedEnvironment;
use crate::error::{ErrorCode, RunnerError, RunnerResult};
use crate::launch::overlay::STRIPPED_VARS;
use crate::launch::{interpreter_overlay, working_dir, Launcher};
use crate::model::{
    EnvOverlay, ErrorInfo, ExecutionMode, ExecutionRequest, ExecutionResult, RunId, RunStatus,
    RunnerKind, ScriptDescriptor, DIAGNOSTICS_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

pub const DIAGNOSTICS_SCRIPT_NAME: &str = "diagnostics.py";

const EMBEDDED_SCRIPT: &str = include_str!("../../assets/diagnostics.py");

/// Where the probed environment setting came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredSource {
    Specific,
    DefaultRoot,
    Unset,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProbeOutcome {
    Completed { exit_code: i32 },
    TimedOut,
    FailedToStart,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub program: String,
    pub script: PathBuf,
    pub method: String,
    pub working_dir: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub configured_source: ConfiguredSource,
    pub configured_path: Option<PathBuf>,
    pub resolved: Option<ResolvedEnvironment>,
    pub env_preview: Vec<String>,
    pub diagnostics_script: Option<PathBuf>,
    pub timeout_ms: u64,
    pub outcome: ProbeOutcome,
    pub output: Vec<String>,
    pub errors: Vec<String>,
    pub error: Option<ErrorInfo>,
}

impl DiagnosticsReport {
    pub fn timed_out(&self) -> bool {
        self.outcome == ProbeOutcome::TimedOut
    }

    /// Human-readable, sectioned text.
    pub fn render(&self) -> String {
        let mut out = vec![
            "--- Pre-Execution Environment Setup ---".to_string(),
            format!("Selected Program: {}", self.program),
            format!("Target Script: {}", self.script.display()),
            format!("Execution Method: {}", self.method),
            format!("Working Directory: {}", self.working_dir.display()),
            format!("Python Executable: {}", display_or(self.interpreter.as_deref(), "(not found)")),
        ];
        let source = match self.configured_source {
            ConfiguredSource::Specific => "(Specific)",
            ConfiguredSource::DefaultRoot => "(Default Root)",
            ConfiguredSource::Unset => "",
        };
        let configured = format!(
            "Source Venv Path: {} {source}",
            display_or(self.configured_path.as_deref(), "(Not Set)")
        );
        out.push(configured.trim_end().to_string());
        match &self.resolved {
            Some(env) => out.push(format!(
                "Resolved Venv: {} [{}]",
                env.root.display(),
                env.source
            )),
            None => out.push("Resolved Venv: (not found)".to_string()),
        }
        if !self.env_preview.is_empty() {
            out.push("--- Environment Variables Set for Process ---".to_string());
            out.extend(self.env_preview.iter().cloned());
        }

        out.push(String::new());
        out.push("--- Running Diagnostics Script ---".to_string());
        out.push(format!(
            "Diagnostics Script: {}",
            display_or(self.diagnostics_script.as_deref(), "(unavailable)")
        ));
        match &self.outcome {
            ProbeOutcome::TimedOut => out.push(format!(
                "--- Diagnostics Script Timed Out ({} seconds) ---",
                self.timeout_ms / 1000
            )),
            ProbeOutcome::Completed { exit_code } if *exit_code != 0 => out.push(format!(
                "--- Diagnostics Script Finished with Exit Code: {exit_code} ---"
            )),
            ProbeOutcome::Completed { .. } => {}
            ProbeOutcome::FailedToStart => {
                out.push("--- Error Running Diagnostics Script ---".to_string());
            }
        }
        if let Some(error) = &self.error {
            out.push(format!("{}: {}", error.code, error.message));
        }
        if !self.output.is_empty() {
            out.push(String::new());
            out.push("--- Diagnostics Script Output ---".to_string());
            out.extend(self.output.iter().cloned());
        }
        if !self.errors.is_empty() {
            out.push(String::new());
            out.push("--- Diagnostics Script Error Output ---".to_string());
            out.extend(self.errors.iter().cloned());
        }
        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}

fn display_or(path: Option<&Path>, fallback: &str) -> String {
    path.map_or_else(|| fallback.to_string(), |p| p.display().to_string())
}

/// Runs the bundled diagnostics script against a descriptor's environment.
#[derive(Clone, Debug)]
pub struct Probe {
    launcher: Launcher,
    script: Option<PathBuf>,
    timeout: Duration,
}

impl Probe {
    pub fn new(settings: &Settings) -> Self {
        Self {
            launcher: Launcher::from_settings(settings),
            script: None,
            timeout: DIAGNOSTICS_TIMEOUT,
        }
    }

    /// Use `script` instead of the bundled diagnostics script.
    #[must_use]
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self, descriptor: &ScriptDescriptor) -> DiagnosticsReport {
        let (mut report, prepared) = self.prepare(descriptor);
        if let Some((request, _script)) = prepared {
            let result = self.launcher.launch(request).wait().await;
            absorb(&mut report, result);
        }
        report
    }

    /// Blocking variant of [`run`](Self::run); must not be called from inside a runtime.
    pub fn run_blocking(&self, descriptor: &ScriptDescriptor) -> DiagnosticsReport {
        let (mut report, prepared) = self.prepare(descriptor);
        if let Some((request, _script)) = prepared {
            let result = self.launcher.launch_sync(request, self.timeout);
            absorb(&mut report, result);
        }
        report
    }

    fn prepare(&self, descriptor: &ScriptDescriptor) -> (DiagnosticsReport, Option<Prepared>) {
        let resolution = self.launcher.resolve(descriptor);
        let layout = self.launcher.layout();
        let (configured_source, configured_path) = match descriptor.effective_override() {
            Some(path) => (ConfiguredSource::Specific, Some(path.to_path_buf())),
            None => match self.launcher.default_root() {
                Some(root) => (ConfiguredSource::DefaultRoot, Some(root.to_path_buf())),
                None => (ConfiguredSource::Unset, None),
            },
        };
        let resolved = resolution.found().cloned();
        let interpreter = resolved.as_ref().and_then(|env| env.interpreter(layout));
        let use_runner = descriptor.runner == RunnerKind::ExternalRunner && interpreter.is_none();

        let mut report = DiagnosticsReport {
            program: descriptor.name.clone(),
            script: descriptor.path.clone(),
            method: if descriptor.runner == RunnerKind::ExternalRunner {
                "uv run".to_string()
            } else {
                "python".to_string()
            },
            working_dir: working_dir(&descriptor.path),
            interpreter: interpreter.clone(),
            configured_source,
            configured_path,
            resolved: resolved.clone(),
            env_preview: Vec::new(),
            diagnostics_script: None,
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            outcome: ProbeOutcome::FailedToStart,
            output: Vec::new(),
            errors: Vec::new(),
            error: None,
        };

        let target = match (resolved.as_ref(), interpreter) {
            (Some(env), Some(interpreter)) => {
                let overlay = interpreter_overlay(env, layout);
                report.env_preview = preview(&overlay, &env.bin_dir(layout));
                (ExecutionMode::Interpreter, interpreter, overlay)
            }
            (_, None) if use_runner => {
                let mut overlay = EnvOverlay::default();
                overlay.remove = STRIPPED_VARS.iter().map(|v| (*v).to_string()).collect();
                overlay
                    .set
                    .insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
                let runner = self.launcher.runner_program();
                report.interpreter = Some(runner.clone());
                report.env_preview = preview(&overlay, Path::new(""));
                (ExecutionMode::ExternalRunner, runner, overlay)
            }
            _ => {
                let err = match resolution.into_result() {
                    Ok(env) => RunnerError::executable_not_found(
                        env.bin_dir(layout).join(&layout.interpreter),
                    ),
                    Err(err) => err,
                };
                return fail(report, &err);
            }
        };

        let script = match self.locate_script() {
            Ok(script) => script,
            Err(err) => return fail(report, &err),
        };
        let script_path = script.path().to_path_buf();
        report.diagnostics_script = Some(script_path.clone());

        let (mode, program, env) = target;
        let args = if mode == ExecutionMode::ExternalRunner {
            vec!["run".to_string(), script_path.display().to_string()]
        } else {
            vec![script_path.display().to_string()]
        };
        let request = ExecutionRequest {
            run_id: RunId::new(),
            name: format!("{} (diagnostics)", descriptor.name),
            mode,
            program,
            args,
            cwd: report.working_dir.clone(),
            environment: resolved.map(|env| env.root),
            env,
            timeout: self.timeout,
        };
        (report, Some((request, script)))
    }

    /// The configured script, the copy next to the executable, or a private
    /// copy of the embedded script.
    fn locate_script(&self) -> RunnerResult<ProbeScript> {
        if let Some(script) = &self.script {
            return if script.is_file() {
                Ok(ProbeScript::OnDisk(script.clone()))
            } else {
                Err(RunnerError::script_not_found(script))
            };
        }
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DIAGNOSTICS_SCRIPT_NAME)))
            .filter(|path| path.is_file());
        if let Some(path) = beside_exe {
            return Ok(ProbeScript::OnDisk(path));
        }
        write_embedded_script().map(ProbeScript::Embedded)
    }
}

/// The request plus the script file it runs; the file must outlive the run.
type Prepared = (ExecutionRequest, ProbeScript);

enum ProbeScript {
    OnDisk(PathBuf),
    /// Removed on drop.
    Embedded(NamedTempFile),
}

impl ProbeScript {
    fn path(&self) -> &Path {
        match self {
            Self::OnDisk(path) => path,
            Self::Embedded(file) => file.path(),
        }
    }
}

/// Write the embedded script to a fresh, owner-only temp file. The name is
/// random and the file is created exclusively, so nothing already in the temp
/// directory is followed or overwritten.
fn write_embedded_script() -> RunnerResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("pyexec-diagnostics-")
        .suffix(".py")
        .tempfile()
        .map_err(|err| RunnerError::io("failed to create diagnostics script", err))?;
    file.write_all(EMBEDDED_SCRIPT.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| RunnerError::io("failed to write diagnostics script", err))?;
    tracing::debug!(path = %file.path().display(), "materialised embedded diagnostics script");
    Ok(file)
}

fn fail(mut report: DiagnosticsReport, err: &RunnerError) -> (DiagnosticsReport, Option<Prepared>) {
    tracing::warn!(code = %err.code, "diagnostics not run: {}", err.message);
    report.outcome = ProbeOutcome::FailedToStart;
    report.error = Some(err.to_error_info());
    (report, None)
}

fn preview(overlay: &EnvOverlay, bin_dir: &Path) -> Vec<String> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    let mut lines: Vec<String> = overlay
        .set
        .iter()
        .map(|(key, value)| {
            if key == "PATH" {
                format!("PATH = {}{sep}[Original PATH]", bin_dir.display())
            } else {
                format!("{key} = {value}")
            }
        })
        .collect();
    if !overlay.remove.is_empty() {
        lines.push(format!("(removed) {}", overlay.remove.join(", ")));
    }
    lines
}

fn absorb(report: &mut DiagnosticsReport, result: ExecutionResult) {
    report.error = result.error.clone();
    match result.status {
        RunStatus::Completed => {
            report.outcome = ProbeOutcome::Completed {
                exit_code: result.exit_code.unwrap_or_default(),
            };
            report.output = result.output_lines().map(str::to_string).collect();
            report.errors = result.error_lines().map(str::to_string).collect();
        }
        // Partial output from a hung probe is not trusted.
        RunStatus::TimedOut => report.outcome = ProbeOutcome::TimedOut,
        RunStatus::Killed => {
            report.outcome = ProbeOutcome::FailedToStart;
            report.errors = result.error_lines().map(str::to_string).collect();
            if report.error.is_none() {
                report.error = Some(ErrorInfo {
                    code: ErrorCode::ProcessStartFailure,
                    message: "diagnostics script was terminated by a signal".to_string(),
                    context: None,
                });
            }
        }
        RunStatus::FailedToStart | RunStatus::Launched => {
            report.outcome = ProbeOutcome::FailedToStart;
        }
    }
}
