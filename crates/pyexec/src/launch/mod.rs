//! Process launch engine.
//!
//! [`Launcher::plan`] turns a [`ScriptDescriptor`] into a fully resolved
//! [`ExecutionRequest`]; [`Launcher::launch`] runs it on a tokio task and hands
//! back a [`LaunchHandle`] immediately. Every launch is independent: its own
//! child, its own readers, its own deadline.

mod engine;
pub mod overlay;
pub mod shell;

pub use engine::READER_GRACE;
pub use overlay::{interpreter_overlay, interpreter_overlay_with_path};
pub use shell::{shell_command, ShellCommand, ShellFlavor};

use crate::config::Settings;
use crate::environment::{resolve, InterpreterLayout, ResolvedEnvironment, Resolution};
use crate::error::{RunnerError, RunnerResult};
use crate::model::{
    EnvOverlay, ExecutionMode, ExecutionRequest, ExecutionResult, LaunchState, RunId, RunStatus,
    RunnerKind, ScriptDescriptor, SCRIPT_TIMEOUT,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

/// What kind of file a script path points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    /// `.py` or `.pyw`.
    Python,
    /// `.exe`, or an extensionless executable file on Unix.
    Native,
    /// Anything else; carries the lower-cased extension (empty if none).
    Other(String),
}

pub fn classify(path: &Path) -> ScriptKind {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    match extension.as_deref() {
        Some("py" | "pyw") => ScriptKind::Python,
        Some("exe") => ScriptKind::Native,
        None if is_executable(path) => ScriptKind::Native,
        other => ScriptKind::Other(other.unwrap_or_default().to_string()),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Mode a descriptor would run in, used to label results that never got planned.
pub fn expected_mode(descriptor: &ScriptDescriptor) -> ExecutionMode {
    match classify(&descriptor.path) {
        ScriptKind::Python => match descriptor.runner {
            RunnerKind::Interpreter => ExecutionMode::Interpreter,
            RunnerKind::ExternalRunner => ExecutionMode::ExternalRunner,
            RunnerKind::InteractiveShell => ExecutionMode::InteractiveShell,
        },
        ScriptKind::Native => ExecutionMode::NativeBinary,
        ScriptKind::Other(extension) => ExecutionMode::Unknown { extension },
    }
}

/// Handle to a launch in flight.
pub struct LaunchHandle {
    run_id: RunId,
    state: watch::Receiver<LaunchState>,
    inner: HandleInner,
}

enum HandleInner {
    Spawned {
        task: JoinHandle<ExecutionResult>,
        fallback: Box<ExecutionResult>,
    },
    Ready(Box<ExecutionResult>),
}

impl LaunchHandle {
    fn ready(result: ExecutionResult) -> Self {
        let (_tx, state) = watch::channel(LaunchState::Finished {
            status: result.status,
        });
        Self {
            run_id: result.run_id,
            state,
            inner: HandleInner::Ready(Box::new(result)),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Receiver of lifecycle updates; clone it to observe from elsewhere.
    pub fn state(&self) -> watch::Receiver<LaunchState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> LaunchState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            HandleInner::Spawned { task, .. } => task.is_finished(),
            HandleInner::Ready(_) => true,
        }
    }

    /// Wait for the terminal result. Never fails: a lost task is reported as
    /// an internal error in the result.
    pub async fn wait(self) -> ExecutionResult {
        match self.inner {
            HandleInner::Ready(result) => *result,
            HandleInner::Spawned { task, fallback } => match task.await {
                Ok(result) => result,
                Err(err) => task_lost(*fallback, &err),
            },
        }
    }
}

/// Result reported when the task driving a launch panicked or was cancelled.
fn task_lost(mut fallback: ExecutionResult, err: &JoinError) -> ExecutionResult {
    tracing::error!(run_id = %fallback.run_id, error = %err, "launch task failed");
    fallback.status = RunStatus::FailedToStart;
    fallback.error =
        Some(RunnerError::internal(format!("launch task failed: {err}")).to_error_info());
    fallback
}

/// Drive `run` on its own task and publish whatever it ends with, including a
/// synthetic failure when it panics, so completion listeners always hear back.
async fn supervise<F>(
    run: F,
    fallback: ExecutionResult,
    completions: Option<mpsc::UnboundedSender<ExecutionResult>>,
) -> ExecutionResult
where
    F: Future<Output = ExecutionResult> + Send + 'static,
{
    let result = match tokio::spawn(run).await {
        Ok(result) => result,
        Err(err) => task_lost(fallback, &err),
    };
    notify(completions.as_ref(), &result);
    result
}

/// Plans and runs launches.
#[derive(Clone, Debug)]
pub struct Launcher {
    default_root: Option<PathBuf>,
    runner_tool: String,
    terminal: Option<String>,
    layout: InterpreterLayout,
    completions: Option<mpsc::UnboundedSender<ExecutionResult>>,
}

impl Launcher {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_root: settings.default_root.clone(),
            runner_tool: settings.runner_tool.clone(),
            terminal: settings.terminal.clone(),
            layout: settings.layout.clone(),
            completions: None,
        }
    }

    /// Also deliver every terminal result on `tx`.
    #[must_use]
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<ExecutionResult>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn layout(&self) -> &InterpreterLayout {
        &self.layout
    }

    pub fn default_root(&self) -> Option<&Path> {
        self.default_root.as_deref()
    }

    /// The runner tool as found on `PATH`. An unresolvable tool is returned
    /// as configured so the spawn reports it as missing.
    pub fn runner_program(&self) -> PathBuf {
        which::which(&self.runner_tool).unwrap_or_else(|_| PathBuf::from(&self.runner_tool))
    }

    pub fn resolve(&self, descriptor: &ScriptDescriptor) -> Resolution {
        resolve(descriptor, self.default_root.as_deref(), &self.layout)
    }

    /// Build the request for `descriptor`.
    ///
    /// Files that are neither Python scripts nor native binaries need
    /// `confirm_unknown`; they are then opened with the platform's default handler.
    pub fn plan(
        &self,
        descriptor: &ScriptDescriptor,
        confirm_unknown: bool,
    ) -> RunnerResult<ExecutionRequest> {
        let script = &descriptor.path;
        if !script.is_file() {
            return Err(RunnerError::script_not_found(script));
        }
        let cwd = working_dir(script);
        let mut request = ExecutionRequest {
            run_id: RunId::new(),
            name: descriptor.name.clone(),
            mode: ExecutionMode::NativeBinary,
            program: script.clone(),
            args: Vec::new(),
            cwd,
            environment: None,
            env: EnvOverlay::default(),
            timeout: SCRIPT_TIMEOUT,
        };

        match classify(script) {
            ScriptKind::Python => match descriptor.runner {
                RunnerKind::Interpreter => self.plan_interpreter(descriptor, &mut request)?,
                RunnerKind::ExternalRunner => self.plan_external_runner(&mut request),
                RunnerKind::InteractiveShell => self.plan_shell(descriptor, &mut request),
            },
            ScriptKind::Native => {}
            ScriptKind::Other(extension) => {
                if !confirm_unknown {
                    return Err(RunnerError::unsupported_extension(script, &extension));
                }
                plan_default_handler(script, extension, &mut request)?;
            }
        }

        tracing::debug!(
            run_id = %request.run_id,
            name = %request.name,
            mode = request.mode.label(),
            program = %request.program.display(),
            cwd = %request.cwd.display(),
            "launch planned"
        );
        Ok(request)
    }

    fn plan_interpreter(
        &self,
        descriptor: &ScriptDescriptor,
        request: &mut ExecutionRequest,
    ) -> RunnerResult<()> {
        let env = self.resolve(descriptor).into_result()?;
        let interpreter = env.interpreter(&self.layout).ok_or_else(|| {
            RunnerError::executable_not_found(env.bin_dir(&self.layout).join(&self.layout.interpreter))
        })?;
        request.mode = ExecutionMode::Interpreter;
        request.program = interpreter;
        request.args = vec![descriptor.path.display().to_string()];
        request.env = interpreter_overlay(&env, &self.layout);
        request.environment = Some(env.root);
        Ok(())
    }

    fn plan_external_runner(&self, request: &mut ExecutionRequest) {
        let script = request.program.display().to_string();
        request.mode = ExecutionMode::ExternalRunner;
        request.program = self.runner_program();
        request.args = vec!["run".to_string(), script];
    }

    fn plan_shell(&self, descriptor: &ScriptDescriptor, request: &mut ExecutionRequest) {
        let env = self.resolve(descriptor).found().cloned();
        let activate = env.as_ref().and_then(|env| {
            let script = env.activate_script(&self.layout);
            if script.is_none() {
                tracing::warn!(
                    root = %env.root.display(),
                    "activation script not found; opening the shell without activating"
                );
            }
            script
        });
        let flavor = ShellFlavor::native(self.terminal.as_deref());
        let command = shell_command(&flavor, &request.cwd, activate.as_deref(), Some(&descriptor.path));
        request.mode = ExecutionMode::InteractiveShell;
        request.program = command.program;
        request.args = command.args;
        request.environment = env.map(|env| env.root);
    }

    /// Request that opens an interactive shell in `cwd` with `env` activated,
    /// without running any script.
    pub fn plan_environment_shell(
        &self,
        env: &ResolvedEnvironment,
        cwd: &Path,
    ) -> RunnerResult<ExecutionRequest> {
        let activate = env.activate_script(&self.layout).ok_or_else(|| {
            RunnerError::new(
                crate::ErrorCode::EnvironmentNotFound,
                "environment has no activation script",
                serde_json::json!({
                    "path": env.bin_dir(&self.layout).join(&self.layout.activate_script).display().to_string(),
                }),
            )
        })?;
        let flavor = ShellFlavor::native(self.terminal.as_deref());
        let command = shell_command(&flavor, cwd, Some(&activate), None);
        Ok(ExecutionRequest {
            run_id: RunId::new(),
            name: "shell".to_string(),
            mode: ExecutionMode::InteractiveShell,
            program: command.program,
            args: command.args,
            cwd: cwd.to_path_buf(),
            environment: Some(env.root.clone()),
            env: EnvOverlay::default(),
            timeout: SCRIPT_TIMEOUT,
        })
    }

    /// Start `request` on the current tokio runtime and return at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, request: ExecutionRequest) -> LaunchHandle {
        let run_id = request.run_id;
        let fallback = Box::new(ExecutionResult::for_request(&request));
        let (tx, state) = watch::channel(LaunchState::Created);
        let task = tokio::spawn(supervise(
            engine::execute(request, tx),
            (*fallback).clone(),
            self.completions.clone(),
        ));
        LaunchHandle {
            run_id,
            state,
            inner: HandleInner::Spawned { task, fallback },
        }
    }

    /// Plan and launch `descriptor`. Planning failures come back as an
    /// already-finished `FailedToStart` handle with an empty log.
    pub fn run_script(&self, descriptor: &ScriptDescriptor, confirm_unknown: bool) -> LaunchHandle {
        match self.plan(descriptor, confirm_unknown) {
            Ok(request) => self.launch(request),
            Err(err) => LaunchHandle::ready(self.plan_failure(descriptor, &err)),
        }
    }

    /// Terminal result for a descriptor that could not be planned.
    pub fn plan_failure(&self, descriptor: &ScriptDescriptor, err: &RunnerError) -> ExecutionResult {
        tracing::warn!(name = %descriptor.name, code = %err.code, "launch not started: {}", err.message);
        let result = ExecutionResult::not_started(
            &descriptor.name,
            &descriptor.path,
            expected_mode(descriptor),
            err,
        );
        notify(self.completions.as_ref(), &result);
        result
    }

    /// Run `request` to completion on a private current-thread runtime.
    ///
    /// Blocks the calling thread; must not be called from inside a runtime.
    pub fn launch_sync(&self, mut request: ExecutionRequest, timeout: Duration) -> ExecutionResult {
        request.timeout = timeout;
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let mut result = ExecutionResult::for_request(&request);
                result.error = Some(RunnerError::io("failed to build runtime", err).to_error_info());
                notify(self.completions.as_ref(), &result);
                return result;
            }
        };
        let (tx, _state) = watch::channel(LaunchState::Created);
        let result = runtime.block_on(engine::execute(request, tx));
        notify(self.completions.as_ref(), &result);
        result
    }
}

fn notify(completions: Option<&mpsc::UnboundedSender<ExecutionResult>>, result: &ExecutionResult) {
    if let Some(tx) = completions {
        if tx.send(result.clone()).is_err() {
            tracing::debug!(run_id = %result.run_id, "completion receiver dropped");
        }
    }
}

fn plan_default_handler(
    script: &Path,
    extension: String,
    request: &mut ExecutionRequest,
) -> RunnerResult<()> {
    let command = open::commands(script).into_iter().next().ok_or_else(|| {
        RunnerError::new(
            crate::ErrorCode::UnsupportedExtension,
            "no default handler is available on this platform",
            serde_json::json!({ "path": script.display().to_string() }),
        )
    })?;
    request.mode = ExecutionMode::Unknown { extension };
    request.program = PathBuf::from(command.get_program());
    request.args = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    Ok(())
}

/// The script's folder, or the current directory if it has none.
pub(crate) fn working_dir(script: &Path) -> PathBuf {
    match script.parent().filter(|dir| dir.is_dir()) {
        Some(dir) => dir.to_path_buf(),
        None => {
            let fallback = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            tracing::warn!(
                script = %script.display(),
                fallback = %fallback.display(),
                "script has no usable folder; using the current directory"
            );
            fallback
        }
    }
}
