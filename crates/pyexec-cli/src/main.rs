//! PyExec CLI: run Python scripts inside their virtual environments.
//!
//! Command-line front end for the launcher, the diagnostics probe and the
//! single-instance session.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use pyexec::config::{load_default_root_file, load_settings, Settings};
use pyexec::diagnostics::{DiagnosticsReport, Probe, ProbeOutcome};
use pyexec::environment::{assess_override, OverrideAssessment, Resolution};
use pyexec::launch::{expected_mode, Launcher};
use pyexec::model::{
    find_entry, load_catalog_file, ExecutionMode, ExecutionResult, RunStatus, ScriptDescriptor,
};
use pyexec::{ErrorCode, RunnerError, RunnerResult};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod progress;
mod session;

pub(crate) const EXIT_INTERRUPTED: i32 = 130;

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(name = "pyexec", version, about = "Run Python scripts in their virtual environments")]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Increase log verbosity (-v info, -vv debug); `RUST_LOG` takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (JSON or YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Which script to act on and how its environment is chosen.
#[derive(Debug, Default, Args)]
struct TargetArgs {
    /// Script, program or file to launch
    script: Option<PathBuf>,
    /// Catalog file (JSON or YAML) holding script entries
    #[arg(long, requires = "entry")]
    catalog: Option<PathBuf>,
    /// Catalog entry name
    #[arg(long)]
    entry: Option<String>,
    /// Display name for the run
    #[arg(long)]
    name: Option<String>,
    /// Environment folder overriding the default root
    #[arg(long)]
    venv: Option<PathBuf>,
    /// Default environment root
    #[arg(long)]
    default_root: Option<PathBuf>,
    /// JSON file holding the default environment root as a single string
    #[arg(long, conflicts_with = "default_root")]
    default_root_file: Option<PathBuf>,
    /// Run through the external runner tool (`uv run`)
    #[arg(long, conflicts_with = "shell")]
    uv: bool,
    /// Open an interactive shell with the environment activated and run the script there
    #[arg(long)]
    shell: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch a script and wait for it
    Run {
        #[command(flatten)]
        target: TargetArgs,
        /// Open unknown file types with the default application without asking
        #[arg(long, short = 'y')]
        yes: bool,
        /// Deadline in seconds (default: 24 hours)
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Probe the environment a script would run in
    Info {
        #[command(flatten)]
        target: TargetArgs,
        /// Diagnostics script to run instead of the bundled one
        #[arg(long)]
        diagnostics_script: Option<PathBuf>,
        /// Deadline in seconds (default: 15)
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Show the environment a script resolves to, or assess an override folder
    Resolve {
        #[command(flatten)]
        target: TargetArgs,
        /// Assess this folder as an environment override instead
        #[arg(long)]
        assess: Option<PathBuf>,
        /// Accept an override folder that contains no detectable environment
        #[arg(long, requires = "assess")]
        accept_unresolved: bool,
        #[arg(long)]
        json: bool,
    },
    /// Open an interactive shell with an environment activated
    Shell {
        /// Environment folder (default: the default root)
        #[arg(long)]
        venv: Option<PathBuf>,
        #[arg(long)]
        default_root: Option<PathBuf>,
        /// Directory the shell starts in (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run as the single-instance launcher, reading JSON launch requests from stdin
    Session,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Configure color output based on CLI flag and environment
fn use_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            // Respect NO_COLOR environment variable
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                // Check if stderr supports color (where we output diagnostics)
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    }
}

fn configure_colors(color: bool) {
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(color)
                .unicode(color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
}

fn init_tracing(verbose: u8, color: bool) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(color)
                .with_target(false)
                .compact(),
        )
        .init();
}

/// Ctrl-C flips the returned flag.
fn install_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = tx.send(true);
    }) {
        tracing::warn!(error = %err, "failed to install Ctrl-C handler");
    }
    rx
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let color = use_color(cli.color);
    configure_colors(color);
    init_tracing(cli.verbose, color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    let interrupt = install_interrupt();
    let code = runtime.block_on(dispatch(cli, interrupt))?;
    // Shutting down drops any child still attached to a launch task. A blocked
    // stdin reader would otherwise hold the shutdown forever.
    runtime.shutdown_timeout(Duration::from_millis(500));
    std::process::exit(code);
}

async fn dispatch(cli: Cli, interrupt: watch::Receiver<bool>) -> Result<i32> {
    if let Commands::Completions { shell } = cli.command {
        return Ok(cmd_completions(shell));
    }
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            emit_error(false, &err);
            return Ok(exit_code_for_error(&err));
        }
    };
    match cli.command {
        Commands::Run {
            target,
            yes,
            timeout,
            json,
        } => cmd_run(settings, &target, yes, timeout, json, interrupt).await,
        Commands::Info {
            target,
            diagnostics_script,
            timeout,
            json,
        } => cmd_info(settings, &target, diagnostics_script, timeout, json).await,
        Commands::Resolve {
            target,
            assess,
            accept_unresolved,
            json,
        } => cmd_resolve(settings, &target, assess.as_deref(), accept_unresolved, json),
        Commands::Shell {
            venv,
            default_root,
            cwd,
            json,
        } => cmd_shell(settings, venv, default_root, cwd, json).await,
        Commands::Session => session::run(&settings, interrupt).await,
        Commands::Completions { shell } => Ok(cmd_completions(shell)),
    }
}

// =============================================================================
// Target resolution
// =============================================================================

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

impl TargetArgs {
    fn descriptor(&self) -> RunnerResult<ScriptDescriptor> {
        let mut descriptor = match (&self.catalog, &self.script) {
            (Some(catalog), _) => {
                let entries = load_catalog_file(catalog)?;
                let name = self.entry.as_deref().unwrap_or_default();
                find_entry(&entries, name).cloned().ok_or_else(|| {
                    RunnerError::new(
                        ErrorCode::Config,
                        format!("catalog has no entry named '{name}'"),
                        serde_json::json!({
                            "catalog": catalog.display().to_string(),
                            "entries": entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
                        }),
                    )
                })?
            }
            (None, Some(script)) => ScriptDescriptor::from_path(absolute(script)),
            (None, None) => {
                return Err(RunnerError::new(
                    ErrorCode::Config,
                    "a script path or --catalog with --entry is required",
                    None,
                ))
            }
        };
        if let Some(name) = &self.name {
            descriptor.name.clone_from(name);
        }
        if let Some(venv) = &self.venv {
            descriptor.environment_override = Some(absolute(venv));
        }
        if self.uv {
            descriptor.set_external_runner(true);
        }
        if self.shell {
            descriptor.set_interactive_shell(true);
        }
        Ok(descriptor)
    }

    fn apply_default_root(&self, settings: &mut Settings) -> RunnerResult<()> {
        if let Some(root) = &self.default_root {
            settings.default_root = Some(absolute(root));
        } else if let Some(file) = &self.default_root_file {
            settings.default_root = load_default_root_file(file)?;
        }
        Ok(())
    }

    fn prepare(&self, settings: &mut Settings) -> RunnerResult<ScriptDescriptor> {
        self.apply_default_root(settings)?;
        self.descriptor()
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Ask on the terminal whether an unknown file type may be opened.
fn confirm_unknown(path: &Path) -> bool {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return false;
    }
    eprint!(
        "'{}' is not a Python script or program. Open it with the default application? [y/N] ",
        path.display()
    );
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if stdin.lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Handle the run command.
async fn cmd_run(
    mut settings: Settings,
    target: &TargetArgs,
    yes: bool,
    timeout: Option<u64>,
    json: bool,
    mut interrupt: watch::Receiver<bool>,
) -> Result<i32> {
    let descriptor = match target.prepare(&mut settings) {
        Ok(descriptor) => descriptor,
        Err(err) => return Ok(emit_error(json, &err)),
    };
    let launcher = Launcher::from_settings(&settings);
    let unknown = matches!(expected_mode(&descriptor), ExecutionMode::Unknown { .. });
    let confirmed = yes || (unknown && descriptor.path.is_file() && confirm_unknown(&descriptor.path));
    let mut request = match launcher.plan(&descriptor, confirmed) {
        Ok(request) => request,
        Err(err) => return emit_result(json, &launcher.plan_failure(&descriptor, &err)),
    };
    if let Some(secs) = timeout {
        request.timeout = Duration::from_secs(secs);
    }

    let captured = request.mode.is_captured();
    let handle = launcher.launch(request);
    let spinner = (captured && !json).then(|| progress::LaunchProgress::start(&descriptor.name, handle.state()));
    let result = tokio::select! {
        result = handle.wait() => result,
        Ok(()) = interrupt.changed() => {
            if let Some(spinner) = spinner {
                spinner.finish();
            }
            eprintln!("interrupted");
            return Ok(EXIT_INTERRUPTED);
        }
    };
    if let Some(spinner) = spinner {
        spinner.finish();
    }
    emit_result(json, &result)
}

/// Handle the info command.
async fn cmd_info(
    mut settings: Settings,
    target: &TargetArgs,
    diagnostics_script: Option<PathBuf>,
    timeout: Option<u64>,
    json: bool,
) -> Result<i32> {
    let descriptor = match target.prepare(&mut settings) {
        Ok(descriptor) => descriptor,
        Err(err) => return Ok(emit_error(json, &err)),
    };
    let mut probe = Probe::new(&settings);
    if let Some(script) = diagnostics_script {
        probe = probe.with_script(absolute(&script));
    }
    if let Some(secs) = timeout {
        probe = probe.with_timeout(Duration::from_secs(secs));
    }
    let report = probe.run(&descriptor).await;
    if json {
        let payload = serde_json::to_string(&report).into_diagnostic()?;
        println!("{payload}");
    } else {
        print!("{}", report.render());
    }
    Ok(exit_code_for_report(&report))
}

/// Handle the resolve command.
fn cmd_resolve(
    mut settings: Settings,
    target: &TargetArgs,
    assess: Option<&Path>,
    accept_unresolved: bool,
    json: bool,
) -> Result<i32> {
    if let Err(err) = target.apply_default_root(&mut settings) {
        return Ok(emit_error(json, &err));
    }
    if let Some(candidate) = assess {
        let assessment = assess_override(
            &absolute(candidate),
            settings.default_root.as_deref(),
            &settings.layout,
        );
        return emit_assessment(json, assessment, accept_unresolved);
    }
    let descriptor = match target.descriptor() {
        Ok(descriptor) => descriptor,
        Err(err) => return Ok(emit_error(json, &err)),
    };
    let launcher = Launcher::from_settings(&settings);
    let resolution = launcher.resolve(&descriptor);
    if json {
        let payload = serde_json::to_string(&resolution).into_diagnostic()?;
        println!("{payload}");
    }
    match resolution {
        Resolution::Found(env) => {
            if !json {
                println!("{} [{}]", env.root.display(), env.source);
                match env.interpreter(launcher.layout()) {
                    Some(interpreter) => println!("interpreter: {}", interpreter.display()),
                    None => println!("interpreter: (not found)"),
                }
            }
            Ok(0)
        }
        not_found => match not_found.into_result() {
            Ok(_) => Ok(0),
            Err(err) => {
                if !json {
                    emit_error(false, &err);
                }
                Ok(exit_code_for_error(&err))
            }
        },
    }
}

fn emit_assessment(json: bool, assessment: OverrideAssessment, accept: bool) -> Result<i32> {
    if json {
        let payload = serde_json::to_string(&assessment).into_diagnostic()?;
        println!("{payload}");
    } else {
        match &assessment {
            OverrideAssessment::ResetToDefault => {
                println!("override equals the default root; it will be cleared");
            }
            OverrideAssessment::Valid(path) => println!("valid environment: {}", path.display()),
            OverrideAssessment::RequiresAcknowledgement(path) => {
                println!("no environment detected in {}", path.display());
            }
        }
    }
    match assessment.accept(accept) {
        Ok(_) => Ok(0),
        Err(err) => Ok(emit_error(json, &err)),
    }
}

/// Handle the shell command.
async fn cmd_shell(
    mut settings: Settings,
    venv: Option<PathBuf>,
    default_root: Option<PathBuf>,
    cwd: Option<PathBuf>,
    json: bool,
) -> Result<i32> {
    if let Some(root) = default_root {
        settings.default_root = Some(absolute(&root));
    }
    let cwd = cwd.map_or_else(|| absolute(Path::new(".")), |dir| absolute(&dir));
    let mut descriptor = ScriptDescriptor::new("shell", cwd.join("shell"));
    descriptor.environment_override = venv.map(|dir| absolute(&dir));
    let launcher = Launcher::from_settings(&settings);
    let request = launcher
        .resolve(&descriptor)
        .into_result()
        .and_then(|env| launcher.plan_environment_shell(&env, &cwd));
    match request {
        Ok(request) => {
            let result = launcher.launch(request).wait().await;
            emit_result(json, &result)
        }
        Err(err) => Ok(emit_error(json, &err)),
    }
}

/// Handle the completions command.
fn cmd_completions(shell: Shell) -> i32 {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    0
}

// =============================================================================
// Output
// =============================================================================

fn emit_result(json: bool, result: &ExecutionResult) -> Result<i32> {
    if json {
        let payload = serde_json::to_string(result).into_diagnostic()?;
        println!("{payload}");
    } else {
        for line in &result.log {
            println!("{}", line.render());
        }
        match (&result.status, &result.error) {
            (RunStatus::Launched, _) => eprintln!(
                "launched {} ({})",
                result.name,
                result.mode.label()
            ),
            (_, Some(error)) => {
                let err = RunnerError::new(error.code, error.message.clone(), error.context.clone());
                eprintln!("{:?}", miette::Report::new(err));
            }
            (RunStatus::Completed, None) => {
                tracing::info!(exit_code = ?result.exit_code, "run completed");
            }
            (status, None) => eprintln!("run finished: {status:?}"),
        }
    }
    Ok(exit_code_for_result(result))
}

/// Print `err` and return its exit code.
pub(crate) fn emit_error(json: bool, err: &RunnerError) -> i32 {
    if json {
        match serde_json::to_string(&err.to_error_info()) {
            Ok(payload) => println!("{payload}"),
            Err(_) => eprintln!("error: {err}"),
        }
    } else {
        eprintln!("{:?}", miette::Report::new(err.clone()));
    }
    exit_code_for_error(err)
}

fn exit_code_for_error_code(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::Config => 2,
        ErrorCode::EnvironmentNotFound => 3,
        ErrorCode::UnsupportedExtension => 4,
        ErrorCode::ActivationFailure | ErrorCode::Lock => 5,
        ErrorCode::Timeout => 124,
        ErrorCode::ProcessStartFailure => 126,
        ErrorCode::ScriptNotFound | ErrorCode::ExecutableNotFound => 127,
        ErrorCode::Io | ErrorCode::Internal => 1,
    }
}

pub(crate) fn exit_code_for_error(err: &RunnerError) -> i32 {
    exit_code_for_error_code(err.code)
}

fn exit_code_for_result(result: &ExecutionResult) -> i32 {
    match (result.status, &result.error) {
        (RunStatus::Completed, _) => result.exit_code.unwrap_or_default(),
        (RunStatus::Launched, _) => 0,
        (RunStatus::TimedOut, _) => 124,
        (_, Some(error)) => exit_code_for_error_code(error.code),
        (RunStatus::Killed | RunStatus::FailedToStart, None) => 1,
    }
}

fn exit_code_for_report(report: &DiagnosticsReport) -> i32 {
    match (&report.outcome, &report.error) {
        (ProbeOutcome::Completed { exit_code }, _) => *exit_code,
        (ProbeOutcome::TimedOut, _) => 124,
        (ProbeOutcome::FailedToStart, Some(error)) => exit_code_for_error_code(error.code),
        (ProbeOutcome::FailedToStart, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyexec::model::{ErrorInfo, RunId};

    fn result(status: RunStatus, exit_code: Option<i32>, error: Option<ErrorCode>) -> ExecutionResult {
        ExecutionResult {
            run_id: RunId::new(),
            name: "job".into(),
            mode: ExecutionMode::Interpreter,
            status,
            exit_code,
            pid: None,
            command: "python".into(),
            args: Vec::new(),
            cwd: "/w".into(),
            environment: None,
            log: Vec::new(),
            started_at_ms: 0,
            ended_at_ms: 0,
            error: error.map(|code| ErrorInfo {
                code,
                message: "x".into(),
                context: None,
            }),
        }
    }

    #[test]
    fn exit_code_maps_environment_not_found() {
        let err = RunnerError::environment_not_found(None, None);
        assert_eq!(exit_code_for_error(&err), 3);
    }

    #[test]
    fn exit_code_maps_timeout() {
        let err = RunnerError::timeout(Duration::from_secs(1));
        assert_eq!(exit_code_for_error(&err), 124);
    }

    #[test]
    fn completed_runs_exit_with_the_child_code() {
        assert_eq!(exit_code_for_result(&result(RunStatus::Completed, Some(7), None)), 7);
        assert_eq!(
            exit_code_for_result(&result(RunStatus::FailedToStart, None, Some(ErrorCode::ExecutableNotFound))),
            127
        );
        assert_eq!(exit_code_for_result(&result(RunStatus::Launched, None, None)), 0);
    }
}
