//! `pyexec session`: the single-instance, long-running launcher.
//!
//! Reads one JSON launch request per stdin line, starts each launch at once and
//! writes every terminal result as one JSON line as soon as it completes.

use crate::{emit_error, exit_code_for_error, EXIT_INTERRUPTED};
use miette::{IntoDiagnostic, Result};
use pyexec::config::Settings;
use pyexec::instance::{GuardOutcome, InstanceGuard};
use pyexec::launch::Launcher;
use pyexec::model::{ExecutionResult, ScriptDescriptor};
use pyexec::{ErrorCode, RunnerError};
use serde::Deserialize;
use std::io::{IsTerminal, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Deserialize)]
struct SessionRequest {
    script: ScriptDescriptor,
    #[serde(default)]
    confirm: bool,
}

fn set_terminal_title(title: &str) {
    let mut stderr = std::io::stderr();
    if stderr.is_terminal() {
        let _ = write!(stderr, "\x1b]0;{title}\x07");
        let _ = stderr.flush();
    }
}

fn write_line(payload: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{payload}").into_diagnostic()?;
    stdout.flush().into_diagnostic()
}

fn emit_completion(result: &ExecutionResult) -> Result<()> {
    let payload = serde_json::to_string(result).into_diagnostic()?;
    write_line(&payload)
}

fn emit_request_error(line: &str, err: &serde_json::Error) -> Result<()> {
    let error = RunnerError::new(
        ErrorCode::Config,
        "invalid session request",
        serde_json::json!({
            "parse_error": err.to_string(),
            "received": line.chars().take(200).collect::<String>(),
            "expected_schema": {
                "script": "catalog entry object (Name, Path, VirtualEnvPath, UseUvRun, RunInCmd)",
                "confirm": "bool, open unknown file types with the default handler",
            },
        }),
    );
    let payload = serde_json::to_string(&error.to_error_info()).into_diagnostic()?;
    write_line(&payload)
}

/// Run the session; returns the process exit code.
pub async fn run(settings: &Settings, mut interrupt: watch::Receiver<bool>) -> Result<i32> {
    let guard = InstanceGuard::from_settings(&settings.instance);
    let lock = match guard.acquire_or_activate() {
        GuardOutcome::Acquired(lock) => lock,
        GuardOutcome::ActivatedExisting(report) => {
            eprintln!(
                "pyexec is already running (pid {}); brought its window to the front",
                report.peer.window.pid
            );
            return Ok(0);
        }
        GuardOutcome::ActivationFailed(err) => {
            emit_error(false, &err);
            return Ok(exit_code_for_error(&err));
        }
    };
    set_terminal_title(&guard.identity().window_title);

    let (tx, mut completions) = mpsc::unbounded_channel();
    let launcher = Launcher::from_settings(settings).with_completions(tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut in_flight: usize = 0;

    let code = loop {
        if !stdin_open && in_flight == 0 {
            break 0;
        }
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<SessionRequest>(&line) {
                    Ok(request) => {
                        tracing::info!(name = %request.script.name, "session launch requested");
                        drop(launcher.run_script(&request.script, request.confirm));
                        in_flight += 1;
                    }
                    Err(err) => emit_request_error(&line, &err)?,
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read session input");
                    stdin_open = false;
                }
            },
            Some(result) = completions.recv() => {
                in_flight = in_flight.saturating_sub(1);
                emit_completion(&result)?;
            }
            Ok(()) = interrupt.changed() => {
                tracing::info!(in_flight, "session interrupted");
                break EXIT_INTERRUPTED;
            }
        }
    };

    lock.release();
    Ok(code)
}
