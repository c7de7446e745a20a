//! Child-process lifecycle for one planned launch.
//!
//! Captured modes pipe both streams into a shared, ordered log and race the
//! child against its deadline. Everything else is spawned and handed off.

use crate::error::RunnerError;
use crate::model::{
    unix_ms, ExecutionMode, ExecutionRequest, ExecutionResult, LaunchState, LogLine, RunStatus,
    StreamKind,
};
use parking_lot::Mutex;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long readers may keep flushing after the process is gone.
pub const READER_GRACE: Duration = Duration::from_secs(2);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// Ordered log shared by the reader tasks of one launch.
#[derive(Clone, Default)]
struct LogSink {
    inner: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    lines: Vec<LogLine>,
    sealed: bool,
}

impl LogSink {
    fn push(&self, stream: StreamKind, text: String) {
        let mut state = self.inner.lock();
        if state.sealed {
            return;
        }
        state.lines.push(LogLine {
            stream,
            text,
            at_ms: unix_ms(),
        });
    }

    /// Take the lines; later pushes are dropped.
    fn seal(&self) -> Vec<LogLine> {
        let mut state = self.inner.lock();
        state.sealed = true;
        std::mem::take(&mut state.lines)
    }
}

fn transition(state: &watch::Sender<LaunchState>, request: &ExecutionRequest, next: LaunchState) {
    tracing::debug!(run_id = %request.run_id, name = %request.name, state = ?next, "launch state");
    state.send_replace(next);
}

fn build_command(request: &ExecutionRequest) -> Command {
    let mut command = Command::new(&request.program);
    #[cfg(windows)]
    if request.mode == ExecutionMode::InteractiveShell {
        for arg in &request.args {
            command.raw_arg(arg);
        }
    } else {
        command.args(&request.args);
    }
    #[cfg(not(windows))]
    command.args(&request.args);

    command.current_dir(&request.cwd);
    request.env.apply(&mut command);

    if request.mode.is_captured() {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);
    } else if request.mode == ExecutionMode::InteractiveShell && cfg!(windows) {
        #[cfg(windows)]
        command.creation_flags(CREATE_NEW_CONSOLE);
    } else {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }
    command
}

fn spawn_error(request: &ExecutionRequest, err: &io::Error) -> RunnerError {
    if err.kind() == io::ErrorKind::NotFound {
        RunnerError::executable_not_found(&request.program)
    } else {
        RunnerError::start_failure(&request.program, err)
    }
}

/// Run `request` to a terminal result, publishing state changes on `state`.
pub(crate) async fn execute(
    request: ExecutionRequest,
    state: watch::Sender<LaunchState>,
) -> ExecutionResult {
    let mut result = ExecutionResult::for_request(&request);
    transition(&state, &request, LaunchState::Starting);

    let mut child = match build_command(&request).spawn() {
        Ok(child) => child,
        Err(err) => {
            let error = spawn_error(&request, &err);
            tracing::warn!(
                run_id = %request.run_id,
                program = %request.program.display(),
                error = %err,
                "failed to start process"
            );
            result.error = Some(error.to_error_info());
            return finish(result, RunStatus::FailedToStart, &state, &request);
        }
    };

    let pid = child.id();
    result.pid = pid;
    transition(&state, &request, LaunchState::Running { pid });
    tracing::info!(
        run_id = %request.run_id,
        pid = ?pid,
        mode = request.mode.label(),
        program = %request.program.display(),
        "process started"
    );

    if !request.mode.is_captured() {
        // Detached: dropping the handle leaves the process running.
        drop(child);
        return finish(result, RunStatus::Launched, &state, &request);
    }

    let sink = LogSink::default();
    let readers = [
        tokio::spawn(pump(child.stdout.take(), StreamKind::Output, sink.clone())),
        tokio::spawn(pump(child.stderr.take(), StreamKind::Error, sink.clone())),
    ];

    let status = match tokio::time::timeout(request.timeout, child.wait()).await {
        Ok(Ok(exit)) => {
            drain(readers).await;
            match exit.code() {
                Some(code) => {
                    result.exit_code = Some(code);
                    RunStatus::Completed
                }
                None => RunStatus::Killed,
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(run_id = %request.run_id, error = %err, "failed to wait for process");
            terminate(&mut child, pid).await;
            drain(readers).await;
            result.error = Some(RunnerError::io("failed to wait for process", err).to_error_info());
            RunStatus::Killed
        }
        Err(_) => {
            tracing::warn!(
                run_id = %request.run_id,
                pid = ?pid,
                timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
                "deadline reached; terminating process"
            );
            terminate(&mut child, pid).await;
            drain(readers).await;
            result.error = Some(RunnerError::timeout(request.timeout).to_error_info());
            RunStatus::TimedOut
        }
    };

    result.log = sink.seal();
    finish(result, status, &state, &request)
}

fn finish(
    mut result: ExecutionResult,
    status: RunStatus,
    state: &watch::Sender<LaunchState>,
    request: &ExecutionRequest,
) -> ExecutionResult {
    result.status = status;
    result.ended_at_ms = unix_ms();
    tracing::info!(
        run_id = %request.run_id,
        status = ?status,
        exit_code = ?result.exit_code,
        lines = result.log.len(),
        "launch finished"
    );
    transition(state, request, LaunchState::Finished { status });
    result
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, stream: StreamKind, sink: LogSink) {
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                sink.push(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(err) => {
                tracing::debug!(?stream, error = %err, "stream read failed");
                break;
            }
        }
    }
}

/// Wait for the readers to hit end-of-stream, abandoning them after the grace period.
async fn drain(readers: [JoinHandle<()>; 2]) {
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let joined = tokio::time::timeout(READER_GRACE, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if joined.is_err() {
        tracing::debug!("abandoning output readers still attached to inherited pipes");
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Kill the child and its process group. Failures are logged and ignored.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => tracing::debug!(pgid, error = %err, "failed to kill process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "failed to kill child");
    }
}
