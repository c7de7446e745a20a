//! Single-instance guard.
//!
//! At most one primary instance runs system-wide. A second start finds the
//! primary's window, brings it to the foreground and exits. Window handling goes
//! through the [`WindowManager`] trait so the escalation logic can be tested
//! without a desktop.

pub mod desktop;
pub mod lock;

pub use desktop::{
    platform_window_manager, AppleScriptWindowManager, HeadlessWindowManager, X11WindowManager,
};
pub use lock::{holder_pid, lock_file_name, InstanceLock};

use crate::config::InstanceSettings;
use crate::error::RunnerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the primary instance is recognised.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub lock_name: String,
    pub process_name: String,
    /// Substring of the primary's window title.
    pub window_title: String,
}

impl AppIdentity {
    pub fn from_settings(settings: &InstanceSettings) -> Self {
        Self {
            lock_name: settings.lock_name.clone(),
            process_name: settings.effective_process_name(),
            window_title: settings.window_title.clone(),
        }
    }
}

/// Opaque, platform-specific window id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub pid: u32,
    pub title: String,
    pub process_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub main_window: Option<WindowInfo>,
}

/// Desktop operations needed to find and raise another process's window.
///
/// Every operation is best-effort: `false` means the platform refused or the
/// operation is unsupported.
pub trait WindowManager {
    fn processes_named(&self, name: &str) -> Vec<ProcessInfo>;
    /// First top-level window whose title contains `title`.
    fn find_window_by_title(&self, title: &str) -> Option<WindowInfo>;
    fn top_level_windows(&self) -> Vec<WindowInfo>;
    fn is_minimized(&self, window: WindowHandle) -> bool;
    fn restore(&self, window: WindowHandle) -> bool;
    fn set_foreground(&self, window: WindowHandle) -> bool;
    fn set_topmost(&self, window: WindowHandle, topmost: bool) -> bool;
    /// Share input focus with the window's owner so a foreground request is honoured.
    fn attach_input(&self, window: WindowHandle) -> bool;
    fn flash(&self, window: WindowHandle) -> bool;
}

/// Which search found the peer window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStage {
    ProcessName,
    WindowTitle,
    Enumeration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerWindow {
    pub window: WindowInfo,
    pub stage: SearchStage,
}

pub(crate) fn same_process_name(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.to_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    };
    strip(a) == strip(b)
}

/// Locate the primary instance's window, never returning one owned by `self_pid`.
///
/// Stages, in order: a same-named process with a main window; a window whose
/// title contains the identity's title; a full scan of top-level windows
/// matching both the owning process name and the title.
pub fn find_peer_window(
    wm: &dyn WindowManager,
    identity: &AppIdentity,
    self_pid: u32,
) -> Option<PeerWindow> {
    let by_process = wm
        .processes_named(&identity.process_name)
        .into_iter()
        .filter(|process| process.pid != self_pid)
        .find_map(|process| process.main_window);
    if let Some(window) = by_process {
        return Some(PeerWindow {
            window,
            stage: SearchStage::ProcessName,
        });
    }

    if !identity.window_title.is_empty() {
        if let Some(window) = wm
            .find_window_by_title(&identity.window_title)
            .filter(|window| window.pid != self_pid)
        {
            return Some(PeerWindow {
                window,
                stage: SearchStage::WindowTitle,
            });
        }
    }

    wm.top_level_windows()
        .into_iter()
        .find(|window| {
            window.pid != self_pid
                && window
                    .process_name
                    .as_deref()
                    .is_some_and(|name| same_process_name(name, &identity.process_name))
                && window.title.contains(&identity.window_title)
        })
        .map(|window| PeerWindow {
            window,
            stage: SearchStage::Enumeration,
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStep {
    Restored,
    Foreground,
    TopmostToggled,
    InputAttached,
    RetriedForeground,
    Flashed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationReport {
    pub peer: PeerWindow,
    /// Steps that were attempted and succeeded, in order.
    pub steps: Vec<ActivationStep>,
    pub reached_foreground: bool,
}

/// Raise `peer`: restore, request foreground, escalate with a top-most toggle
/// and input attachment, and flash it as a last resort.
pub fn bring_to_front(wm: &dyn WindowManager, peer: PeerWindow) -> ActivationReport {
    let handle = peer.window.handle;
    let mut steps = Vec::new();

    if wm.is_minimized(handle) && wm.restore(handle) {
        steps.push(ActivationStep::Restored);
    }
    let mut reached = wm.set_foreground(handle);
    if reached {
        steps.push(ActivationStep::Foreground);
    } else {
        tracing::debug!(window = handle.0, "foreground refused; escalating");
        let raised = wm.set_topmost(handle, true);
        let lowered = wm.set_topmost(handle, false);
        if raised && lowered {
            steps.push(ActivationStep::TopmostToggled);
        }
        if wm.attach_input(handle) {
            steps.push(ActivationStep::InputAttached);
        }
        reached = wm.set_foreground(handle);
        if reached {
            steps.push(ActivationStep::RetriedForeground);
        } else if wm.flash(handle) {
            steps.push(ActivationStep::Flashed);
        }
    }

    tracing::info!(
        window = handle.0,
        pid = peer.window.pid,
        stage = ?peer.stage,
        reached_foreground = reached,
        ?steps,
        "activation finished"
    );
    ActivationReport {
        peer,
        steps,
        reached_foreground: reached,
    }
}

#[derive(Debug)]
pub enum GuardOutcome {
    /// This process is the primary instance; keep the lock alive.
    Acquired(InstanceLock),
    /// Another instance was brought to the foreground.
    ActivatedExisting(ActivationReport),
    /// Another instance exists (or the lock is unusable) and activation failed.
    ActivationFailed(RunnerError),
}

impl GuardOutcome {
    /// Anything but [`GuardOutcome::Acquired`] means this process must exit.
    pub fn should_exit(&self) -> bool {
        !matches!(self, Self::Acquired(_))
    }
}

pub struct InstanceGuard {
    identity: AppIdentity,
    lock_dir: PathBuf,
    wm: Box<dyn WindowManager>,
    self_pid: u32,
}

impl InstanceGuard {
    pub fn new(identity: AppIdentity, lock_dir: impl Into<PathBuf>, wm: Box<dyn WindowManager>) -> Self {
        Self {
            identity,
            lock_dir: lock_dir.into(),
            wm,
            self_pid: std::process::id(),
        }
    }

    pub fn from_settings(settings: &InstanceSettings) -> Self {
        Self::new(
            AppIdentity::from_settings(settings),
            settings.effective_lock_dir(),
            platform_window_manager(),
        )
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    /// Take the lock, or activate the instance that holds it.
    pub fn acquire_or_activate(&self) -> GuardOutcome {
        match InstanceLock::try_acquire(&self.identity.lock_name, &self.lock_dir) {
            Ok(Some(lock)) => GuardOutcome::Acquired(lock),
            Ok(None) => self.activate_existing(),
            Err(err) => {
                tracing::error!(code = %err.code, "single-instance lock unusable: {}", err.message);
                GuardOutcome::ActivationFailed(err)
            }
        }
    }

    fn activate_existing(&self) -> GuardOutcome {
        let holder = holder_pid(&self.identity.lock_name, &self.lock_dir);
        tracing::info!(holder = ?holder, "another instance is running");
        let Some(peer) = find_peer_window(self.wm.as_ref(), &self.identity, self.self_pid) else {
            let err = RunnerError::activation_failure(
                "another instance is running but its window could not be found",
                serde_json::json!({
                    "holder_pid": holder,
                    "process_name": self.identity.process_name,
                    "window_title": self.identity.window_title,
                }),
            );
            tracing::warn!("{}", err.message);
            return GuardOutcome::ActivationFailed(err);
        };
        let report = bring_to_front(self.wm.as_ref(), peer);
        if report.reached_foreground {
            GuardOutcome::ActivatedExisting(report)
        } else {
            let context = serde_json::to_value(&report).ok();
            let err = RunnerError::activation_failure(
                "the running instance's window could not be brought to the foreground",
                context,
            );
            tracing::warn!("{}", err.message);
            GuardOutcome::ActivationFailed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_names_compare_without_exe_suffix() {
        assert!(same_process_name("PyExec.exe", "pyexec"));
        assert!(same_process_name("pyexec", "PYEXEC"));
        assert!(!same_process_name("pyexec-cli", "pyexec"));
    }

    #[test]
    fn only_acquired_keeps_running() {
        let err = RunnerError::activation_failure("x", None);
        assert!(GuardOutcome::ActivationFailed(err).should_exit());
    }
}
