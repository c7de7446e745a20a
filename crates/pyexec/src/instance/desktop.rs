//! [`WindowManager`] implementations backed by the desktop's own tools.
//!
//! X11 desktops are driven through `wmctrl`, `xdotool` and `xprop`; macOS
//! through `osascript` and System Events. A missing tool makes the operation
//! report failure, it never aborts the guard.

use super::{same_process_name, ProcessInfo, WindowHandle, WindowInfo, WindowManager};
use std::collections::HashMap;
use std::process::Command;
use sysinfo::{ProcessesToUpdate, System};

/// Run a desktop tool and return its stdout if it exited successfully.
fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            tracing::debug!(program, ?args, status = ?output.status, "desktop tool failed");
            None
        }
        Err(err) => {
            tracing::debug!(program, error = %err, "desktop tool unavailable");
            None
        }
    }
}

fn process_names() -> HashMap<u32, String> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.name().to_string_lossy().into_owned()))
        .collect()
}

/// Pick the platform's manager; headless when no desktop session is visible.
pub fn platform_window_manager() -> Box<dyn WindowManager> {
    if cfg!(target_os = "macos") {
        return Box::new(AppleScriptWindowManager);
    }
    let has_display = ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|value| !value.is_empty()));
    if cfg!(unix) && has_display {
        Box::new(X11WindowManager)
    } else {
        tracing::debug!("no desktop session; window activation disabled");
        Box::new(HeadlessWindowManager)
    }
}

/// Manager for sessions without any window system. Finds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadlessWindowManager;

impl WindowManager for HeadlessWindowManager {
    fn processes_named(&self, _name: &str) -> Vec<ProcessInfo> {
        Vec::new()
    }
    fn find_window_by_title(&self, _title: &str) -> Option<WindowInfo> {
        None
    }
    fn top_level_windows(&self) -> Vec<WindowInfo> {
        Vec::new()
    }
    fn is_minimized(&self, _window: WindowHandle) -> bool {
        false
    }
    fn restore(&self, _window: WindowHandle) -> bool {
        false
    }
    fn set_foreground(&self, _window: WindowHandle) -> bool {
        false
    }
    fn set_topmost(&self, _window: WindowHandle, _topmost: bool) -> bool {
        false
    }
    fn attach_input(&self, _window: WindowHandle) -> bool {
        false
    }
    fn flash(&self, _window: WindowHandle) -> bool {
        false
    }
}

/// EWMH window manager control for X11 (and XWayland) sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct X11WindowManager;

/// Split off the next whitespace-delimited field.
fn next_field(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() {
        return None;
    }
    let end = line.find(char::is_whitespace).unwrap_or(line.len());
    Some(line.split_at(end))
}

/// Parse one `wmctrl -lp` line: `<id> <desktop> <pid> <host> <title...>`.
pub(crate) fn parse_wmctrl_line(line: &str) -> Option<WindowInfo> {
    let (id, rest) = next_field(line)?;
    let (_desktop, rest) = next_field(rest)?;
    let (pid, rest) = next_field(rest)?;
    let (_host, rest) = next_field(rest).unwrap_or(("", ""));
    let handle = u64::from_str_radix(id.trim_start_matches("0x"), 16).ok()?;
    Some(WindowInfo {
        handle: WindowHandle(handle),
        pid: pid.parse().ok()?,
        title: rest.trim().to_string(),
        process_name: None,
    })
}

fn x11_id(window: WindowHandle) -> String {
    format!("0x{:08x}", window.0)
}

fn x11_windows() -> Vec<WindowInfo> {
    let Some(listing) = run_tool("wmctrl", &["-lp"]) else {
        return Vec::new();
    };
    let names = process_names();
    listing
        .lines()
        .filter_map(parse_wmctrl_line)
        .map(|mut window| {
            window.process_name = names.get(&window.pid).cloned();
            window
        })
        .collect()
}

fn set_x11_state(window: WindowHandle, action: &str) -> bool {
    run_tool("wmctrl", &["-i", "-r", &x11_id(window), "-b", action]).is_some()
}

impl WindowManager for X11WindowManager {
    fn processes_named(&self, name: &str) -> Vec<ProcessInfo> {
        let windows = x11_windows();
        process_names()
            .into_iter()
            .filter(|(_, process)| same_process_name(process, name))
            .map(|(pid, process)| ProcessInfo {
                pid,
                main_window: windows.iter().find(|window| window.pid == pid).cloned(),
                name: process,
            })
            .collect()
    }

    fn find_window_by_title(&self, title: &str) -> Option<WindowInfo> {
        let windows = x11_windows();
        let pattern = regex::escape(title);
        let found = run_tool("xdotool", &["search", "--onlyvisible", "--name", &pattern])
            .and_then(|ids| {
                ids.lines()
                    .filter_map(|id| id.trim().parse::<u64>().ok())
                    .find_map(|id| windows.iter().find(|window| window.handle.0 == id).cloned())
            });
        found.or_else(|| windows.into_iter().find(|window| window.title.contains(title)))
    }

    fn top_level_windows(&self) -> Vec<WindowInfo> {
        x11_windows()
    }

    fn is_minimized(&self, window: WindowHandle) -> bool {
        run_tool("xprop", &["-id", &x11_id(window), "_NET_WM_STATE"])
            .is_some_and(|state| state.contains("_NET_WM_STATE_HIDDEN"))
    }

    fn restore(&self, window: WindowHandle) -> bool {
        set_x11_state(window, "remove,hidden")
    }

    fn set_foreground(&self, window: WindowHandle) -> bool {
        let id = window.0.to_string();
        if run_tool("xdotool", &["windowactivate", "--sync", &id]).is_none() {
            return false;
        }
        run_tool("xdotool", &["getactivewindow"])
            .and_then(|active| active.trim().parse::<u64>().ok())
            .is_some_and(|active| active == window.0)
    }

    fn set_topmost(&self, window: WindowHandle, topmost: bool) -> bool {
        set_x11_state(window, if topmost { "add,above" } else { "remove,above" })
    }

    fn attach_input(&self, window: WindowHandle) -> bool {
        run_tool("xdotool", &["windowfocus", "--sync", &window.0.to_string()]).is_some()
    }

    fn flash(&self, window: WindowHandle) -> bool {
        set_x11_state(window, "add,demands_attention")
    }
}

/// System Events control for macOS. Window handles are owning pids, since
/// System Events addresses windows through their process.
#[derive(Clone, Copy, Debug, Default)]
pub struct AppleScriptWindowManager;

fn applescript_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn osascript(script: &str) -> Option<String> {
    run_tool("osascript", &["-e", script]).map(|out| out.trim().to_string())
}

fn process_ref(pid: u64) -> String {
    format!("(first process whose unix id is {pid})")
}

/// Parse `pid<TAB>title` lines produced by the window listing scripts.
pub(crate) fn parse_pid_title_lines(text: &str) -> Vec<WindowInfo> {
    text.lines()
        .filter_map(|line| {
            let (pid, title) = line.split_once('\t')?;
            let pid: u32 = pid.trim().parse().ok()?;
            Some(WindowInfo {
                handle: WindowHandle(u64::from(pid)),
                pid,
                title: title.to_string(),
                process_name: None,
            })
        })
        .collect()
}

fn apple_windows(title_filter: Option<&str>) -> Vec<WindowInfo> {
    let condition = title_filter.map_or_else(
        || "true".to_string(),
        |title| format!("name of w contains {}", applescript_quote(title)),
    );
    let script = format!(
        "set out to \"\"\n\
         tell application \"System Events\"\n\
         repeat with p in (every process whose background only is false)\n\
         repeat with w in (every window of p)\n\
         if {condition} then set out to out & (unix id of p as text) & tab & (name of w) & linefeed\n\
         end repeat\n\
         end repeat\n\
         end tell\n\
         return out"
    );
    let names = process_names();
    osascript(&script)
        .map(|text| parse_pid_title_lines(&text))
        .unwrap_or_default()
        .into_iter()
        .map(|mut window| {
            window.process_name = names.get(&window.pid).cloned();
            window
        })
        .collect()
}

fn tell(body: &str) -> Option<String> {
    osascript(&format!("tell application \"System Events\" to {body}"))
}

impl WindowManager for AppleScriptWindowManager {
    fn processes_named(&self, name: &str) -> Vec<ProcessInfo> {
        process_names()
            .into_iter()
            .filter(|(_, process)| same_process_name(process, name))
            .map(|(pid, process)| {
                let title = tell(&format!(
                    "get name of front window of {}",
                    process_ref(u64::from(pid))
                ));
                ProcessInfo {
                    pid,
                    main_window: title.map(|title| WindowInfo {
                        handle: WindowHandle(u64::from(pid)),
                        pid,
                        title,
                        process_name: Some(process.clone()),
                    }),
                    name: process,
                }
            })
            .collect()
    }

    fn find_window_by_title(&self, title: &str) -> Option<WindowInfo> {
        apple_windows(Some(title)).into_iter().next()
    }

    fn top_level_windows(&self) -> Vec<WindowInfo> {
        apple_windows(None)
    }

    fn is_minimized(&self, window: WindowHandle) -> bool {
        tell(&format!(
            "get value of attribute \"AXMinimized\" of front window of {}",
            process_ref(window.0)
        ))
        .is_some_and(|value| value == "true")
    }

    fn restore(&self, window: WindowHandle) -> bool {
        tell(&format!(
            "set value of attribute \"AXMinimized\" of front window of {} to false",
            process_ref(window.0)
        ))
        .is_some()
    }

    fn set_foreground(&self, window: WindowHandle) -> bool {
        if tell(&format!("set frontmost of {} to true", process_ref(window.0)))
            .is_none()
        {
            return false;
        }
        tell("get unix id of first process whose frontmost is true")
            .and_then(|pid| pid.parse::<u64>().ok())
            .is_some_and(|pid| pid == window.0)
    }

    fn set_topmost(&self, _window: WindowHandle, _topmost: bool) -> bool {
        false
    }

    fn attach_input(&self, window: WindowHandle) -> bool {
        tell(&format!(
            "perform action \"AXRaise\" of front window of {}",
            process_ref(window.0)
        ))
        .is_some()
    }

    fn flash(&self, _window: WindowHandle) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wmctrl_listing_keeps_title_spacing() {
        let window = parse_wmctrl_line("0x03a00003  0 4242   host PyExec  - scripts").unwrap();
        assert_eq!(window.handle, WindowHandle(0x03a0_0003));
        assert_eq!(window.pid, 4242);
        assert_eq!(window.title, "PyExec  - scripts");
    }

    #[test]
    fn wmctrl_listing_rejects_garbage() {
        assert!(parse_wmctrl_line("").is_none());
        assert!(parse_wmctrl_line("zz 0 1 host t").is_none());
    }

    #[test]
    fn pid_title_lines_skip_malformed_rows() {
        let windows = parse_pid_title_lines("12\tPyExec\nnot a row\n13\t\n");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows.first().map(|w| w.title.as_str()), Some("PyExec"));
    }

    #[test]
    fn applescript_strings_are_escaped() {
        assert_eq!(applescript_quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn headless_finds_nothing() {
        let wm = HeadlessWindowManager;
        assert!(wm.processes_named("pyexec").is_empty());
        assert!(!wm.set_foreground(WindowHandle(1)));
    }
}
