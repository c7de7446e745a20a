//! Interactive-shell wrappers.
//!
//! Each platform gets a command that opens a visible shell, changes into the
//! working directory, activates the environment when an activation script
//! exists, runs the script and leaves the shell open afterwards.

use std::path::{Path, PathBuf};

/// Which kind of shell wrapper to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellFlavor {
    /// `cmd.exe /k`.
    Cmd,
    /// Terminal.app driven through `osascript`.
    AppleTerminal,
    /// A terminal emulator running `sh -c`.
    Emulator { terminal: String },
}

impl ShellFlavor {
    /// Flavor for the host, using `terminal` (or `$TERMINAL`, or the first
    /// emulator found on `PATH`) on Linux and other Unixes.
    pub fn native(terminal: Option<&str>) -> Self {
        if cfg!(windows) {
            Self::Cmd
        } else if cfg!(target_os = "macos") {
            Self::AppleTerminal
        } else {
            Self::Emulator {
                terminal: pick_terminal(terminal),
            }
        }
    }
}

fn pick_terminal(configured: Option<&str>) -> String {
    if let Some(terminal) = configured.filter(|t| !t.trim().is_empty()) {
        return terminal.to_string();
    }
    if let Some(terminal) = std::env::var("TERMINAL").ok().filter(|t| !t.trim().is_empty()) {
        return terminal;
    }
    ["x-terminal-emulator", "gnome-terminal", "konsole", "xfce4-terminal", "xterm"]
        .into_iter()
        .find(|candidate| which::which(candidate).is_ok())
        .unwrap_or("xterm")
        .to_string()
}

/// Program and raw arguments of a shell wrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Build the wrapper. `activate` is `None` when the environment has no
/// activation script (or there is no environment); the script then runs with
/// whatever interpreter the shell finds.
pub fn shell_command(
    flavor: &ShellFlavor,
    cwd: &Path,
    activate: Option<&Path>,
    script: Option<&Path>,
) -> ShellCommand {
    match flavor {
        ShellFlavor::Cmd => cmd_command(cwd, activate, script),
        ShellFlavor::AppleTerminal => {
            let chain = posix_chain(cwd, activate, script);
            ShellCommand {
                program: PathBuf::from("osascript"),
                args: vec![
                    "-e".to_string(),
                    format!(
                        "tell application \"Terminal\" to do script \"{}\"",
                        applescript_escape(&chain)
                    ),
                    "-e".to_string(),
                    "tell application \"Terminal\" to activate".to_string(),
                ],
            }
        }
        ShellFlavor::Emulator { terminal } => {
            let chain = posix_chain(cwd, activate, script);
            ShellCommand {
                program: PathBuf::from(terminal),
                args: vec![
                    "-e".to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("{chain}; exec \"${{SHELL:-/bin/sh}}\""),
                ],
            }
        }
    }
}

fn cmd_command(cwd: &Path, activate: Option<&Path>, script: Option<&Path>) -> ShellCommand {
    let mut steps = vec![format!("cd /d \"{}\"", cwd.display())];
    if let Some(activate) = activate {
        steps.push(format!("call \"{}\"", activate.display()));
    }
    if let Some(script) = script {
        let interpreter = if activate.is_some() { "python" } else { "py" };
        steps.push(format!("{interpreter} \"{}\"", script.display()));
    }
    // Passed verbatim: cmd.exe does its own quote parsing.
    ShellCommand {
        program: PathBuf::from("cmd.exe"),
        args: vec!["/k".to_string(), format!("\"{}\"", steps.join(" && "))],
    }
}

fn posix_chain(cwd: &Path, activate: Option<&Path>, script: Option<&Path>) -> String {
    let mut steps = vec![format!("cd {}", sh_quote(&cwd.display().to_string()))];
    if let Some(activate) = activate {
        steps.push(format!(". {}", sh_quote(&activate.display().to_string())));
    }
    if let Some(script) = script {
        let interpreter = if activate.is_some() { "python" } else { "python3" };
        steps.push(format!(
            "{interpreter} {}",
            sh_quote(&script.display().to_string())
        ));
    }
    steps.join(" && ")
}

/// Single-quote `value` for a POSIX shell.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

fn applescript_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_chain_activates_then_runs() {
        let cmd = shell_command(
            &ShellFlavor::Cmd,
            Path::new(r"C:\work"),
            Some(Path::new(r"C:\envs\p\Scripts\activate.bat")),
            Some(Path::new(r"C:\work\job.py")),
        );
        assert_eq!(cmd.program, PathBuf::from("cmd.exe"));
        assert_eq!(
            cmd.args,
            vec![
                "/k".to_string(),
                r#""cd /d "C:\work" && call "C:\envs\p\Scripts\activate.bat" && python "C:\work\job.py"""#.to_string()
            ]
        );
    }

    #[test]
    fn cmd_without_activation_uses_launcher() {
        let cmd = shell_command(
            &ShellFlavor::Cmd,
            Path::new(r"C:\work"),
            None,
            Some(Path::new(r"C:\work\job.py")),
        );
        assert!(cmd.args.get(1).is_some_and(|a| a.contains(r#"py "C:\work\job.py""#)));
        assert!(!cmd.args.get(1).is_some_and(|a| a.contains("call")));
    }

    #[test]
    fn emulator_keeps_shell_open() {
        let flavor = ShellFlavor::Emulator {
            terminal: "xterm".into(),
        };
        let cmd = shell_command(
            &flavor,
            Path::new("/srv/it's"),
            Some(Path::new("/envs/p/bin/activate")),
            Some(Path::new("/srv/it's/job.py")),
        );
        assert_eq!(cmd.program, PathBuf::from("xterm"));
        let script = cmd.args.last().cloned().unwrap_or_default();
        assert!(script.starts_with(r#"cd '/srv/it'"'"'s' && . '/envs/p/bin/activate' && python "#));
        assert!(script.ends_with("; exec \"${SHELL:-/bin/sh}\""));
    }

    #[test]
    fn apple_terminal_escapes_quotes() {
        let cmd = shell_command(
            &ShellFlavor::AppleTerminal,
            Path::new("/w"),
            None,
            Some(Path::new("/w/a.py")),
        );
        assert_eq!(cmd.program, PathBuf::from("osascript"));
        assert_eq!(
            cmd.args.get(1).map(String::as_str),
            Some("tell application \"Terminal\" to do script \"cd '/w' && python3 '/w/a.py'\"")
        );
    }
}
