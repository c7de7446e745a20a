use crate::environment::{InterpreterLayout, ResolvedEnvironment};
use crate::model::EnvOverlay;
use std::ffi::OsString;
use std::path::Path;

/// Variables stripped from the child so a global Python install cannot leak in.
pub const STRIPPED_VARS: [&str; 2] = ["PYTHONHOME", "PYTHONPATH"];

/// Overlay that makes `env` the active environment for a direct interpreter run.
pub fn interpreter_overlay(env: &ResolvedEnvironment, layout: &InterpreterLayout) -> EnvOverlay {
    interpreter_overlay_with_path(env, layout, std::env::var_os("PATH"))
}

/// Same as [`interpreter_overlay`], with the inherited `PATH` passed in.
pub fn interpreter_overlay_with_path(
    env: &ResolvedEnvironment,
    layout: &InterpreterLayout,
    inherited_path: Option<OsString>,
) -> EnvOverlay {
    let bin = env.bin_dir(layout);
    let mut overlay = EnvOverlay::default();
    overlay
        .set
        .insert("VIRTUAL_ENV".to_string(), env.root.display().to_string());
    overlay
        .set
        .insert("PATH".to_string(), prepend_path(&bin, inherited_path));
    overlay
        .set
        .insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
    overlay.remove = STRIPPED_VARS.iter().map(|v| (*v).to_string()).collect();
    overlay
}

fn prepend_path(bin: &Path, inherited: Option<OsString>) -> String {
    let Some(inherited) = inherited.filter(|p| !p.is_empty()) else {
        return bin.display().to_string();
    };
    let entries = std::iter::once(bin.to_path_buf()).chain(std::env::split_paths(&inherited));
    match std::env::join_paths(entries) {
        Ok(joined) => joined.to_string_lossy().into_owned(),
        Err(_) => {
            let sep = if cfg!(windows) { ';' } else { ':' };
            format!("{}{sep}{}", bin.display(), inherited.to_string_lossy())
        }
    }
}
