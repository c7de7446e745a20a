//! PyExec: run Python scripts inside the virtual environment they belong to.
//!
//! The crate resolves a script's environment from an explicit override or a
//! default root (the root itself, its `venv` folder, or a conventional folder
//! such as `.venv` inside it), launches it in one of several modes with
//! captured and time-boxed output, probes environments with a bundled
//! diagnostics script, and keeps the desktop front end down to a single
//! instance.

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]

pub mod config;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod instance;
pub mod launch;
pub mod model;

pub use crate::error::{ErrorCode, RunnerError, RunnerResult};
pub use crate::model::*;
