use proot_sandbox::{Audit, Policy};
use std::ffi::OsString;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
mod run;

#[cfg(not(target_os = "linux"))]
#[path = "run_stub.rs"]
mod run;

pub use run::handle_run_command;

/// Everything the command line says about one session.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    pub exclusions: Vec<PathBuf>,
    pub runner: Option<OsString>,
    pub policy: Policy,
    pub audit: Audit,
    /// Program and arguments; empty means the user's shell.
    pub command: Vec<OsString>,
}
