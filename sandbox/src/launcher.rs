//! Bootstrap relaunch.
//!
//! Tracing starts with PTRACE_TRACEME in a forked child, so the first exec
//! the supervisor could see is the one that child performs. Instead of
//! exec'ing the user's program directly, the child re-executes this binary
//! in launcher mode; the launcher then execs the user's program, and that
//! execve is the first one the interceptor translates. Until then the
//! launcher's own syscalls (dynamic loading, runtime setup) pass through
//! untouched.

use crate::config::Config;
use crate::error::{Result, SandboxError};
use nix::sys::ptrace;
use nix::unistd::{execvp, Pid};
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Marks a process started by [`spawn_tracee`].
pub const LAUNCHER_ENV: &str = "PROOT_LAUNCHER";

/// Whether this process was started as the launcher.
pub fn is_launcher() -> bool {
    std::env::var_os(LAUNCHER_ENV).is_some()
}

/// Replace the launcher with the user's program: `argv[0]` and the rest of
/// the command line are the program and its arguments.
///
/// Only returns on failure.
pub fn run_launcher() -> Result<Infallible> {
    std::env::remove_var(LAUNCHER_ENV);
    let argv = std::env::args_os()
        .map(|arg| cstring(&arg))
        .collect::<Result<Vec<_>>>()?;
    let Some(program) = argv.first() else {
        return Err(SandboxError::Usage("launcher started without a program".into()));
    };
    execvp(program, &argv).map_err(|e| {
        SandboxError::host(format!("execvp({})", program.to_string_lossy()), e)
    })
}

/// Fork the traced child and start it in launcher mode inside the guest root.
pub fn spawn_tracee(config: &Config, program: &OsStr, args: &[OsString]) -> Result<Pid> {
    let exe = std::env::current_exe().map_err(|e| SandboxError::host("current_exe()", e))?;

    let mut command = Command::new(exe);
    command
        .arg0(program)
        .args(args)
        .env(LAUNCHER_ENV, "1")
        .env("PWD", "/")
        .env("OLDPWD", "/")
        .current_dir(config.root());
    // SAFETY: traceme() is async-signal-safe.
    unsafe {
        command.pre_exec(|| Ok(ptrace::traceme()?));
    }

    let child = command
        .spawn()
        .map_err(|e| SandboxError::host(format!("spawn({})", program.to_string_lossy()), e))?;
    Ok(Pid::from_raw(child.id() as i32))
}

fn cstring(arg: &OsStr) -> Result<CString> {
    CString::new(arg.as_bytes()).map_err(|_| {
        SandboxError::Usage(format!("argument {:?} contains a NUL byte", arg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstring_rejects_interior_nul() {
        assert!(cstring(OsStr::new("/bin/sh")).is_ok());
        let err = cstring(OsStr::from_bytes(b"a\0b")).unwrap_err();
        assert!(matches!(err, SandboxError::Usage(_)));
    }
}
