use super::RunOptions;
use anyhow::{Context, Result};
use proot_sandbox::{Config, Supervisor};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::{debug, Level};

const DEFAULT_SHELL: &str = "/bin/sh";

/// Run a program inside the guest root and return its exit status.
pub fn handle_run_command(options: RunOptions) -> Result<i32> {
    let (program, args) = split_command(options.command);
    if args.is_empty() && is_pid(&program) {
        anyhow::bail!("attaching a process on-the-fly not yet supported");
    }

    let runner = options.runner.as_deref().map(resolve_runner).transpose()?;

    let mut builder = Config::builder(&options.root)
        .runner(runner)
        .policy(options.policy)
        .audit(options.audit);
    for path in options.exclusions {
        builder = builder.exclude(path);
    }
    let config = builder.build()?;

    if tracing::enabled!(Level::DEBUG) {
        let json = serde_json::to_string(&config).context("Failed to serialize configuration")?;
        debug!(config = %json, "effective configuration");
    }

    let mut supervisor = Supervisor::new(config);
    supervisor
        .launch(&program, &args)
        .with_context(|| format!("Failed to launch '{}'", program.to_string_lossy()))?;
    let status = supervisor.run()?;
    Ok(status)
}

/// Program and arguments, falling back to `$SHELL` then `/bin/sh`.
fn split_command(command: Vec<OsString>) -> (OsString, Vec<OsString>) {
    let mut command = command.into_iter();
    match command.next() {
        Some(program) => (program, command.collect()),
        None => (default_shell(std::env::var_os("SHELL")), Vec::new()),
    }
}

fn default_shell(shell: Option<OsString>) -> OsString {
    shell
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| OsString::from(DEFAULT_SHELL))
}

/// `proot <root> <pid>` is the attach form.
fn is_pid(program: &OsStr) -> bool {
    program
        .to_str()
        .and_then(|s| s.parse::<u32>().ok())
        .is_some_and(|pid| pid != 0)
}

/// Host path of the runner: paths are taken as given, bare names are looked up in PATH.
fn resolve_runner(runner: &OsStr) -> Result<PathBuf> {
    let path = Path::new(runner);
    if path.components().count() > 1 || path.is_absolute() {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        return Ok(cwd.join(path));
    }
    which::which(runner).with_context(|| format!("Runner '{}' not found in PATH", path.display()))
}
