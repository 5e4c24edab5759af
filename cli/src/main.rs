mod cmd;

use clap::Parser;
use cmd::RunOptions;
use proot_sandbox::{Audit, Policy};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proot", version)]
#[command(
    about = "Run a program with another directory as its root file system, without privileges",
    long_about = None
)]
struct Args {
    /// Do not translate PATH nor anything beneath it (repeatable)
    #[arg(short = 'x', value_name = "PATH")]
    exclude: Vec<PathBuf>,

    /// Execute every program through PROGRAM (e.g. a CPU emulator)
    #[arg(short = 'r', value_name = "PROGRAM")]
    runner: Option<OsString>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of concurrent jobs (ignored: a single job is supported)
    #[arg(short = 'j', value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    jobs: Option<u32>,

    /// Allow unknown syscalls to run untranslated (insecure)
    #[arg(short = 'u')]
    allow_unknown: bool,

    /// Allow the guest to use ptrace itself (insecure)
    #[arg(short = 'p')]
    allow_ptrace: bool,

    /// Check that every descriptor refers to a path inside the guest
    #[arg(short = 'd')]
    check_fd: bool,

    /// Cross-check the intercepted syscall against /proc/<pid>/syscall
    #[arg(short = 's')]
    check_syscall: bool,

    /// Directory used as the guest root file system
    root: PathBuf,

    /// Program to run and its arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

impl Args {
    fn into_options(self) -> RunOptions {
        RunOptions {
            root: self.root,
            exclusions: self.exclude,
            runner: self.runner,
            policy: Policy {
                allow_unknown: self.allow_unknown,
                allow_ptrace: self.allow_ptrace,
            },
            audit: Audit {
                check_fd: self.check_fd,
                check_syscall: self.check_syscall,
            },
            command: self.command,
        }
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    // Second stage of the bootstrap: become the user's program.
    #[cfg(target_os = "linux")]
    if proot_sandbox::is_launcher() {
        let Err(e) = proot_sandbox::run_launcher();
        eprintln!("proot: {}", e);
        std::process::exit(1);
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    setup_logging(args.verbose);
    if let Some(jobs) = args.jobs {
        tracing::warn!(jobs, "concurrent jobs are not supported, running a single job");
    }

    match cmd::handle_run_command(args.into_options()) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("proot: {:#}", e);
            std::process::exit(1);
        }
    }
}
