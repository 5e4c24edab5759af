//! The event loop driving every tracee.

use crate::audit;
use crate::config::Config;
use crate::error::{report, Result, SandboxError};
use crate::event::{StopContext, TraceEvent};
use crate::launcher;
use crate::registry::{Registry, TracedProcess};
use crate::syscall::{self, memory::TraceeMemory};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use tracing::{debug, info};

const CLONE_FILES: u64 = libc::CLONE_FILES as u64;

/// Exit status reported when the tracees vanish without a status.
const NO_STATUS: i32 = 1;

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_EXITKILL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lineage {
    Fork,
    Vfork,
    Clone,
}

pub struct Supervisor {
    config: Config,
    registry: Registry,
    last_status: i32,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Registry::new(),
            last_status: NO_STATUS,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start `program` under supervision, through the launcher.
    pub fn launch(&mut self, program: &OsStr, args: &[OsString]) -> Result<Pid> {
        let pid = launcher::spawn_tracee(&self.config, program, args)?;
        let process = self.registry.register(pid)?;
        process.bootstrap = true;
        info!(pid = %pid, program = %program.to_string_lossy(), "launched");
        Ok(pid)
    }

    /// Run until no tracee is left; returns the last observed exit status.
    pub fn run(&mut self) -> Result<i32> {
        while self.registry.count() > 0 {
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SandboxError::host("waitpid()", e)),
            };
            self.dispatch(status)?;
            if self.config.audit.check_fd {
                audit::check_fds(&self.config, &self.registry);
            }
        }
        Ok(self.last_status)
    }

    fn dispatch(&mut self, status: WaitStatus) -> Result<()> {
        let Some(pid) = status.pid() else {
            return Ok(());
        };
        let stopped = !matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..));
        if stopped && !self.registry.contains(pid) {
            // A new child reporting before its parent's fork event.
            debug!(pid = %pid, "adopting unannounced tracee");
            let process = self.registry.register(pid)?;
            process.options_installed = true;
            process.awaiting_initial_stop = true;
        }

        let context = self
            .registry
            .get(pid)
            .map(|p| StopContext {
                options_installed: p.options_installed,
                awaiting_initial_stop: p.awaiting_initial_stop,
            })
            .unwrap_or_default();

        let Some(event) = TraceEvent::decode(status, context) else {
            report(&SandboxError::Internal(format!(
                "unrecognized trace notification {status:?}"
            )));
            return self.resume(pid);
        };

        match self.handle(event) {
            Ok(()) => Ok(()),
            Err(err) if err.is_vanished_tracee() => {
                debug!(pid = %pid, "tracee vanished: {err}");
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                report(&err);
                self.resume(pid)
            }
        }
    }

    fn handle(&mut self, event: TraceEvent) -> Result<()> {
        match event {
            TraceEvent::Exited { pid, code } => {
                self.registry.unregister(pid);
                self.last_status = code;
                info!(pid = %pid, status = code, "exited");
                Ok(())
            }
            TraceEvent::Signaled { pid, signal } => {
                self.registry.unregister(pid);
                self.last_status = 128 + signal as i32;
                info!(pid = %pid, signal = %signal, "killed by signal");
                Ok(())
            }
            TraceEvent::Continued { pid } => {
                debug!(pid = %pid, "continued");
                Ok(())
            }
            TraceEvent::SyscallTrap { pid } => {
                let config = &self.config;
                if let Some(process) = self.registry.get_mut(pid) {
                    if let Err(err) = syscall::on_syscall_trap(config, process) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        report(&err);
                    }
                }
                self.resume(pid)
            }
            TraceEvent::FirstStop { pid } => {
                let installed = self.registry.get(pid).is_some_and(|p| p.options_installed);
                if !installed {
                    ptrace::setoptions(pid, trace_options())
                        .map_err(|e| SandboxError::host("ptrace(SETOPTIONS)", e))?;
                    debug!(pid = %pid, "trace options installed");
                }
                if let Some(process) = self.registry.get_mut(pid) {
                    process.options_installed = true;
                    process.awaiting_initial_stop = false;
                    process.pending_signal = None;
                }
                self.resume(pid)
            }
            TraceEvent::ForkEvent { pid } => self.new_lineage_member(pid, Lineage::Fork),
            TraceEvent::VforkEvent { pid } => self.new_lineage_member(pid, Lineage::Vfork),
            TraceEvent::CloneEvent { pid } => self.new_lineage_member(pid, Lineage::Clone),
            TraceEvent::ExecEvent { pid } => {
                self.exec_completed(pid)?;
                self.resume(pid)
            }
            TraceEvent::OtherSignal { pid, signal } => {
                debug!(pid = %pid, signal = %signal, "forwarding signal");
                if let Some(process) = self.registry.get_mut(pid) {
                    process.pending_signal = Some(signal);
                }
                self.resume(pid)
            }
        }
    }

    /// Pre-register the child announced by a fork/vfork/clone event of `parent`.
    fn new_lineage_member(&mut self, parent: Pid, lineage: Lineage) -> Result<()> {
        let raw = ptrace::getevent(parent)
            .map_err(|e| SandboxError::host("ptrace(GETEVENTMSG)", e))?;
        let child = Pid::from_raw(raw as i32);

        let Some(parent_state) = self.registry.get(parent) else {
            return self.resume(parent);
        };
        let shares_files = shares_descriptors(parent_state);
        let fds = if shares_files {
            parent_state.fds.clone()
        } else {
            parent_state.fds.deep_clone()
        };
        let bootstrap = parent_state.bootstrap;
        info!(pid = %parent, child = %child, ?lineage, "new tracee");

        match self.registry.get_mut(child) {
            // Its own first stop came first; only the descriptor table is missing.
            Some(existing) => existing.fds = fds,
            None => {
                let process = self.registry.register(child)?;
                process.options_installed = true;
                process.awaiting_initial_stop = true;
                process.bootstrap = bootstrap;
                process.fds = fds;
            }
        }
        self.resume(parent)
    }

    /// Bookkeeping after a successful execve of `pid`.
    fn exec_completed(&mut self, pid: Pid) -> Result<()> {
        let former =
            ptrace::getevent(pid).map_err(|e| SandboxError::host("ptrace(GETEVENTMSG)", e))?;
        let former = Pid::from_raw(former as i32);
        if former != pid {
            // A non-leader thread exec'd and took over the leader's pid.
            if let Some(mut thread) = self.registry.unregister(former) {
                debug!(pid = %pid, former = %former, "exec by non-leader thread");
                thread.rename(pid);
                self.registry.reinsert(thread);
            }
        }
        if let Some(process) = self.registry.get(pid) {
            process.fds.close_on_exec();
            info!(pid = %pid, "exec completed");
        }
        Ok(())
    }

    /// Resume `pid` until its next syscall boundary, delivering its pending signal.
    fn resume(&mut self, pid: Pid) -> Result<()> {
        let signal: Option<Signal> = self
            .registry
            .get_mut(pid)
            .and_then(|p| p.pending_signal.take());
        match ptrace::syscall(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(pid = %pid, "resume: tracee gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::host("ptrace(SYSCALL)", e)),
        }
    }
}

/// Whether the clone in flight for `parent` shares its descriptor table.
fn shares_descriptors(parent: &TracedProcess) -> bool {
    let Some(snapshot) = parent.snapshot else {
        return false;
    };
    let flags = match snapshot.nr {
        nr if nr == libc::SYS_clone => snapshot.args[0],
        // struct clone_args starts with the u64 flags.
        nr if nr == libc::SYS_clone3 => TraceeMemory::new(parent.pid())
            .read_word(snapshot.args[0])
            .unwrap_or(0),
        _ => return false,
    };
    flags & CLONE_FILES != 0
}
