//! Syscall interception: entry-side argument rewriting and exit-side fixups.
//!
//! At entry every path argument of a classified syscall is translated and the
//! host string is written into the tracee's stack, below the red zone; the
//! argument register is pointed at the copy. At exit the original argument
//! registers are put back and return values that carry paths are mapped back
//! to the guest view.

pub mod memory;
pub mod phase;
pub mod regs;
pub mod socket;
pub mod table;

use crate::audit;
use crate::config::Config;
use crate::error::{report, PolicyViolation, Result, SandboxError};
use crate::execve;
use crate::fdtable::{FdEntry, FdTable};
use crate::registry::{SyscallSnapshot, TracedProcess};
use memory::{Scratch, TraceeMemory, PATH_MAX};
use nix::unistd::Pid;
use phase::{Step, Trap};
use regs::{Registers, ARG_COUNT, SKIP_SYSCALL};
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use table::{ExitHook, PathArg, SyscallClass};
use tracing::{debug, trace};

/// What the exit stop has to undo or complete for the syscall in flight.
#[derive(Debug)]
pub struct PendingExit {
    nr: i64,
    args: [u64; ARG_COUNT],
    /// Forced failure: the syscall was skipped and must return `-errno`.
    deny: Option<i32>,
    /// Argument registers were pointed at scratch copies.
    rewritten: bool,
    execve: bool,
    bootstrap: bool,
    /// Host paths the arguments were translated to, in argument order.
    host_paths: Vec<PathBuf>,
    /// Scratch buffer the kernel writes a path result into.
    output: Option<u64>,
}

impl PendingExit {
    fn new(nr: i64, args: [u64; ARG_COUNT]) -> Self {
        Self {
            nr,
            args,
            deny: None,
            rewritten: false,
            execve: false,
            bootstrap: false,
            host_paths: Vec::new(),
            output: None,
        }
    }

    pub(crate) fn mark_execve(&mut self) {
        self.rewritten = true;
        self.execve = true;
    }
}

/// Handle a syscall-entry or syscall-exit stop of `process`.
pub fn on_syscall_trap(config: &Config, process: &mut TracedProcess) -> Result<()> {
    let (next, step) = phase::transition(process.phase, Trap::Syscall);
    process.phase = next;
    match step {
        Step::Enter => enter(config, process),
        Step::Exit => exit(config, process),
        Step::Nothing => Ok(()),
    }
}

fn enter(config: &Config, process: &mut TracedProcess) -> Result<()> {
    let pid = process.pid();
    let mut regs = Registers::fetch(pid)?;
    let nr = regs.syscall_number();
    let args = regs.args();
    trace!(pid = %pid, ?regs, "syscall entry");
    process.snapshot = Some(SyscallSnapshot { nr, args });

    if config.audit.check_syscall {
        if let Err(err) = audit::check_syscall(pid, nr) {
            report(&err);
        }
    }

    let mut pending = PendingExit::new(nr, args);
    if process.bootstrap {
        if !matches!(table::classify(nr), Some(SyscallClass::Execve(_))) {
            pending.bootstrap = true;
            process.pending = Some(pending);
            return Ok(());
        }
        debug!(pid = %pid, "launcher reached its execve, bootstrap over");
        process.bootstrap = false;
    }

    let mut entry = Entry {
        config,
        pid,
        regs: &mut regs,
        pending: &mut pending,
    };
    let outcome = entry.rewrite();
    let errno = match outcome {
        Ok(()) => None,
        Err(SandboxError::Path(err)) => {
            debug!(pid = %pid, nr, "path rejected: {err}");
            Some(err.errno())
        }
        Err(SandboxError::Policy(violation)) => {
            report(&violation.into());
            Some(violation.errno())
        }
        Err(err) => return Err(err),
    };
    if let Some(errno) = errno {
        regs.set_syscall_number(SKIP_SYSCALL);
        pending.deny = Some(errno);
    }
    if pending.rewritten || pending.deny.is_some() {
        regs.store(pid)?;
    }
    process.pending = Some(pending);
    Ok(())
}

/// Entry-stop context for one syscall.
pub(crate) struct Entry<'a> {
    pub config: &'a Config,
    pub pid: Pid,
    pub regs: &'a mut Registers,
    pub pending: &'a mut PendingExit,
}

impl Entry<'_> {
    fn rewrite(&mut self) -> Result<()> {
        let nr = self.pending.nr;
        let class = match table::classify(nr) {
            Some(class) => class,
            None if self.config.policy.allow_unknown => {
                debug!(pid = %self.pid, nr, "unknown syscall passed through");
                return Ok(());
            }
            None => return Err(PolicyViolation::UnknownSyscall(nr).into()),
        };

        let mut scratch = self.scratch();
        match class {
            SyscallClass::Passthrough => {}
            SyscallClass::Ptrace if self.config.policy.allow_ptrace => {}
            SyscallClass::Ptrace => return Err(PolicyViolation::NestedTrace.into()),
            SyscallClass::SinglePath(arg) => self.translate_arg(&mut scratch, &arg)?,
            SyscallClass::MultiplePaths(list) => {
                for arg in list {
                    self.translate_arg(&mut scratch, arg)?;
                }
            }
            SyscallClass::Execve(arg) => execve::enter(self, &mut scratch, &arg)?,
            SyscallClass::SocketAddress(arg) => socket::enter(self, &mut scratch, arg)?,
        }
        self.redirect_output(&mut scratch)
    }

    /// Point the result buffer of readlink/getcwd at scratch space.
    ///
    /// The kernel truncates a result to the caller's buffer; a truncated host
    /// path no longer maps back to the guest view, so the full host path is
    /// collected here and the guest form copied out at exit.
    fn redirect_output(&mut self, scratch: &mut Scratch) -> Result<()> {
        let (buf, size) = match table::exit_hook(self.pending.nr) {
            ExitHook::Readlink { buf } => (buf, buf + 1),
            ExitHook::Getcwd => (0, 1),
            _ => return Ok(()),
        };
        // An empty buffer gets the kernel's own error.
        if self.args()[size] == 0 {
            return Ok(());
        }
        let addr = scratch.reserve(PATH_MAX)?;
        self.regs.set_arg(buf, addr);
        self.regs.set_arg(size, PATH_MAX as u64);
        self.pending.output = Some(addr);
        self.pending.rewritten = true;
        Ok(())
    }

    pub(crate) fn memory(&self) -> TraceeMemory {
        TraceeMemory::new(self.pid)
    }

    fn scratch(&self) -> Scratch {
        Scratch::below(self.memory(), self.regs.stack_pointer())
    }

    pub(crate) fn args(&self) -> &[u64; ARG_COUNT] {
        &self.pending.args
    }

    /// Read the guest path argument `arg`. `None` for NULL or empty strings.
    pub(crate) fn read_path(&self, arg: &PathArg) -> Result<Option<PathBuf>> {
        let pointer = self.args()[arg.path];
        if pointer == 0 {
            return Ok(None);
        }
        let raw = self.memory().read_cstring(pointer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(OsString::from_vec(raw))))
    }

    /// Guest directory a relative path of `arg` starts from, or `None` when
    /// the kernel should resolve it unassisted (bad or non-directory dirfd).
    pub(crate) fn base_dir(&self, arg: &PathArg, guest: &Path) -> Option<PathBuf> {
        if guest.is_absolute() {
            return Some(PathBuf::from("/"));
        }
        match arg.dirfd.map(|index| self.args()[index] as i32) {
            None | Some(libc::AT_FDCWD) => Some(guest_cwd(self.config, self.pid)),
            Some(fd) => guest_fd_path(self.config, self.pid, fd),
        }
    }

    fn translate_arg(&mut self, scratch: &mut Scratch, arg: &PathArg) -> Result<()> {
        let Some(guest) = self.read_path(arg)? else {
            return Ok(());
        };
        let Some(cwd) = self.base_dir(arg, &guest) else {
            debug!(
                pid = %self.pid,
                path = %guest.display(),
                "unresolvable dirfd, left untouched"
            );
            return Ok(());
        };
        let follow = arg.follow(self.args());
        let host = self.config.paths.translate(&guest, &cwd, follow)?;
        debug!(
            pid = %self.pid,
            nr = self.pending.nr,
            path = %guest.display(),
            host = %host.display(),
            "translated"
        );
        let addr = scratch.push_cstring(host.as_os_str().as_bytes())?;
        self.regs.set_arg(arg.path, addr);
        self.pending.rewritten = true;
        self.pending.host_paths.push(host);
        Ok(())
    }
}

/// Guest view of the tracee's working directory, `/` when it is not visible.
pub(crate) fn guest_cwd(config: &Config, pid: Pid) -> PathBuf {
    proc_link(pid, "cwd")
        .and_then(|host| config.paths.detranslate(&host))
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn guest_fd_path(config: &Config, pid: Pid, fd: i32) -> Option<PathBuf> {
    if fd < 0 {
        return None;
    }
    proc_link(pid, &format!("fd/{fd}")).and_then(|host| config.paths.detranslate(&host))
}

fn proc_link(pid: Pid, entry: &str) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/{entry}")).ok()
}

fn exit(config: &Config, process: &mut TracedProcess) -> Result<()> {
    // No entry was seen for this exit, e.g. the fork return of a new child.
    let Some(pending) = process.pending.take() else {
        return Ok(());
    };
    if pending.bootstrap {
        return Ok(());
    }
    let hook = table::exit_hook(pending.nr);
    if !pending.rewritten && pending.deny.is_none() && hook == ExitHook::Nothing {
        return Ok(());
    }

    let pid = process.pid();
    let mut regs = Registers::fetch(pid)?;
    let result = regs.result();
    trace!(pid = %pid, ?regs, "syscall exit");

    let mut dirty = false;
    if let Some(errno) = pending.deny {
        regs.set_result(-i64::from(errno));
        dirty = true;
    } else if let Some(fixed) = apply_exit_hook(config, process, &pending, result)? {
        regs.set_result(fixed);
        dirty = true;
    }

    // A successful execve replaced the whole register file.
    let exec_succeeded = pending.execve && result == 0;
    if pending.rewritten && !exec_succeeded {
        regs.restore_args(&pending.args);
        dirty = true;
    }
    if dirty {
        regs.store(pid)?;
    }
    Ok(())
}

/// Run the exit hook of the pending syscall; returns a replacement result if any.
fn apply_exit_hook(
    config: &Config,
    process: &TracedProcess,
    pending: &PendingExit,
    result: i64,
) -> Result<Option<i64>> {
    if result < 0 {
        return Ok(None);
    }
    let args = &pending.args;
    let fds = &process.fds;
    let memory = TraceeMemory::new(process.pid());

    match table::exit_hook(pending.nr) {
        ExitHook::Nothing => {}
        ExitHook::Readlink { buf } => {
            let Some(output) = pending.output else {
                return Ok(None);
            };
            return readlink_exit(config, memory, output, args[buf], args[buf + 1], result);
        }
        ExitHook::Getcwd => {
            let Some(output) = pending.output else {
                return Ok(None);
            };
            return getcwd_exit(config, memory, output, args[0], args[1]);
        }
        ExitHook::Open { flags } => {
            let cloexec = flags.is_some_and(|i| args[i] & libc::O_CLOEXEC as u64 != 0);
            record_open(fds, pending, result, cloexec);
        }
        ExitHook::Openat2 { how } => {
            // struct open_how starts with the u64 open flags.
            let flags = memory.read_word(args[how]).unwrap_or(0);
            record_open(fds, pending, result, flags & libc::O_CLOEXEC as u64 != 0);
        }
        ExitHook::Dup { flags } => {
            let cloexec = flags.is_some_and(|i| args[i] & libc::O_CLOEXEC as u64 != 0);
            fds.duplicate_at(args[0] as i32, result as i32, cloexec);
        }
        ExitHook::Fcntl => match args[1] as i32 {
            libc::F_DUPFD => {
                fds.duplicate_at(args[0] as i32, result as i32, false);
            }
            libc::F_DUPFD_CLOEXEC => {
                fds.duplicate_at(args[0] as i32, result as i32, true);
            }
            libc::F_SETFD => {
                fds.set_cloexec(args[0] as i32, args[2] & libc::FD_CLOEXEC as u64 != 0);
            }
            _ => {}
        },
        ExitHook::Close => {
            fds.remove(args[0] as i32);
        }
        ExitHook::CloseRange => {
            let (first, last) = close_range_bounds(args[0], args[1]);
            if args[2] & CLOSE_RANGE_CLOEXEC != 0 {
                fds.set_cloexec_range(first, last);
            } else {
                fds.remove_range(first, last);
            }
        }
    }
    Ok(None)
}

const CLOSE_RANGE_CLOEXEC: u64 = 1 << 2;

fn record_open(fds: &FdTable, pending: &PendingExit, fd: i64, cloexec: bool) {
    if let Some(host) = pending.host_paths.first() {
        fds.insert(fd as i32, FdEntry::new(host.clone(), cloexec));
    }
}

fn close_range_bounds(first: u64, last: u64) -> (i32, i32) {
    let clamp = |v: u64| (v as u32).min(i32::MAX as u32) as i32;
    (clamp(first), clamp(last))
}

/// Copy the guest form of the link target the kernel wrote to `output` into
/// the caller's buffer.
fn readlink_exit(
    config: &Config,
    memory: TraceeMemory,
    output: u64,
    buf: u64,
    size: u64,
    len: i64,
) -> Result<Option<i64>> {
    let Ok(target) = memory.read_bytes(output, len as usize) else {
        return Ok(Some(-i64::from(libc::EFAULT)));
    };
    copy_out(memory, buf, &readlink_result(config, target, size))
}

/// What readlink(2) shows the guest: the guest form of `target`, truncated
/// to `size` bytes without a terminating NUL.
fn readlink_result(config: &Config, target: Vec<u8>, size: u64) -> Vec<u8> {
    let target = PathBuf::from(OsString::from_vec(target));
    let mut bytes = return_path(config, &target)
        .unwrap_or(target)
        .into_os_string()
        .into_vec();
    bytes.truncate(usize::try_from(size).unwrap_or(usize::MAX));
    bytes
}

/// Copy the guest form of the working directory getcwd(2) wrote to `output`
/// into the caller's buffer.
fn getcwd_exit(
    config: &Config,
    memory: TraceeMemory,
    output: u64,
    buf: u64,
    size: u64,
) -> Result<Option<i64>> {
    let Ok(host) = memory.read_cstring(output) else {
        return Ok(Some(-i64::from(libc::EFAULT)));
    };
    match getcwd_result(config, host, size) {
        Ok(bytes) => copy_out(memory, buf, &bytes),
        Err(errno) => Ok(Some(-i64::from(errno))),
    }
}

/// NUL-terminated guest working directory, or the errno getcwd(2) fails with.
fn getcwd_result(config: &Config, host: Vec<u8>, size: u64) -> std::result::Result<Vec<u8>, i32> {
    let host = PathBuf::from(OsString::from_vec(host));
    let guest = config.paths.detranslate(&host).ok_or(libc::ENOENT)?;
    let mut bytes = guest.into_os_string().into_vec();
    bytes.push(0);
    if bytes.len() as u64 > size {
        return Err(libc::ERANGE);
    }
    Ok(bytes)
}

/// Write a result into the caller's buffer; the syscall returns its length.
fn copy_out(memory: TraceeMemory, buf: u64, bytes: &[u8]) -> Result<Option<i64>> {
    match memory.write_bytes(buf, bytes) {
        Ok(()) => Ok(Some(bytes.len() as i64)),
        Err(err) if err.is_vanished_tracee() => Err(err),
        Err(_) => Ok(Some(-i64::from(libc::EFAULT))),
    }
}

/// Guest form of an absolute host path read back from the kernel.
///
/// Relative link targets and targets the guest cannot see are returned as-is.
fn return_path(config: &Config, target: &Path) -> Option<PathBuf> {
    if !target.is_absolute() {
        return None;
    }
    config
        .paths
        .detranslate(target)
        .filter(|guest| guest.as_path() != target)
}
