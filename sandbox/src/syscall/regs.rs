//! Register snapshots of a stopped tracee.
//!
//! Only the syscall view of the register file is exposed: number, six
//! arguments, result and stack pointer.

use crate::error::{Result, SandboxError};
use nix::unistd::Pid;

/// Number of syscall argument registers.
pub const ARG_COUNT: usize = 6;

/// Syscall number the kernel rejects with ENOSYS without side effects.
pub const SKIP_SYSCALL: i64 = -1;

#[derive(Clone)]
pub struct Registers {
    raw: arch::Raw,
    nr_changed: bool,
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers")
            .field("nr", &self.syscall_number())
            .field("args", &self.args())
            .field("result", &self.result())
            .field("sp", &format_args!("{:#x}", self.stack_pointer()))
            .finish()
    }
}

impl Registers {
    pub fn fetch(pid: Pid) -> Result<Self> {
        let raw = arch::get(pid).map_err(|e| SandboxError::host("ptrace(GETREGS)", e))?;
        Ok(Self {
            raw,
            nr_changed: false,
        })
    }

    pub fn store(&self, pid: Pid) -> Result<()> {
        arch::set(pid, &self.raw, self.nr_changed)
            .map_err(|e| SandboxError::host("ptrace(SETREGS)", e))
    }

    pub fn syscall_number(&self) -> i64 {
        arch::nr(&self.raw)
    }

    pub fn set_syscall_number(&mut self, nr: i64) {
        arch::set_nr(&mut self.raw, nr);
        self.nr_changed = true;
    }

    pub fn args(&self) -> [u64; ARG_COUNT] {
        std::array::from_fn(|i| arch::arg(&self.raw, i))
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        arch::set_arg(&mut self.raw, index, value);
    }

    /// Restore argument registers the kernel would have preserved.
    ///
    /// On architectures where the first argument register also carries the
    /// result, that register is left alone.
    pub fn restore_args(&mut self, original: &[u64; ARG_COUNT]) {
        for (index, &value) in original.iter().enumerate().skip(arch::FIRST_PRESERVED_ARG) {
            arch::set_arg(&mut self.raw, index, value);
        }
    }

    pub fn result(&self) -> i64 {
        arch::result(&self.raw)
    }

    pub fn set_result(&mut self, value: i64) {
        arch::set_result(&mut self.raw, value);
    }

    pub fn stack_pointer(&self) -> u64 {
        arch::sp(&self.raw)
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    pub type Raw = libc::user_regs_struct;

    pub const FIRST_PRESERVED_ARG: usize = 0;

    pub fn get(pid: Pid) -> nix::Result<Raw> {
        ptrace::getregs(pid)
    }

    pub fn set(pid: Pid, raw: &Raw, _nr_changed: bool) -> nix::Result<()> {
        ptrace::setregs(pid, *raw)
    }

    pub fn nr(raw: &Raw) -> i64 {
        raw.orig_rax as i64
    }

    pub fn set_nr(raw: &mut Raw, nr: i64) {
        raw.orig_rax = nr as u64;
    }

    pub fn arg(raw: &Raw, index: usize) -> u64 {
        match index {
            0 => raw.rdi,
            1 => raw.rsi,
            2 => raw.rdx,
            3 => raw.r10,
            4 => raw.r8,
            _ => raw.r9,
        }
    }

    pub fn set_arg(raw: &mut Raw, index: usize, value: u64) {
        match index {
            0 => raw.rdi = value,
            1 => raw.rsi = value,
            2 => raw.rdx = value,
            3 => raw.r10 = value,
            4 => raw.r8 = value,
            _ => raw.r9 = value,
        }
    }

    pub fn result(raw: &Raw) -> i64 {
        raw.rax as i64
    }

    pub fn set_result(raw: &mut Raw, value: i64) {
        raw.rax = value as u64;
    }

    pub fn sp(raw: &Raw) -> u64 {
        raw.rsp
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use nix::errno::Errno;
    use nix::unistd::Pid;
    use std::mem;

    pub type Raw = libc::user_regs_struct;

    // x0 carries both the first argument and the result.
    pub const FIRST_PRESERVED_ARG: usize = 1;

    const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

    fn regset<T>(
        pid: Pid,
        request: libc::c_uint,
        kind: libc::c_int,
        value: *mut T,
    ) -> nix::Result<()> {
        let mut iov = libc::iovec {
            iov_base: value.cast(),
            iov_len: mem::size_of::<T>(),
        };
        // SAFETY: iov describes a live, correctly sized buffer for the regset.
        let res = unsafe {
            libc::ptrace(request, pid.as_raw(), kind as usize, &mut iov as *mut libc::iovec)
        };
        Errno::result(res).map(drop)
    }

    pub fn get(pid: Pid) -> nix::Result<Raw> {
        // SAFETY: user_regs_struct is plain old data.
        let mut raw: Raw = unsafe { mem::zeroed() };
        regset(pid, libc::PTRACE_GETREGSET, libc::NT_PRSTATUS, &mut raw)?;
        Ok(raw)
    }

    pub fn set(pid: Pid, raw: &Raw, nr_changed: bool) -> nix::Result<()> {
        let mut copy = *raw;
        regset(pid, libc::PTRACE_SETREGSET, libc::NT_PRSTATUS, &mut copy)?;
        if nr_changed {
            let mut nr = raw.regs[8] as libc::c_int;
            regset(pid, libc::PTRACE_SETREGSET, NT_ARM_SYSTEM_CALL, &mut nr)?;
        }
        Ok(())
    }

    pub fn nr(raw: &Raw) -> i64 {
        raw.regs[8] as i64
    }

    pub fn set_nr(raw: &mut Raw, nr: i64) {
        raw.regs[8] = nr as u64;
    }

    pub fn arg(raw: &Raw, index: usize) -> u64 {
        raw.regs[index]
    }

    pub fn set_arg(raw: &mut Raw, index: usize, value: u64) {
        raw.regs[index] = value;
    }

    pub fn result(raw: &Raw) -> i64 {
        raw.regs[0] as i64
    }

    pub fn set_result(raw: &mut Raw, value: i64) {
        raw.regs[0] = value as u64;
    }

    pub fn sp(raw: &Raw) -> u64 {
        raw.sp
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("syscall interception supports x86_64 and aarch64 only");
