//! Access to a stopped tracee's address space.

use crate::error::{PathError, Result, SandboxError};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};

/// Longest guest path accepted, terminating NUL included.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Bytes below the stack pointer the ABI lets leaf code use without moving it.
const RED_ZONE: u64 = 128;

const PAGE_SIZE: u64 = 4096;

/// Upper bound on argv/envp entries read from a tracee.
const MAX_VECTOR_LEN: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub struct TraceeMemory {
    pid: Pid,
}

impl TraceeMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// Read up to `buf.len()` bytes; returns how many were readable.
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> usize {
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: buf.len(),
        }];
        let mut local = [IoSliceMut::new(buf)];
        process_vm_readv(self.pid, &mut local, &remote).unwrap_or(0)
    }

    /// Read exactly `len` bytes from guest memory.
    pub fn read_bytes(&self, addr: u64, len: usize) -> std::result::Result<Vec<u8>, PathError> {
        let mut buf = vec![0u8; len];
        if len > 0 && self.read_into(addr, &mut buf) != len {
            return Err(PathError::Fault);
        }
        Ok(buf)
    }

    /// Read a NUL-terminated string of at most `PATH_MAX` bytes.
    pub fn read_cstring(&self, addr: u64) -> std::result::Result<Vec<u8>, PathError> {
        if addr == 0 {
            return Err(PathError::Fault);
        }
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < PATH_MAX {
            // Never cross a page boundary in one read: the next page may be unmapped.
            let to_boundary = (PAGE_SIZE - cursor % PAGE_SIZE) as usize;
            let mut chunk = vec![0u8; to_boundary.min(PATH_MAX - out.len())];
            let got = self.read_into(cursor, &mut chunk);
            if got == 0 {
                return Err(PathError::Fault);
            }
            if let Some(nul) = chunk[..got].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..got]);
            cursor += got as u64;
        }
        Err(PathError::NameTooLong)
    }

    pub fn read_word(&self, addr: u64) -> std::result::Result<u64, PathError> {
        let bytes = self.read_bytes(addr, std::mem::size_of::<u64>())?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_ne_bytes(word))
    }

    /// Read a NULL-terminated array of pointers (argv, envp).
    pub fn read_pointer_array(&self, addr: u64) -> std::result::Result<Vec<u64>, PathError> {
        let mut out = Vec::new();
        if addr == 0 {
            return Ok(out);
        }
        let mut cursor = addr;
        loop {
            let pointer = self.read_word(cursor)?;
            if pointer == 0 {
                return Ok(out);
            }
            if out.len() >= MAX_VECTOR_LEN {
                return Err(PathError::NameTooLong);
            }
            out.push(pointer);
            cursor += std::mem::size_of::<u64>() as u64;
        }
    }

    /// Read a NULL-terminated array of strings.
    pub fn read_string_array(&self, addr: u64) -> std::result::Result<Vec<Vec<u8>>, PathError> {
        self.read_pointer_array(addr)?
            .into_iter()
            .map(|pointer| self.read_cstring(pointer))
            .collect()
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: data.len(),
        }];
        let local = [IoSlice::new(data)];
        let written = process_vm_writev(self.pid, &local, &remote)
            .map_err(|e| SandboxError::host("process_vm_writev()", e))?;
        if written != data.len() {
            return Err(SandboxError::host(
                "process_vm_writev()",
                std::io::Error::from_raw_os_error(libc::EFAULT),
            ));
        }
        Ok(())
    }
}

/// Bump allocator over the unused stack area below a tracee's stack pointer.
///
/// Valid only while the tracee is stopped inside the syscall being rewritten.
/// The stack pointer belongs to the tracee: an allocation that would wrap
/// below address zero, or land on unmapped memory, fails that one syscall
/// with `EFAULT`.
#[derive(Debug)]
pub struct Scratch {
    memory: TraceeMemory,
    next: u64,
}

impl Scratch {
    pub fn below(memory: TraceeMemory, stack_pointer: u64) -> Self {
        Self {
            memory,
            next: stack_pointer.saturating_sub(RED_ZONE),
        }
    }

    /// Claim `len` bytes, 16-byte aligned, without writing them.
    pub fn reserve(&mut self, len: usize) -> Result<u64> {
        let addr = self
            .next
            .checked_sub(len as u64)
            .map(|addr| addr & !0xf)
            .filter(|&addr| addr > 0)
            .ok_or(PathError::Fault)?;
        self.next = addr;
        Ok(addr)
    }

    /// Copy `data` into the scratch area and return its guest address.
    pub fn push(&mut self, data: &[u8]) -> Result<u64> {
        let addr = self.reserve(data.len())?;
        match self.memory.write_bytes(addr, data) {
            Ok(()) => Ok(addr),
            Err(err) if err.is_vanished_tracee() => Err(err),
            Err(_) => Err(PathError::Fault.into()),
        }
    }

    /// Copy a string, NUL-terminated.
    pub fn push_cstring(&mut self, bytes: &[u8]) -> Result<u64> {
        let mut data = Vec::with_capacity(bytes.len() + 1);
        data.extend_from_slice(bytes);
        data.push(0);
        self.push(&data)
    }

    /// Copy each string and then a NULL-terminated pointer array referencing them.
    pub fn push_string_array(&mut self, strings: &[Vec<u8>]) -> Result<u64> {
        let mut pointers = Vec::with_capacity(strings.len() + 1);
        for string in strings {
            pointers.push(self.push_cstring(string)?);
        }
        pointers.push(0);
        let raw: Vec<u8> = pointers.iter().flat_map(|p| p.to_ne_bytes()).collect();
        self.push(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn own_memory() -> Option<TraceeMemory> {
        let memory = TraceeMemory::new(Pid::this());
        let byte = 0x5au8;
        let readable = memory
            .read_bytes(&byte as *const u8 as u64, 1)
            .map(|bytes| bytes == [0x5a])
            .unwrap_or(false);
        if !readable {
            eprintln!("process_vm_readv unavailable, skipping");
            return None;
        }
        Some(memory)
    }

    #[test]
    fn reads_cstring() {
        let Some(memory) = own_memory() else { return };
        let text = CString::new("/etc/passwd").unwrap();
        let bytes = memory.read_cstring(text.as_ptr() as u64).unwrap();
        assert_eq!(bytes, b"/etc/passwd");
    }

    #[test]
    fn null_pointer_is_a_fault() {
        let Some(memory) = own_memory() else { return };
        assert_eq!(memory.read_cstring(0), Err(PathError::Fault));
    }

    #[test]
    fn overlong_string_is_rejected() {
        let Some(memory) = own_memory() else { return };
        let long = CString::new(vec![b'a'; PATH_MAX + 10]).unwrap();
        assert_eq!(memory.read_cstring(long.as_ptr() as u64), Err(PathError::NameTooLong));
    }

    #[test]
    fn reads_string_array() {
        let Some(memory) = own_memory() else { return };
        let strings = [CString::new("sh").unwrap(), CString::new("-c").unwrap()];
        let pointers = [strings[0].as_ptr() as u64, strings[1].as_ptr() as u64, 0];
        let array = memory.read_string_array(pointers.as_ptr() as u64).unwrap();
        assert_eq!(array, vec![b"sh".to_vec(), b"-c".to_vec()]);
        assert!(memory.read_string_array(0).unwrap().is_empty());
    }

    #[test]
    fn scratch_writes_below_stack_pointer() {
        let Some(memory) = own_memory() else { return };
        let area = vec![0u8; 4096];
        let top = area.as_ptr() as u64 + area.len() as u64;

        let mut scratch = Scratch::below(memory, top);
        let addr = scratch.push_cstring(b"/mnt/guest/etc/passwd").unwrap();
        assert!(addr < top - RED_ZONE);
        assert_eq!(addr % 16, 0);
        assert_eq!(memory.read_cstring(addr).unwrap(), b"/mnt/guest/etc/passwd");

        let argv = scratch
            .push_string_array(&[b"qemu-arm".to_vec(), b"/mnt/guest/hello".to_vec()])
            .unwrap();
        assert!(argv < addr);
        assert_eq!(
            memory.read_string_array(argv).unwrap(),
            vec![b"qemu-arm".to_vec(), b"/mnt/guest/hello".to_vec()]
        );
        drop(area);
    }

    #[test]
    fn scratch_rejects_stack_pointer_near_zero() {
        let memory = TraceeMemory::new(Pid::this());
        let mut scratch = Scratch::below(memory, 0x10);
        let err = scratch.push_cstring(b"/mnt/guest/x").unwrap_err();
        assert!(matches!(err, SandboxError::Path(PathError::Fault)));
        assert!(!err.is_fatal());

        let mut scratch = Scratch::below(memory, RED_ZONE + 8);
        assert!(matches!(scratch.reserve(64), Err(SandboxError::Path(PathError::Fault))));
    }

    #[test]
    fn scratch_write_to_unmapped_stack_fails_the_syscall_only() {
        let Some(memory) = own_memory() else { return };
        // The first page is never mapped.
        let mut scratch = Scratch::below(memory, 0x1000);
        let err = scratch.push_cstring(b"/mnt/guest/x").unwrap_err();
        assert!(matches!(err, SandboxError::Path(PathError::Fault)));
    }
}
