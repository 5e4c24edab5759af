//! Live tracee bookkeeping.

use crate::error::{Result, SandboxError};
use crate::fdtable::FdTable;
use crate::syscall::phase::SyscallPhase;
use crate::syscall::PendingExit;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Syscall number and raw arguments decoded at the last syscall entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallSnapshot {
    pub nr: i64,
    pub args: [u64; 6],
}

/// Per-tracee state.
#[derive(Debug)]
pub struct TracedProcess {
    pid: Pid,
    pub phase: SyscallPhase,
    pub snapshot: Option<SyscallSnapshot>,
    /// Signal delivered on the next resume.
    pub pending_signal: Option<Signal>,
    /// Trace options are set on this process, or inherited from its parent.
    pub options_installed: bool,
    /// Auto-attached child whose initial SIGSTOP has not been seen yet.
    pub awaiting_initial_stop: bool,
    /// Still running the launcher; syscalls pass through until its first execve.
    pub bootstrap: bool,
    pub fds: FdTable,
    pub(crate) pending: Option<PendingExit>,
}

impl TracedProcess {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            phase: SyscallPhase::default(),
            snapshot: None,
            pending_signal: None,
            options_installed: false,
            awaiting_initial_stop: false,
            bootstrap: false,
            fds: FdTable::new(),
            pending: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Take over the identity of `pid` (exec by a non-leader thread).
    pub(crate) fn rename(&mut self, pid: Pid) {
        self.pid = pid;
    }
}

/// Map of live tracees, owned by the supervisor.
#[derive(Debug, Default)]
pub struct Registry {
    processes: HashMap<Pid, TracedProcess>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry in the `AwaitingEntry` phase.
    ///
    /// An entry already present for `pid` is replaced: the kernel reuses
    /// pids only after the previous owner was reaped.
    pub fn register(&mut self, pid: Pid) -> Result<&mut TracedProcess> {
        self.processes
            .try_reserve(1)
            .map_err(|_| SandboxError::Exhausted)?;
        self.processes.insert(pid, TracedProcess::new(pid));
        self.processes
            .get_mut(&pid)
            .ok_or_else(|| SandboxError::Internal(format!("pid {pid} vanished from registry")))
    }

    /// Put back an entry taken out with [`Registry::unregister`], under its current pid.
    pub(crate) fn reinsert(&mut self, process: TracedProcess) {
        self.processes.insert(process.pid(), process);
    }

    pub fn unregister(&mut self, pid: Pid) -> Option<TracedProcess> {
        self.processes.remove(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&TracedProcess> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TracedProcess> {
        self.processes.get_mut(&pid)
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&TracedProcess)) {
        for process in self.processes.values() {
            visitor(process);
        }
    }

    pub fn count(&self) -> usize {
        self.processes.len()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    proptest! {
        /// count() always equals the number of distinct pids registered and not yet unregistered.
        #[test]
        fn count_matches_model(ops in prop::collection::vec((any::<bool>(), 1i32..32), 0..64)) {
            let mut registry = Registry::new();
            let mut live = HashSet::new();
            for (add, raw) in ops {
                let pid = Pid::from_raw(raw);
                if add {
                    registry.register(pid).unwrap();
                    live.insert(raw);
                } else {
                    registry.unregister(pid);
                    live.remove(&raw);
                }
                prop_assert_eq!(registry.count(), live.len());
            }
            let mut visited = HashSet::new();
            registry.for_each(|p| { visited.insert(p.pid().as_raw()); });
            prop_assert_eq!(visited, live);
        }
    }
}
