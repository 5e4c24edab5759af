//! Entry/exit tracking for syscall stops.
//!
//! The kernel reports syscall entry and syscall exit with the same trap, so
//! the half a process is in must be tracked on our side.

/// Where a tracee stands with respect to its current syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyscallPhase {
    /// Running user code; the next syscall trap is an entry.
    #[default]
    AwaitingEntry,
    /// Inside a syscall; the next syscall trap is its exit.
    AwaitingExit,
}

/// A decoded stop that may affect the syscall phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Syscall-entry or syscall-exit stop.
    Syscall,
    /// fork/vfork/clone/exec event stop, reported between entry and exit.
    Event,
}

/// What the interceptor has to do for a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Enter,
    Exit,
    Nothing,
}

/// Pure transition function of the per-process phase machine.
pub fn transition(phase: SyscallPhase, trap: Trap) -> (SyscallPhase, Step) {
    match (phase, trap) {
        (SyscallPhase::AwaitingEntry, Trap::Syscall) => (SyscallPhase::AwaitingExit, Step::Enter),
        (SyscallPhase::AwaitingExit, Trap::Syscall) => (SyscallPhase::AwaitingEntry, Step::Exit),
        (phase, Trap::Event) => (phase, Step::Nothing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_traps_alternate() {
        let (phase, step) = transition(SyscallPhase::default(), Trap::Syscall);
        assert_eq!((phase, step), (SyscallPhase::AwaitingExit, Step::Enter));
        let (phase, step) = transition(phase, Trap::Syscall);
        assert_eq!((phase, step), (SyscallPhase::AwaitingEntry, Step::Exit));
    }

    #[test]
    fn events_do_not_toggle() {
        for phase in [SyscallPhase::AwaitingEntry, SyscallPhase::AwaitingExit] {
            assert_eq!(transition(phase, Trap::Event), (phase, Step::Nothing));
        }
    }

    #[test]
    fn execve_sequence() {
        // entry, exec event, exit
        let mut phase = SyscallPhase::AwaitingEntry;
        let mut steps = Vec::new();
        for trap in [Trap::Syscall, Trap::Event, Trap::Syscall] {
            let (next, step) = transition(phase, trap);
            phase = next;
            steps.push(step);
        }
        assert_eq!(steps, [Step::Enter, Step::Nothing, Step::Exit]);
        assert_eq!(phase, SyscallPhase::AwaitingEntry);
    }
}
