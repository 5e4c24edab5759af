//! Decoding of raw wait statuses into trace events.

use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// What the supervisor knows about a process before decoding its stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopContext {
    pub options_installed: bool,
    pub awaiting_initial_stop: bool,
}

/// A trace notification, decoded once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Exited { pid: Pid, code: i32 },
    Signaled { pid: Pid, signal: Signal },
    Continued { pid: Pid },
    SyscallTrap { pid: Pid },
    /// First stop of a lineage member: post-exec SIGTRAP of the launched
    /// process, or the initial SIGSTOP of an auto-attached child.
    FirstStop { pid: Pid },
    ForkEvent { pid: Pid },
    VforkEvent { pid: Pid },
    CloneEvent { pid: Pid },
    ExecEvent { pid: Pid },
    OtherSignal { pid: Pid, signal: Signal },
}

impl TraceEvent {
    /// Decode `status`; `None` for shapes the supervisor never asks for.
    pub fn decode(status: WaitStatus, context: StopContext) -> Option<Self> {
        let event = match status {
            WaitStatus::Exited(pid, code) => TraceEvent::Exited { pid, code },
            WaitStatus::Signaled(pid, signal, _) => TraceEvent::Signaled { pid, signal },
            WaitStatus::Continued(pid) => TraceEvent::Continued { pid },
            WaitStatus::PtraceSyscall(pid) => TraceEvent::SyscallTrap { pid },
            WaitStatus::PtraceEvent(pid, _, event) => match event {
                e if e == Event::PTRACE_EVENT_FORK as i32 => TraceEvent::ForkEvent { pid },
                e if e == Event::PTRACE_EVENT_VFORK as i32 => TraceEvent::VforkEvent { pid },
                e if e == Event::PTRACE_EVENT_CLONE as i32 => TraceEvent::CloneEvent { pid },
                e if e == Event::PTRACE_EVENT_EXEC as i32 => TraceEvent::ExecEvent { pid },
                _ => return None,
            },
            WaitStatus::Stopped(pid, Signal::SIGTRAP) if !context.options_installed => {
                TraceEvent::FirstStop { pid }
            }
            WaitStatus::Stopped(pid, Signal::SIGSTOP) if context.awaiting_initial_stop => {
                TraceEvent::FirstStop { pid }
            }
            WaitStatus::Stopped(pid, signal) => TraceEvent::OtherSignal { pid, signal },
            WaitStatus::StillAlive => return None,
        };
        Some(event)
    }

    pub fn pid(&self) -> Pid {
        match *self {
            TraceEvent::Exited { pid, .. }
            | TraceEvent::Signaled { pid, .. }
            | TraceEvent::Continued { pid }
            | TraceEvent::SyscallTrap { pid }
            | TraceEvent::FirstStop { pid }
            | TraceEvent::ForkEvent { pid }
            | TraceEvent::VforkEvent { pid }
            | TraceEvent::CloneEvent { pid }
            | TraceEvent::ExecEvent { pid }
            | TraceEvent::OtherSignal { pid, .. } => pid,
        }
    }
}
