//! Error taxonomy of the sandbox.
//!
//! Only host-level failures are fatal to a session. Every other error is
//! turned into a single failed syscall inside the guest, or into a warning.

use std::fmt;
use thiserror::Error;

/// Report category, used to tag diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Malformed invocation or user-supplied input.
    User,
    /// A host system call the supervisor depends on.
    System,
    /// The supervisor's own bookkeeping disagrees with what it observes.
    Internal,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::User => write!(f, "user"),
            Category::System => write!(f, "system"),
            Category::Internal => write!(f, "internal"),
        }
    }
}

/// A guest path could not be turned into a usable host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("too many levels of symbolic links")]
    Loop,
    #[error("path name too long")]
    NameTooLong,
    #[error("bad address")]
    Fault,
}

impl PathError {
    /// The errno the tracee observes for this failure.
    pub fn errno(self) -> i32 {
        match self {
            PathError::Loop => libc::ELOOP,
            PathError::NameTooLong => libc::ENAMETOOLONG,
            PathError::Fault => libc::EFAULT,
        }
    }
}

/// A syscall refused by the interception policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("unknown syscall {0}")]
    UnknownSyscall(i64),
    #[error("nested ptrace denied")]
    NestedTrace,
}

impl PolicyViolation {
    pub fn errno(self) -> i32 {
        match self {
            PolicyViolation::UnknownSyscall(_) => libc::ENOSYS,
            PolicyViolation::NestedTrace => libc::EPERM,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Usage(String),

    #[error("{op}: {source}")]
    HostSystem {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("{0}")]
    Internal(String),

    #[error("process table exhausted")]
    Exhausted,
}

impl SandboxError {
    pub fn host(op: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        SandboxError::HostSystem {
            op: op.into(),
            source: source.into(),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            SandboxError::Usage(_) | SandboxError::Policy(_) => Category::User,
            SandboxError::HostSystem { .. } | SandboxError::Exhausted => Category::System,
            SandboxError::Path(_) => Category::User,
            SandboxError::Internal(_) => Category::Internal,
        }
    }

    /// Fatal errors end the whole session: the tracees would be left unsupervised.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::HostSystem { .. } | SandboxError::Exhausted
        )
    }

    /// True when a host call failed because the tracee is already gone.
    pub fn is_vanished_tracee(&self) -> bool {
        match self {
            SandboxError::HostSystem { source, .. } => {
                source.raw_os_error() == Some(libc::ESRCH)
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Log a non-fatal error with its category.
pub fn report(err: &SandboxError) {
    tracing::warn!(category = %err.category(), "{err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_host_errors_are_fatal() {
        let no_child = std::io::Error::from_raw_os_error(libc::ECHILD);
        assert!(SandboxError::host("wait()", no_child).is_fatal());
        assert!(SandboxError::Exhausted.is_fatal());
        assert!(!SandboxError::Path(PathError::Loop).is_fatal());
        assert!(!SandboxError::Policy(PolicyViolation::NestedTrace).is_fatal());
        assert!(!SandboxError::Internal("unknown trace event".into()).is_fatal());
        assert!(!SandboxError::Usage("missing root".into()).is_fatal());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(PathError::Loop.errno(), libc::ELOOP);
        assert_eq!(PathError::Fault.errno(), libc::EFAULT);
        assert_eq!(PolicyViolation::UnknownSyscall(999).errno(), libc::ENOSYS);
        assert_eq!(PolicyViolation::NestedTrace.errno(), libc::EPERM);
    }

    #[test]
    fn vanished_tracee_detection() {
        let gone =
            SandboxError::host("ptrace(SYSCALL)", std::io::Error::from_raw_os_error(libc::ESRCH));
        assert!(gone.is_vanished_tracee());
        assert_eq!(gone.category(), Category::System);
        assert!(!SandboxError::Exhausted.is_vanished_tracee());
    }
}
