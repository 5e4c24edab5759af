//! Debug cross-checks against the kernel's own view of the tracees.

use crate::config::Config;
use crate::error::{report, Result, SandboxError};
use crate::registry::{Registry, TracedProcess};
use nix::unistd::Pid;
use std::path::PathBuf;
use tracing::debug;

/// Check every descriptor of every tracee names a host path the guest may see.
pub fn check_fds(config: &Config, registry: &Registry) {
    registry.for_each(|process| {
        for err in fd_mismatches(config, process) {
            report(&err);
        }
    });
}

fn fd_mismatches(config: &Config, process: &TracedProcess) -> Vec<SandboxError> {
    let pid = process.pid();
    let Ok(dir) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
        // Gone, or not ours to look at; the next wait says which.
        return Vec::new();
    };

    let mut problems = Vec::new();
    for entry in dir.flatten() {
        let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        // Pipes, sockets and anonymous inodes are not paths.
        if !target.is_absolute() {
            continue;
        }
        if !config.paths.is_visible(&target) {
            problems.push(SandboxError::Internal(format!(
                "pid {pid}: fd {fd} refers to {} outside the guest",
                target.display()
            )));
        }
        if let Some(recorded) = process.fds.get(fd) {
            if recorded.path() != target {
                debug!(
                    pid = %pid,
                    fd,
                    recorded = %recorded.path().display(),
                    actual = %target.display(),
                    "descriptor table disagrees with /proc"
                );
            }
        }
    }
    problems
}

/// Compare the kernel's idea of the current syscall with `believed`.
pub fn check_syscall(pid: Pid, believed: i64) -> Result<()> {
    let path = PathBuf::from(format!("/proc/{pid}/syscall"));
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(_) => return Ok(()),
    };
    match parse_proc_syscall(&contents) {
        Some(actual) if actual == believed => Ok(()),
        Some(actual) => Err(SandboxError::Internal(format!(
            "pid {pid}: interceptor believes syscall {believed}, kernel reports {actual}"
        ))),
        None => Err(SandboxError::Internal(format!(
            "pid {pid}: unexpected {}: {:?}",
            path.display(),
            contents.trim()
        ))),
    }
}

/// First field of /proc/<pid>/syscall: the syscall number, `-1` outside a syscall.
fn parse_proc_syscall(contents: &str) -> Option<i64> {
    contents.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdtable::FdEntry;
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    #[test]
    fn parses_proc_syscall() {
        let line = "257 0xffffff9c 0x7ffd 0x0 0x0 0x0 0x0 0x7ffd 0x7f\n";
        assert_eq!(parse_proc_syscall(line), Some(257));
        assert_eq!(parse_proc_syscall("-1 0x7ffd 0x7f\n"), Some(-1));
        assert_eq!(parse_proc_syscall("running\n"), None);
        assert_eq!(parse_proc_syscall(""), None);
    }

    #[test]
    fn descriptors_outside_the_guest_are_reported() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let config = Config::builder(root.path()).build().unwrap();

        let inside = File::create(config.root().join("inside")).unwrap();
        let escaped_path = outside.path().canonicalize().unwrap().join("escaped");
        let escaped = File::create(&escaped_path).unwrap();

        let mut registry = Registry::new();
        registry.register(Pid::this()).unwrap();
        let process = registry.get(Pid::this()).unwrap();

        let problems = fd_mismatches(&config, process);
        let messages: Vec<String> = problems.iter().map(|e| e.to_string()).collect();
        let fd = escaped.as_raw_fd();
        assert!(
            messages.iter().any(|m| m.contains(&format!("fd {fd} ")) && m.contains("escaped")),
            "{messages:?}"
        );
        let inside_fd = inside.as_raw_fd();
        assert!(!messages.iter().any(|m| m.contains(&format!("fd {inside_fd} "))));
    }

    #[test]
    fn excluded_descriptors_are_visible() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let outside_path = outside.path().canonicalize().unwrap();
        let config = Config::builder(root.path()).exclude(&outside_path).build().unwrap();

        let file = File::create(outside_path.join("shared")).unwrap();
        let mut registry = Registry::new();
        let process = registry.register(Pid::this()).unwrap();
        process.fds.insert(file.as_raw_fd(), FdEntry::new(outside_path.join("shared"), false));

        let fd = file.as_raw_fd();
        let problems = fd_mismatches(&config, registry.get(Pid::this()).unwrap());
        assert!(!problems.iter().any(|e| e.to_string().contains(&format!("fd {fd} "))));
    }

    #[test]
    fn syscall_check_tolerates_missing_process() {
        // pid 0 has no /proc entry.
        assert!(check_syscall(Pid::from_raw(0), 0).is_ok());
    }
}
