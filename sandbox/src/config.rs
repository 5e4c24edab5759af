//! Session configuration, built once and shared by reference.

use crate::error::{Result, SandboxError};
use crate::path::PathTranslator;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Insecure opt-ins relaxing the interception policy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Policy {
    /// Let unclassified syscalls run untranslated instead of failing with ENOSYS.
    pub allow_unknown: bool,
    /// Let the tracee issue ptrace(2) itself instead of failing with EPERM.
    pub allow_ptrace: bool,
}

/// Debug cross-checks run by the supervisor.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Audit {
    /// Check every descriptor of every tracee names a host path the guest may see.
    pub check_fd: bool,
    /// Check /proc/<pid>/syscall agrees with the interceptor's state.
    pub check_syscall: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub paths: PathTranslator,
    /// Program substituted as argument zero of every execve.
    pub runner: Option<PathBuf>,
    pub policy: Policy,
    pub audit: Audit,
}

impl Config {
    pub fn builder(root: impl Into<PathBuf>) -> ConfigBuilder {
        ConfigBuilder::new(root)
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }
}

#[derive(Debug)]
pub struct ConfigBuilder {
    root: PathBuf,
    exclusions: Vec<PathBuf>,
    runner: Option<PathBuf>,
    policy: Policy,
    audit: Audit,
}

impl ConfigBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclusions: Vec::new(),
            runner: None,
            policy: Policy::default(),
            audit: Audit::default(),
        }
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclusions.push(path.into());
        self
    }

    pub fn runner(mut self, runner: Option<PathBuf>) -> Self {
        self.runner = runner;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    /// Validate the root and exclusions and freeze the configuration.
    pub fn build(self) -> Result<Config> {
        let root = std::fs::canonicalize(&self.root).map_err(|e| {
            SandboxError::Usage(format!("invalid root '{}': {e}", self.root.display()))
        })?;
        if !root.is_dir() {
            return Err(SandboxError::Usage(format!(
                "root '{}' is not a directory",
                root.display()
            )));
        }

        let mut paths = PathTranslator::new(&root);
        for path in self.exclusions {
            if !path.is_absolute() {
                return Err(SandboxError::Usage(format!(
                    "excluded path '{}' is not absolute",
                    path.display()
                )));
            }
            paths.exclude(path);
        }

        Ok(Config {
            paths,
            runner: self.runner,
            policy: self.policy,
            audit: self.audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn build_canonicalizes_root() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("guest");
        std::fs::create_dir(&nested).unwrap();

        let config = Config::builder(nested.join("../guest/.")).build().unwrap();
        assert_eq!(config.root(), std::fs::canonicalize(&nested).unwrap());
    }

    #[test]
    fn missing_root_is_a_usage_error() {
        let err = Config::builder("/definitely/not/a/root").build().unwrap_err();
        assert!(matches!(err, SandboxError::Usage(_)));
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        let err = Config::builder(&file).build().unwrap_err();
        assert!(matches!(err, SandboxError::Usage(_)));
    }

    #[test]
    fn exclusions_keep_order_and_must_be_absolute() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder(dir.path())
            .exclude("/proc")
            .exclude("/etc//resolv.conf")
            .exclude("/proc")
            .build()
            .unwrap();
        let entries: Vec<_> = config.paths.exclusions().iter().collect();
        assert_eq!(
            entries,
            [Path::new("/proc"), Path::new("/etc/resolv.conf"), Path::new("/proc")]
        );

        let err = Config::builder(dir.path()).exclude("tmp").build().unwrap_err();
        assert!(matches!(err, SandboxError::Usage(_)));
    }

    #[test]
    fn serializes_effective_configuration() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder(dir.path())
            .exclude("/proc")
            .runner(Some(PathBuf::from("/usr/bin/qemu-arm")))
            .policy(Policy {
                allow_unknown: true,
                allow_ptrace: false,
            })
            .build()
            .unwrap();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["runner"], "/usr/bin/qemu-arm");
        assert_eq!(json["policy"]["allow_unknown"], true);
        assert_eq!(json["audit"]["check_fd"], false);
        assert_eq!(json["paths"]["exclusions"]["entries"][0], "/proc");
        assert_eq!(
            json["paths"]["root"],
            config.root().to_str().unwrap()
        );
    }
}
