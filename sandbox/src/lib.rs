pub mod config;
pub mod error;
pub mod fdtable;
pub mod path;

#[cfg(target_os = "linux")]
pub mod audit;
#[cfg(target_os = "linux")]
pub mod event;
#[cfg(target_os = "linux")]
pub mod execve;
#[cfg(target_os = "linux")]
pub mod launcher;
#[cfg(target_os = "linux")]
pub mod registry;
#[cfg(target_os = "linux")]
pub mod supervisor;
#[cfg(target_os = "linux")]
pub mod syscall;

pub use config::{Audit, Config, ConfigBuilder, Policy};
pub use error::{report, Category, PathError, PolicyViolation, Result, SandboxError};
pub use fdtable::{FdEntry, FdTable};
pub use path::{ExclusionSet, Follow, PathTranslator};

#[cfg(target_os = "linux")]
pub use launcher::{is_launcher, run_launcher};
#[cfg(target_os = "linux")]
pub use registry::{Registry, TracedProcess};
#[cfg(target_os = "linux")]
pub use supervisor::Supervisor;
