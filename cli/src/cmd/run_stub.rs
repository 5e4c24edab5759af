use super::RunOptions;
use anyhow::Result;

/// Run a program inside the guest root.
pub fn handle_run_command(_options: RunOptions) -> Result<i32> {
    anyhow::bail!("proot relies on ptrace and is only available on Linux")
}
