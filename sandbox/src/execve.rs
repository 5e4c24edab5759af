//! Program replacement.
//!
//! An execve target is translated like any other path, then the argument
//! vector is rebuilt when a runner is configured or when the target is an
//! interpreter script, since the kernel would otherwise resolve the
//! interpreter line against the host root.

use crate::config::Config;
use crate::error::{PathError, Result};
use crate::path::Follow;
use crate::syscall::memory::Scratch;
use crate::syscall::table::PathArg;
use crate::syscall::Entry;
use std::ffi::OsStr;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bytes of a script the kernel looks at for a `#!` line.
const BINPRM_BUF_SIZE: usize = 256;

/// The program the kernel should run, with its argument vector and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub target: PathBuf,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
}

/// Parsed `#!` line of an interpreter script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shebang {
    pub interpreter: Vec<u8>,
    pub argument: Option<Vec<u8>>,
}

/// Compute what the kernel must execute for a guest `execve(guest, argv, envp)`.
///
/// `cwd` is the guest directory a relative `guest` starts from.
pub fn plan(
    config: &Config,
    guest: &Path,
    cwd: &Path,
    follow: Follow,
    argv: Vec<Vec<u8>>,
    envp: Vec<Vec<u8>>,
) -> std::result::Result<ExecPlan, PathError> {
    let host = config.paths.translate(guest, cwd, follow)?;
    let envp = rewrite_env(config, envp);
    let rest = argv.iter().skip(1).cloned();

    if let Some(runner) = &config.runner {
        let mut new_argv = vec![
            runner.as_os_str().as_bytes().to_vec(),
            host.as_os_str().as_bytes().to_vec(),
        ];
        new_argv.extend(rest);
        return Ok(ExecPlan {
            target: runner.clone(),
            argv: new_argv,
            envp,
        });
    }

    if let Some(shebang) = read_shebang(&host) {
        let interpreter = Path::new(OsStr::from_bytes(&shebang.interpreter));
        let target = config.paths.translate(interpreter, cwd, Follow::Yes)?;
        debug!(
            script = %guest.display(),
            interpreter = %interpreter.display(),
            "interpreter script"
        );
        let script = cwd.join(guest);
        let mut new_argv = vec![shebang.interpreter];
        new_argv.extend(shebang.argument);
        new_argv.push(script.as_os_str().as_bytes().to_vec());
        new_argv.extend(rest);
        return Ok(ExecPlan {
            target,
            argv: new_argv,
            envp,
        });
    }

    Ok(ExecPlan {
        target: host,
        argv,
        envp,
    })
}

/// Parse the `#!` line at the start of `head`.
pub fn parse_shebang(head: &[u8]) -> Option<Shebang> {
    let line = head.strip_prefix(b"#!")?;
    let line = match line.iter().position(|&b| b == b'\n') {
        Some(end) => &line[..end],
        None => line,
    };
    let is_blank = |b: &u8| *b == b' ' || *b == b'\t';
    let start = line.iter().position(|b| !is_blank(b))?;
    let line = &line[start..];
    let end = line.iter().rposition(|b| !is_blank(b))?;
    let line = &line[..=end];

    match line.iter().position(is_blank) {
        None => Some(Shebang {
            interpreter: line.to_vec(),
            argument: None,
        }),
        Some(split) => {
            let rest = &line[split..];
            let arg_start = rest.iter().position(|b| !is_blank(b))?;
            Some(Shebang {
                interpreter: line[..split].to_vec(),
                argument: Some(rest[arg_start..].to_vec()),
            })
        }
    }
}

fn read_shebang(host: &Path) -> Option<Shebang> {
    let file = std::fs::File::open(host).ok()?;
    let mut head = Vec::with_capacity(BINPRM_BUF_SIZE);
    file.take(BINPRM_BUF_SIZE as u64).read_to_end(&mut head).ok()?;
    parse_shebang(&head)
}

/// Rewrite `PWD=`/`OLDPWD=` entries holding host paths under the root.
fn rewrite_env(config: &Config, envp: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    envp.into_iter()
        .map(|entry| {
            for key in [&b"PWD="[..], &b"OLDPWD="[..]] {
                if let Some(value) = entry.strip_prefix(key) {
                    let value = Path::new(OsStr::from_bytes(value));
                    if let Ok(rest) = value.strip_prefix(config.root()) {
                        let guest = Path::new("/").join(rest);
                        let mut rewritten = key.to_vec();
                        rewritten.extend_from_slice(guest.as_os_str().as_bytes());
                        return rewritten;
                    }
                }
            }
            entry
        })
        .collect()
}

/// Entry-stop handling of execve and execveat.
pub(crate) fn enter(entry: &mut Entry<'_>, scratch: &mut Scratch, arg: &PathArg) -> Result<()> {
    let Some(guest) = entry.read_path(arg)? else {
        return Ok(());
    };
    let Some(cwd) = entry.base_dir(arg, &guest) else {
        return Ok(());
    };
    let args = *entry.args();
    let memory = entry.memory();
    let argv = memory.read_string_array(args[arg.path + 1])?;
    let envp = memory.read_string_array(args[arg.path + 2])?;

    let plan = plan(entry.config, &guest, &cwd, arg.follow(&args), argv, envp)?;
    info!(
        pid = %entry.pid,
        program = %guest.display(),
        target = %plan.target.display(),
        "execve"
    );

    let path = scratch.push_cstring(plan.target.as_os_str().as_bytes())?;
    let argv = scratch.push_string_array(&plan.argv)?;
    let envp = scratch.push_string_array(&plan.envp)?;
    entry.regs.set_arg(arg.path, path);
    entry.regs.set_arg(arg.path + 1, argv);
    entry.regs.set_arg(arg.path + 2, envp);
    entry.pending.mark_execve();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    /// Plan an exec of absolute `program` from `/`.
    fn plan_from_root(
        config: &Config,
        program: &str,
        argv: Vec<Vec<u8>>,
        envp: Vec<Vec<u8>>,
    ) -> std::result::Result<ExecPlan, PathError> {
        plan(config, Path::new(program), Path::new("/"), Follow::Yes, argv, envp)
    }

    #[test]
    fn runner_becomes_argument_zero() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder(dir.path())
            .runner(Some(PathBuf::from("/usr/bin/qemu-arm")))
            .build()
            .unwrap();
        let root = config.root().to_path_buf();

        let plan = plan(
            &config,
            Path::new("./hello"),
            Path::new("/"),
            Follow::Yes,
            strings(&["./hello", "-v", "world"]),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(plan.target, PathBuf::from("/usr/bin/qemu-arm"));
        let host = root.join("hello");
        assert_eq!(
            plan.argv,
            vec![
                b"/usr/bin/qemu-arm".to_vec(),
                host.as_os_str().as_bytes().to_vec(),
                b"-v".to_vec(),
                b"world".to_vec(),
            ]
        );
    }

    #[test]
    fn plain_exec_keeps_argv() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/true"), b"\x7fELF").unwrap();
        let config = Config::builder(dir.path()).build().unwrap();

        let argv = strings(&["true"]);
        let plan = plan_from_root(&config, "/bin/true", argv.clone(), Vec::new()).unwrap();
        assert_eq!(plan.target, config.root().join("bin/true"));
        assert_eq!(plan.argv, argv);
    }

    #[test]
    fn interpreter_script_is_redirected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        fs::write(dir.path().join("home/run.sh"), b"#!/bin/sh -e\necho hi\n").unwrap();
        let config = Config::builder(dir.path()).build().unwrap();

        let plan = plan(
            &config,
            Path::new("run.sh"),
            Path::new("/home"),
            Follow::Yes,
            strings(&["./run.sh", "arg"]),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(plan.target, config.root().join("bin/sh"));
        assert_eq!(plan.argv, strings(&["/bin/sh", "-e", "/home/run.sh", "arg"]));
    }

    #[test]
    fn runner_skips_script_detection() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("run.sh"), b"#!/bin/sh\n").unwrap();
        let config = Config::builder(dir.path())
            .runner(Some(PathBuf::from("/usr/bin/qemu-arm")))
            .build()
            .unwrap();

        let plan = plan_from_root(&config, "/run.sh", strings(&["run.sh"]), Vec::new()).unwrap();
        assert_eq!(plan.target, PathBuf::from("/usr/bin/qemu-arm"));
        assert_eq!(plan.argv.len(), 2);
    }

    #[test]
    fn excluded_program_runs_from_host() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder(dir.path()).exclude("/usr").build().unwrap();
        let plan = plan_from_root(&config, "/usr/bin/env", strings(&["env"]), Vec::new()).unwrap();
        assert_eq!(plan.target, PathBuf::from("/usr/bin/env"));
    }

    #[test]
    fn working_directory_variables_are_rewritten() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder(dir.path()).build().unwrap();
        let root = config.root().display().to_string();

        let envp = vec![
            format!("PWD={root}/home/user").into_bytes(),
            format!("OLDPWD={root}").into_bytes(),
            b"PWD_NOT=/x".to_vec(),
            b"HOME=/home/user".to_vec(),
            b"OLDPWD=/tmp".to_vec(),
        ];
        let plan = plan_from_root(&config, "/bin/sh", Vec::new(), envp).unwrap();
        assert_eq!(
            plan.envp,
            strings(&["PWD=/home/user", "OLDPWD=/", "PWD_NOT=/x", "HOME=/home/user", "OLDPWD=/tmp"])
        );
    }

    #[test]
    fn looping_target_fails() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/a", dir.path().join("a")).unwrap();
        let config = Config::builder(dir.path()).build().unwrap();
        let err = plan_from_root(&config, "/a", Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(err, PathError::Loop);
    }

    #[test]
    fn shebang_parsing() {
        assert_eq!(
            parse_shebang(b"#!/bin/sh\n"),
            Some(Shebang { interpreter: b"/bin/sh".to_vec(), argument: None })
        );
        assert_eq!(
            parse_shebang(b"#! /usr/bin/env  python3 -u \nprint()"),
            Some(Shebang {
                interpreter: b"/usr/bin/env".to_vec(),
                argument: Some(b"python3 -u".to_vec()),
            })
        );
        assert_eq!(
            parse_shebang(b"#!/bin/bash"),
            Some(Shebang { interpreter: b"/bin/bash".to_vec(), argument: None })
        );
        assert_eq!(parse_shebang(b"#!   \n"), None);
        assert_eq!(parse_shebang(b"\x7fELF\x02\x01"), None);
        assert_eq!(parse_shebang(b""), None);
    }
}
