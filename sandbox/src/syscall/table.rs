//! Syscall classification by number.
//!
//! Every syscall the interceptor knows about appears here. Anything else is
//! unknown and subject to the `allow_unknown` policy.

use crate::path::Follow;
use libc::c_long;

/// How to decide whether the last component of a path argument is dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowRule {
    Always,
    Never,
    /// Follow unless `flag` is set in argument `arg` (AT_SYMLINK_NOFOLLOW style).
    UnlessFlag { arg: usize, flag: u64 },
    /// Follow only when `flag` is set in argument `arg` (AT_SYMLINK_FOLLOW style).
    IfFlag { arg: usize, flag: u64 },
    /// open(2) flags in argument `arg`: O_NOFOLLOW or O_CREAT|O_EXCL keep the link.
    OpenFlags { arg: usize },
}

/// Position of one path argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathArg {
    /// Argument holding the path pointer.
    pub path: usize,
    /// Argument holding the directory descriptor relative paths start from.
    pub dirfd: Option<usize>,
    pub follow: FollowRule,
}

impl PathArg {
    const fn plain(path: usize, follow: FollowRule) -> Self {
        Self {
            path,
            dirfd: None,
            follow,
        }
    }

    const fn at(dirfd: usize, path: usize, follow: FollowRule) -> Self {
        Self {
            path,
            dirfd: Some(dirfd),
            follow,
        }
    }

    pub fn follow(&self, args: &[u64; 6]) -> Follow {
        let follows = match self.follow {
            FollowRule::Always => true,
            FollowRule::Never => false,
            FollowRule::UnlessFlag { arg, flag } => args[arg] & flag == 0,
            FollowRule::IfFlag { arg, flag } => args[arg] & flag != 0,
            FollowRule::OpenFlags { arg } => {
                let flags = args[arg];
                let nofollow = flags & libc::O_NOFOLLOW as u64 != 0;
                let excl = libc::O_CREAT as u64 | libc::O_EXCL as u64;
                !nofollow && flags & excl != excl
            }
        };
        if follows {
            Follow::Yes
        } else {
            Follow::No
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallClass {
    /// Known, no path argument.
    Passthrough,
    SinglePath(PathArg),
    MultiplePaths(&'static [PathArg]),
    /// Program replacement; the path names the program.
    Execve(PathArg),
    /// A socket address that may name an AF_UNIX path.
    SocketAddress(SockArg),
    Ptrace,
}

/// Where a syscall keeps its socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockArg {
    /// `struct sockaddr *` in argument `addr`, its length in argument `len`.
    Direct { addr: usize, len: usize, follow: Follow },
    /// `struct msghdr *` in argument `msg`; the address is its `msg_name`.
    Message { msg: usize },
}

/// Work left for the syscall-exit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitHook {
    Nothing,
    /// The result is a link target written to the buffer in argument `buf`.
    Readlink { buf: usize },
    Getcwd,
    /// A descriptor was opened from the translated path; open(2) flags in `flags`.
    Open { flags: Option<usize> },
    /// openat2(2): flags live in the `struct open_how` pointed to by `how`.
    Openat2 { how: usize },
    /// A descriptor was duplicated from argument 0; O_CLOEXEC in `flags` if any.
    Dup { flags: Option<usize> },
    Fcntl,
    Close,
    CloseRange,
}

const NOFOLLOW: u64 = libc::AT_SYMLINK_NOFOLLOW as u64;
const FOLLOW: u64 = libc::AT_SYMLINK_FOLLOW as u64;

/// `*at` syscalls taking AT_SYMLINK_NOFOLLOW in argument `arg`.
const fn unless_nofollow(arg: usize) -> FollowRule {
    FollowRule::UnlessFlag {
        arg,
        flag: NOFOLLOW,
    }
}

const RENAMEAT: &[PathArg] = &[
    PathArg::at(0, 1, FollowRule::Never),
    PathArg::at(2, 3, FollowRule::Never),
];
const LINKAT: &[PathArg] = &[
    PathArg::at(0, 1, FollowRule::IfFlag { arg: 4, flag: FOLLOW }),
    PathArg::at(2, 3, FollowRule::Never),
];
#[cfg(target_arch = "x86_64")]
const RENAME: &[PathArg] = &[
    PathArg::plain(0, FollowRule::Never),
    PathArg::plain(1, FollowRule::Never),
];

/// Classify a syscall, or `None` when it is unknown.
pub fn classify(nr: i64) -> Option<SyscallClass> {
    use FollowRule::*;
    use SyscallClass::*;

    let class = match nr as c_long {
        libc::SYS_ptrace => Ptrace,

        libc::SYS_execve => Execve(PathArg::plain(0, Always)),
        libc::SYS_execveat => Execve(PathArg::at(0, 1, unless_nofollow(4))),

        libc::SYS_bind => SocketAddress(SockArg::Direct {
            addr: 1,
            len: 2,
            follow: Follow::No,
        }),
        libc::SYS_connect => SocketAddress(SockArg::Direct {
            addr: 1,
            len: 2,
            follow: Follow::Yes,
        }),
        libc::SYS_sendto => SocketAddress(SockArg::Direct {
            addr: 4,
            len: 5,
            follow: Follow::Yes,
        }),
        libc::SYS_sendmsg => SocketAddress(SockArg::Message { msg: 1 }),

        libc::SYS_openat => SinglePath(PathArg::at(0, 1, OpenFlags { arg: 2 })),
        libc::SYS_openat2 => SinglePath(PathArg::at(0, 1, Always)),
        libc::SYS_newfstatat => SinglePath(PathArg::at(0, 1, unless_nofollow(3))),
        libc::SYS_statx => SinglePath(PathArg::at(0, 1, unless_nofollow(2))),
        libc::SYS_faccessat => SinglePath(PathArg::at(0, 1, Always)),
        libc::SYS_faccessat2 => SinglePath(PathArg::at(0, 1, unless_nofollow(3))),
        libc::SYS_fchmodat => SinglePath(PathArg::at(0, 1, Always)),
        libc::SYS_fchownat => SinglePath(PathArg::at(0, 1, unless_nofollow(4))),
        libc::SYS_utimensat => SinglePath(PathArg::at(0, 1, unless_nofollow(3))),
        libc::SYS_mkdirat => SinglePath(PathArg::at(0, 1, Never)),
        libc::SYS_mknodat => SinglePath(PathArg::at(0, 1, Never)),
        libc::SYS_unlinkat => SinglePath(PathArg::at(0, 1, Never)),
        libc::SYS_readlinkat => SinglePath(PathArg::at(0, 1, Never)),
        // The link target (argument 0) is stored verbatim.
        libc::SYS_symlinkat => SinglePath(PathArg::at(1, 2, Never)),
        libc::SYS_name_to_handle_at => {
            SinglePath(PathArg::at(0, 1, IfFlag { arg: 4, flag: FOLLOW }))
        }
        libc::SYS_renameat | libc::SYS_renameat2 => MultiplePaths(RENAMEAT),
        libc::SYS_linkat => MultiplePaths(LINKAT),

        libc::SYS_chdir | libc::SYS_truncate | libc::SYS_statfs => {
            SinglePath(PathArg::plain(0, Always))
        }
        libc::SYS_getxattr | libc::SYS_setxattr | libc::SYS_listxattr | libc::SYS_removexattr => {
            SinglePath(PathArg::plain(0, Always))
        }
        libc::SYS_lgetxattr
        | libc::SYS_lsetxattr
        | libc::SYS_llistxattr
        | libc::SYS_lremovexattr => SinglePath(PathArg::plain(0, Never)),
        libc::SYS_inotify_add_watch => SinglePath(PathArg::plain(
            1,
            UnlessFlag {
                arg: 2,
                flag: libc::IN_DONT_FOLLOW as u64,
            },
        )),

        #[cfg(target_arch = "x86_64")]
        libc::SYS_open => SinglePath(PathArg::plain(0, OpenFlags { arg: 1 })),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_creat
        | libc::SYS_stat
        | libc::SYS_access
        | libc::SYS_chmod
        | libc::SYS_chown
        | libc::SYS_utime
        | libc::SYS_utimes
        | libc::SYS_uselib => SinglePath(PathArg::plain(0, Always)),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_lstat
        | libc::SYS_readlink
        | libc::SYS_mkdir
        | libc::SYS_rmdir
        | libc::SYS_unlink
        | libc::SYS_lchown
        | libc::SYS_mknod => SinglePath(PathArg::plain(0, Never)),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_symlink => SinglePath(PathArg::plain(1, Never)),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_futimesat => SinglePath(PathArg::at(0, 1, Always)),
        #[cfg(target_arch = "x86_64")]
        libc::SYS_rename | libc::SYS_link => MultiplePaths(RENAME),

        nr if is_passthrough(nr) => Passthrough,
        _ => return None,
    };
    Some(class)
}

/// Work the exit stop has to do for `nr`.
pub fn exit_hook(nr: i64) -> ExitHook {
    match nr as c_long {
        libc::SYS_readlinkat => ExitHook::Readlink { buf: 2 },
        libc::SYS_getcwd => ExitHook::Getcwd,
        libc::SYS_openat => ExitHook::Open { flags: Some(2) },
        libc::SYS_openat2 => ExitHook::Openat2 { how: 2 },
        libc::SYS_dup => ExitHook::Dup { flags: None },
        libc::SYS_dup3 => ExitHook::Dup { flags: Some(2) },
        libc::SYS_fcntl => ExitHook::Fcntl,
        libc::SYS_close => ExitHook::Close,
        libc::SYS_close_range => ExitHook::CloseRange,
        #[cfg(target_arch = "x86_64")]
        libc::SYS_readlink => ExitHook::Readlink { buf: 1 },
        #[cfg(target_arch = "x86_64")]
        libc::SYS_open => ExitHook::Open { flags: Some(1) },
        #[cfg(target_arch = "x86_64")]
        libc::SYS_creat => ExitHook::Open { flags: None },
        #[cfg(target_arch = "x86_64")]
        libc::SYS_dup2 => ExitHook::Dup { flags: None },
        _ => ExitHook::Nothing,
    }
}

fn is_passthrough(nr: c_long) -> bool {
    matches!(
        nr,
        libc::SYS_read
            | libc::SYS_write
            | libc::SYS_close
            | libc::SYS_fstat
            | libc::SYS_lseek
            | libc::SYS_mmap
            | libc::SYS_mprotect
            | libc::SYS_munmap
            | libc::SYS_brk
            | libc::SYS_rt_sigaction
            | libc::SYS_rt_sigprocmask
            | libc::SYS_rt_sigreturn
            | libc::SYS_ioctl
            | libc::SYS_pread64
            | libc::SYS_pwrite64
            | libc::SYS_readv
            | libc::SYS_writev
            | libc::SYS_sched_yield
            | libc::SYS_mremap
            | libc::SYS_msync
            | libc::SYS_mincore
            | libc::SYS_madvise
            | libc::SYS_shmget
            | libc::SYS_shmat
            | libc::SYS_shmctl
            | libc::SYS_shmdt
            | libc::SYS_dup
            | libc::SYS_dup3
            | libc::SYS_nanosleep
            | libc::SYS_getitimer
            | libc::SYS_setitimer
            | libc::SYS_getpid
            | libc::SYS_sendfile
            | libc::SYS_socket
            | libc::SYS_accept
            | libc::SYS_accept4
            | libc::SYS_recvfrom
            | libc::SYS_recvmsg
            | libc::SYS_sendmmsg
            | libc::SYS_recvmmsg
            | libc::SYS_shutdown
            | libc::SYS_listen
            | libc::SYS_getsockname
            | libc::SYS_getpeername
            | libc::SYS_socketpair
            | libc::SYS_setsockopt
            | libc::SYS_getsockopt
            | libc::SYS_clone
            | libc::SYS_clone3
            | libc::SYS_exit
            | libc::SYS_exit_group
            | libc::SYS_wait4
            | libc::SYS_waitid
            | libc::SYS_kill
            | libc::SYS_tkill
            | libc::SYS_tgkill
            | libc::SYS_uname
            | libc::SYS_semget
            | libc::SYS_semop
            | libc::SYS_semctl
            | libc::SYS_msgget
            | libc::SYS_msgsnd
            | libc::SYS_msgrcv
            | libc::SYS_msgctl
            | libc::SYS_fcntl
            | libc::SYS_flock
            | libc::SYS_fsync
            | libc::SYS_fdatasync
            | libc::SYS_syncfs
            | libc::SYS_sync
            | libc::SYS_sync_file_range
            | libc::SYS_ftruncate
            | libc::SYS_fallocate
            | libc::SYS_getdents64
            | libc::SYS_getcwd
            | libc::SYS_fchdir
            | libc::SYS_fchmod
            | libc::SYS_fchown
            | libc::SYS_fstatfs
            | libc::SYS_fsetxattr
            | libc::SYS_fgetxattr
            | libc::SYS_flistxattr
            | libc::SYS_fremovexattr
            | libc::SYS_umask
            | libc::SYS_gettimeofday
            | libc::SYS_getrlimit
            | libc::SYS_setrlimit
            | libc::SYS_prlimit64
            | libc::SYS_getrusage
            | libc::SYS_sysinfo
            | libc::SYS_times
            | libc::SYS_getuid
            | libc::SYS_getgid
            | libc::SYS_setuid
            | libc::SYS_setgid
            | libc::SYS_geteuid
            | libc::SYS_getegid
            | libc::SYS_setpgid
            | libc::SYS_getppid
            | libc::SYS_setsid
            | libc::SYS_setreuid
            | libc::SYS_setregid
            | libc::SYS_getgroups
            | libc::SYS_setgroups
            | libc::SYS_setresuid
            | libc::SYS_getresuid
            | libc::SYS_setresgid
            | libc::SYS_getresgid
            | libc::SYS_getpgid
            | libc::SYS_setfsuid
            | libc::SYS_setfsgid
            | libc::SYS_getsid
            | libc::SYS_capget
            | libc::SYS_capset
            | libc::SYS_rt_sigpending
            | libc::SYS_rt_sigtimedwait
            | libc::SYS_rt_sigqueueinfo
            | libc::SYS_rt_tgsigqueueinfo
            | libc::SYS_rt_sigsuspend
            | libc::SYS_sigaltstack
            | libc::SYS_personality
            | libc::SYS_getpriority
            | libc::SYS_setpriority
            | libc::SYS_sched_setparam
            | libc::SYS_sched_getparam
            | libc::SYS_sched_setscheduler
            | libc::SYS_sched_getscheduler
            | libc::SYS_sched_get_priority_max
            | libc::SYS_sched_get_priority_min
            | libc::SYS_sched_rr_get_interval
            | libc::SYS_sched_setaffinity
            | libc::SYS_sched_getaffinity
            | libc::SYS_sched_setattr
            | libc::SYS_sched_getattr
            | libc::SYS_mlock
            | libc::SYS_mlock2
            | libc::SYS_munlock
            | libc::SYS_mlockall
            | libc::SYS_munlockall
            | libc::SYS_mbind
            | libc::SYS_get_mempolicy
            | libc::SYS_set_mempolicy
            | libc::SYS_prctl
            | libc::SYS_gettid
            | libc::SYS_readahead
            | libc::SYS_futex
            | libc::SYS_set_tid_address
            | libc::SYS_set_robust_list
            | libc::SYS_get_robust_list
            | libc::SYS_restart_syscall
            | libc::SYS_fadvise64
            | libc::SYS_io_setup
            | libc::SYS_io_destroy
            | libc::SYS_io_getevents
            | libc::SYS_io_submit
            | libc::SYS_io_cancel
            | libc::SYS_timer_create
            | libc::SYS_timer_settime
            | libc::SYS_timer_gettime
            | libc::SYS_timer_getoverrun
            | libc::SYS_timer_delete
            | libc::SYS_clock_gettime
            | libc::SYS_clock_getres
            | libc::SYS_clock_nanosleep
            | libc::SYS_epoll_create1
            | libc::SYS_epoll_ctl
            | libc::SYS_epoll_pwait
            | libc::SYS_epoll_pwait2
            | libc::SYS_ioprio_set
            | libc::SYS_ioprio_get
            | libc::SYS_inotify_init1
            | libc::SYS_inotify_rm_watch
            | libc::SYS_pselect6
            | libc::SYS_ppoll
            | libc::SYS_splice
            | libc::SYS_tee
            | libc::SYS_vmsplice
            | libc::SYS_timerfd_create
            | libc::SYS_timerfd_settime
            | libc::SYS_timerfd_gettime
            | libc::SYS_signalfd4
            | libc::SYS_eventfd2
            | libc::SYS_pipe2
            | libc::SYS_preadv
            | libc::SYS_pwritev
            | libc::SYS_preadv2
            | libc::SYS_pwritev2
            | libc::SYS_copy_file_range
            | libc::SYS_perf_event_open
            | libc::SYS_getcpu
            | libc::SYS_process_vm_readv
            | libc::SYS_process_vm_writev
            | libc::SYS_getrandom
            | libc::SYS_memfd_create
            | libc::SYS_membarrier
            | libc::SYS_userfaultfd
            | libc::SYS_seccomp
            | libc::SYS_pkey_mprotect
            | libc::SYS_pkey_alloc
            | libc::SYS_pkey_free
            | libc::SYS_rseq
            | libc::SYS_pidfd_open
            | libc::SYS_pidfd_send_signal
            | libc::SYS_pidfd_getfd
            | libc::SYS_close_range
    ) || is_legacy_passthrough(nr)
}

#[cfg(target_arch = "x86_64")]
fn is_legacy_passthrough(nr: c_long) -> bool {
    matches!(
        nr,
        libc::SYS_poll
            | libc::SYS_select
            | libc::SYS_pipe
            | libc::SYS_dup2
            | libc::SYS_pause
            | libc::SYS_alarm
            | libc::SYS_fork
            | libc::SYS_vfork
            | libc::SYS_getdents
            | libc::SYS_getpgrp
            | libc::SYS_arch_prctl
            | libc::SYS_time
            | libc::SYS_epoll_create
            | libc::SYS_epoll_wait
            | libc::SYS_signalfd
            | libc::SYS_eventfd
            | libc::SYS_inotify_init
            | libc::SYS_set_thread_area
            | libc::SYS_get_thread_area
    )
}

#[cfg(not(target_arch = "x86_64"))]
fn is_legacy_passthrough(_nr: c_long) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[u64]) -> [u64; 6] {
        let mut out = [0; 6];
        out[..values.len()].copy_from_slice(values);
        out
    }

    #[test]
    fn classifies_path_syscalls() {
        assert!(matches!(
            classify(libc::SYS_openat),
            Some(SyscallClass::SinglePath(PathArg { path: 1, dirfd: Some(0), .. }))
        ));
        assert!(matches!(
            classify(libc::SYS_renameat2),
            Some(SyscallClass::MultiplePaths(args)) if args.len() == 2
        ));
        assert!(matches!(
            classify(libc::SYS_symlinkat),
            Some(SyscallClass::SinglePath(PathArg { path: 2, dirfd: Some(1), .. }))
        ));
    }

    #[test]
    fn classifies_special_syscalls() {
        assert_eq!(classify(libc::SYS_ptrace), Some(SyscallClass::Ptrace));
        assert!(matches!(classify(libc::SYS_execve), Some(SyscallClass::Execve(_))));
        assert!(matches!(classify(libc::SYS_execveat), Some(SyscallClass::Execve(_))));
        assert_eq!(classify(libc::SYS_read), Some(SyscallClass::Passthrough));
        assert_eq!(classify(libc::SYS_getcwd), Some(SyscallClass::Passthrough));
    }

    #[test]
    fn classifies_socket_address_syscalls() {
        assert_eq!(
            classify(libc::SYS_bind),
            Some(SyscallClass::SocketAddress(SockArg::Direct {
                addr: 1,
                len: 2,
                follow: Follow::No
            }))
        );
        assert!(matches!(
            classify(libc::SYS_connect),
            Some(SyscallClass::SocketAddress(SockArg::Direct { follow: Follow::Yes, .. }))
        ));
        assert!(matches!(
            classify(libc::SYS_sendto),
            Some(SyscallClass::SocketAddress(SockArg::Direct { addr: 4, len: 5, .. }))
        ));
        assert_eq!(
            classify(libc::SYS_sendmsg),
            Some(SyscallClass::SocketAddress(SockArg::Message { msg: 1 }))
        );
        assert_eq!(classify(libc::SYS_socket), Some(SyscallClass::Passthrough));
    }

    #[test]
    fn unknown_syscalls() {
        assert_eq!(classify(libc::SYS_mount), None);
        assert_eq!(classify(libc::SYS_chroot), None);
        assert_eq!(classify(100_000), None);
        assert_eq!(classify(-1), None);
    }

    #[test]
    fn follow_rules() {
        let fstatat = PathArg::at(0, 1, unless_nofollow(3));
        assert_eq!(fstatat.follow(&args(&[0, 0, 0, 0])), Follow::Yes);
        assert_eq!(fstatat.follow(&args(&[0, 0, 0, NOFOLLOW])), Follow::No);

        let linkat = LINKAT[0];
        assert_eq!(linkat.follow(&args(&[0, 0, 0, 0, 0])), Follow::No);
        assert_eq!(linkat.follow(&args(&[0, 0, 0, 0, FOLLOW])), Follow::Yes);

        let openat = PathArg::at(0, 1, FollowRule::OpenFlags { arg: 2 });
        assert_eq!(openat.follow(&args(&[0, 0, libc::O_RDONLY as u64])), Follow::Yes);
        assert_eq!(openat.follow(&args(&[0, 0, libc::O_CREAT as u64])), Follow::Yes);
        assert_eq!(openat.follow(&args(&[0, 0, libc::O_NOFOLLOW as u64])), Follow::No);
        let create_new = (libc::O_CREAT | libc::O_EXCL) as u64;
        assert_eq!(openat.follow(&args(&[0, 0, create_new])), Follow::No);
    }

    #[test]
    fn exit_hooks() {
        assert_eq!(exit_hook(libc::SYS_readlinkat), ExitHook::Readlink { buf: 2 });
        assert_eq!(exit_hook(libc::SYS_getcwd), ExitHook::Getcwd);
        assert_eq!(exit_hook(libc::SYS_openat), ExitHook::Open { flags: Some(2) });
        assert_eq!(exit_hook(libc::SYS_dup3), ExitHook::Dup { flags: Some(2) });
        assert_eq!(exit_hook(libc::SYS_write), ExitHook::Nothing);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn legacy_x86_64_syscalls() {
        assert!(matches!(classify(libc::SYS_open), Some(SyscallClass::SinglePath(_))));
        assert!(matches!(classify(libc::SYS_rename), Some(SyscallClass::MultiplePaths(_))));
        assert_eq!(classify(libc::SYS_fork), Some(SyscallClass::Passthrough));
        assert_eq!(exit_hook(libc::SYS_readlink), ExitHook::Readlink { buf: 1 });
    }
}
