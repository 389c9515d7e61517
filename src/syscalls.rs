//! Syscall names and the delay classification table for x86_64
//!
//! Syscalls whose latency is already governed by the caller's intended
//! blocking, or whose delay would distort the timing under test, are
//! ignored: sleeps, waits and futexes, clock queries, I/O multiplexing,
//! yields, and signal-mask bookkeeping. Everything else is delayable.

use serde::Serialize;

/// Whether a syscall gets the injected delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyscallClass {
    Ignored,
    Delayable,
}

/// Syscalls exempt from delay injection
pub const IGNORED_SYSCALLS: [i64; 10] = [
    libc::SYS_futex,
    libc::SYS_nanosleep,
    libc::SYS_gettimeofday,
    libc::SYS_clock_gettime,
    libc::SYS_pselect6,
    libc::SYS_epoll_wait,
    libc::SYS_sched_yield,
    libc::SYS_restart_syscall,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
];

/// Classify a syscall number
pub fn classify(num: i64) -> SyscallClass {
    if is_ignored(num) {
        SyscallClass::Ignored
    } else {
        SyscallClass::Delayable
    }
}

pub fn is_ignored(num: i64) -> bool {
    matches!(
        num,
        libc::SYS_futex
            | libc::SYS_nanosleep
            | libc::SYS_gettimeofday
            | libc::SYS_clock_gettime
            | libc::SYS_pselect6
            | libc::SYS_epoll_wait
            | libc::SYS_sched_yield
            | libc::SYS_restart_syscall
            | libc::SYS_rt_sigaction
            | libc::SYS_rt_sigprocmask
    )
}

/// Resolve syscall number to name for x86_64
///
/// Returns "unknown" for numbers outside the table
pub fn syscall_name(num: i64) -> &'static str {
    match num {
        0 => "read",
        1 => "write",
        2 => "open",
        3 => "close",
        4 => "stat",
        5 => "fstat",
        6 => "lstat",
        7 => "poll",
        8 => "lseek",
        9 => "mmap",
        10 => "mprotect",
        11 => "munmap",
        12 => "brk",
        13 => "rt_sigaction",
        14 => "rt_sigprocmask",
        15 => "rt_sigreturn",
        16 => "ioctl",
        17 => "pread64",
        18 => "pwrite64",
        19 => "readv",
        20 => "writev",
        21 => "access",
        22 => "pipe",
        23 => "select",
        24 => "sched_yield",
        25 => "mremap",
        26 => "msync",
        27 => "mincore",
        28 => "madvise",
        29 => "shmget",
        30 => "shmat",
        31 => "shmctl",
        32 => "dup",
        33 => "dup2",
        34 => "pause",
        35 => "nanosleep",
        36 => "getitimer",
        37 => "alarm",
        38 => "setitimer",
        39 => "getpid",
        40 => "sendfile",
        41 => "socket",
        42 => "connect",
        43 => "accept",
        44 => "sendto",
        45 => "recvfrom",
        46 => "sendmsg",
        47 => "recvmsg",
        48 => "shutdown",
        49 => "bind",
        50 => "listen",
        51 => "getsockname",
        52 => "getpeername",
        53 => "socketpair",
        54 => "setsockopt",
        55 => "getsockopt",
        56 => "clone",
        57 => "fork",
        58 => "vfork",
        59 => "execve",
        60 => "exit",
        61 => "wait4",
        62 => "kill",
        63 => "uname",
        72 => "fcntl",
        73 => "flock",
        74 => "fsync",
        75 => "fdatasync",
        76 => "truncate",
        77 => "ftruncate",
        78 => "getdents",
        79 => "getcwd",
        80 => "chdir",
        81 => "fchdir",
        82 => "rename",
        83 => "mkdir",
        84 => "rmdir",
        85 => "creat",
        86 => "link",
        87 => "unlink",
        88 => "symlink",
        89 => "readlink",
        90 => "chmod",
        91 => "fchmod",
        92 => "chown",
        93 => "fchown",
        94 => "lchown",
        95 => "umask",
        96 => "gettimeofday",
        97 => "getrlimit",
        98 => "getrusage",
        99 => "sysinfo",
        102 => "getuid",
        104 => "getgid",
        105 => "setuid",
        107 => "setgid",
        108 => "geteuid",
        109 => "getegid",
        110 => "setpgid",
        111 => "getppid",
        112 => "getpgrp",
        113 => "setsid",
        131 => "sigaltstack",
        157 => "prctl",
        158 => "arch_prctl",
        186 => "gettid",
        200 => "tkill",
        201 => "time",
        202 => "futex",
        217 => "getdents64",
        218 => "set_tid_address",
        219 => "restart_syscall",
        228 => "clock_gettime",
        230 => "clock_nanosleep",
        231 => "exit_group",
        232 => "epoll_wait",
        233 => "epoll_ctl",
        234 => "tgkill",
        247 => "waitid",
        257 => "openat",
        262 => "newfstatat",
        270 => "pselect6",
        271 => "ppoll",
        273 => "set_robust_list",
        281 => "epoll_pwait",
        288 => "accept4",
        290 => "eventfd2",
        291 => "epoll_create1",
        293 => "pipe2",
        302 => "prlimit64",
        318 => "getrandom",
        332 => "statx",
        334 => "rseq",
        435 => "clone3",
        _ => "unknown",
    }
}
