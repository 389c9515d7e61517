//! sysdelay - inject latency into every system call of a running process
//!
//! Each thread of the target is traced by its own control thread with
//! ptrace. At every syscall exit that is not exempt, the control thread
//! sleeps for the configured delay while the tracee stays stopped, which
//! stretches the syscall's apparent duration without touching the target.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("sysdelay supports only Linux on x86_64: syscall numbers are read from orig_rax");

pub mod cli;
pub mod config;
pub mod delay;
pub mod discovery;
pub mod error;
pub mod event;
pub mod ptrace;
pub mod shutdown;
pub mod supervisor;
pub mod syscalls;
pub mod trace_loop;
