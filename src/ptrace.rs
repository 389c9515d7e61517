//! Boundary to the kernel's process-tracing facility
//!
//! [`TraceBackend`] is everything a trace loop asks of ptrace. [`NixPtrace`]
//! implements it with `nix`; tests drive the loop with scripted backends.
//!
//! Every call must come from the control thread that attached the tracee:
//! the kernel binds a tracee to the tracing *thread*, not the process.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// A state change reported for a tracee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Stopped at a syscall entry or exit
    SyscallBoundary,
    /// Signal-delivery stop; the signal must be forwarded on resume
    Signal(Signal),
    /// Group stop (SIGSTOP/SIGTSTP/...); resumed without a signal
    GroupStop(Signal),
    /// PTRACE_EVENT_* stop
    Event(i32),
    /// Tracee exited with this status
    Exited(i32),
    /// Tracee was killed by a signal
    Killed(Signal),
}

/// Operations a trace loop performs on its tracee
pub trait TraceBackend {
    /// Attach and wait until the tracee sits in its attach stop
    fn attach(&mut self, tid: Pid) -> nix::Result<()>;

    /// Resume until the next syscall boundary, delivering `signal` if set
    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    /// Block until the tracee changes state
    fn wait(&mut self, tid: Pid) -> nix::Result<Stop>;

    /// Syscall number of a tracee stopped at a syscall boundary
    fn syscall_number(&mut self, tid: Pid) -> nix::Result<i64>;

    /// Detach, delivering `signal` if set
    fn detach(&mut self, tid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    /// Keep the tracee stopped for `delay`
    fn hold(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// ptrace(2) through nix
#[derive(Debug, Default, Clone, Copy)]
pub struct NixPtrace;

impl NixPtrace {
    pub fn new() -> Self {
        Self
    }

    fn classify_stop(tid: Pid, sig: Signal) -> Stop {
        // PTRACE_GETSIGINFO fails with EINVAL for group stops
        match ptrace::getsiginfo(tid) {
            Ok(_) => Stop::Signal(sig),
            Err(Errno::EINVAL) => Stop::GroupStop(sig),
            Err(e) => {
                tracing::debug!("getsiginfo({}) failed: {}, treating as signal stop", tid, e);
                Stop::Signal(sig)
            }
        }
    }
}

impl TraceBackend for NixPtrace {
    fn attach(&mut self, tid: Pid) -> nix::Result<()> {
        ptrace::attach(tid)?;

        // Wait for the SIGSTOP from PTRACE_ATTACH; signals that win the race
        // are handed back to the tracee.
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                WaitStatus::Stopped(_, sig) => {
                    tracing::trace!("{} stopped with {:?} before attach stop", tid, sig);
                    ptrace::cont(tid, sig)?;
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Err(Errno::ESRCH),
                other => tracing::trace!("{} attach wait: {:?}", tid, other),
            }
        }

        ptrace::setoptions(tid, ptrace::Options::PTRACE_O_TRACESYSGOOD)
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        ptrace::syscall(tid, signal)
    }

    fn wait(&mut self, tid: Pid) -> nix::Result<Stop> {
        loop {
            let stop = match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::PtraceSyscall(_) => Stop::SyscallBoundary,
                WaitStatus::Stopped(_, sig) => Self::classify_stop(tid, sig),
                WaitStatus::PtraceEvent(_, _, event) => Stop::Event(event),
                WaitStatus::Exited(_, code) => Stop::Exited(code),
                WaitStatus::Signaled(_, sig, _) => Stop::Killed(sig),
                WaitStatus::Continued(_) | WaitStatus::StillAlive => continue,
            };
            return Ok(stop);
        }
    }

    fn syscall_number(&mut self, tid: Pid) -> nix::Result<i64> {
        // On x86_64: syscall number in orig_rax
        let regs = ptrace::getregs(tid)?;
        Ok(regs.orig_rax as i64)
    }

    fn detach(&mut self, tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        ptrace::detach(tid, signal)
    }
}
