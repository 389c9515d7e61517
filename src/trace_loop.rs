//! Per-thread trace loop
//!
//! One loop owns one tracee for its whole life and runs on a dedicated
//! control thread. Its lifecycle is carried by the types: a [`TraceLoop`]
//! has not attached yet, [`TraceLoop::attach`] turns it into an
//! [`AttachedLoop`], and [`AttachedLoop::run`] consumes that, detaching
//! before it returns the [`LoopExit`].
//!
//! The kernel reports syscall entry and exit as two separate stops, so each
//! tracee carries an `in_syscall` toggle and the delay is injected only on
//! the stop that closes an open, delayable syscall.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::{Result, TraceError};
use crate::event::{EventSink, TraceEvent};
use crate::ptrace::{Stop, TraceBackend};
use crate::shutdown::ShutdownFlag;
use crate::syscalls::{self, SyscallClass};

/// One traced OS thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracee {
    pub tid: Pid,
    /// true between a delayable syscall's entry stop and its exit stop
    pub in_syscall: bool,
}

/// What a syscall stop meant for a tracee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Exempt syscall; the toggle is left alone
    Ignored,
    /// Entry of a delayable syscall
    Entered,
    /// Exit of a delayable syscall; this is where the delay goes
    Completed,
}

impl Tracee {
    pub fn new(tid: Pid) -> Self {
        Self {
            tid,
            in_syscall: false,
        }
    }

    /// Advance the entry/exit toggle for a syscall stop
    pub fn observe(&mut self, syscall: i64) -> Observation {
        match syscalls::classify(syscall) {
            SyscallClass::Ignored => Observation::Ignored,
            SyscallClass::Delayable if self.in_syscall => {
                self.in_syscall = false;
                Observation::Completed
            }
            SyscallClass::Delayable => {
                self.in_syscall = true;
                Observation::Entered
            }
        }
    }
}

/// Why a trace loop stopped tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The tracee exited or was killed; nothing left to detach
    TraceeExited(Stop),
    /// The shutdown flag was observed
    Shutdown,
    /// Resuming or waiting failed; the tracee most likely vanished
    Lost,
}

/// Scoped ownership of a ptrace attachment
///
/// Dropping it detaches the tracee unless it was reaped or already
/// detached, so every exit path (including unwinding) detaches exactly once.
pub struct Attachment<B: TraceBackend> {
    backend: B,
    tid: Pid,
    sink: Arc<dyn EventSink>,
    pending_signal: Option<Signal>,
    attached: bool,
}

impl<B: TraceBackend> Attachment<B> {
    fn new(backend: B, tid: Pid, sink: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            tid,
            sink,
            pending_signal: None,
            attached: true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The tracee was reaped; the kernel has already dropped the attachment
    fn release(&mut self) {
        self.attached = false;
    }

    /// Detach, forwarding any signal the tracee has not received yet
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;

        let signal = self.pending_signal.take();
        match self.backend.detach(self.tid, signal) {
            Ok(()) => {
                self.sink.emit(TraceEvent::Detached {
                    tracee: self.tid.as_raw(),
                });
                Ok(())
            }
            Err(source) => {
                tracing::warn!("Failed to detach from {}: {}", self.tid, source);
                self.sink.emit(TraceEvent::DetachFailed {
                    tracee: self.tid.as_raw(),
                    cause: source.to_string(),
                });
                Err(TraceError::Detach {
                    tid: self.tid,
                    source,
                })
            }
        }
    }
}

impl<B: TraceBackend> Drop for Attachment<B> {
    fn drop(&mut self) {
        // DetachFailed has already been emitted
        let _ = self.detach();
    }
}

/// A trace loop that has not attached yet
pub struct TraceLoop {
    tracee: Tracee,
    delay: Duration,
    shutdown: ShutdownFlag,
    sink: Arc<dyn EventSink>,
}

impl TraceLoop {
    pub fn new(tid: Pid, delay: Duration, shutdown: ShutdownFlag, sink: Arc<dyn EventSink>) -> Self {
        Self {
            tracee: Tracee::new(tid),
            delay,
            shutdown,
            sink,
        }
    }

    /// Attach to the tracee; must run on the thread that will run the loop
    pub fn attach<B: TraceBackend>(self, mut backend: B) -> Result<AttachedLoop<B>> {
        let tid = self.tracee.tid;
        if let Err(source) = backend.attach(tid) {
            self.sink.emit(TraceEvent::AttachFailed {
                tracee: tid.as_raw(),
                cause: source.to_string(),
            });
            return Err(TraceError::Attach { tid, source });
        }

        tracing::debug!("Attached to {}", tid);
        self.sink.emit(TraceEvent::Attached {
            tracee: tid.as_raw(),
        });

        Ok(AttachedLoop {
            attachment: Attachment::new(backend, tid, self.sink.clone()),
            tracee: self.tracee,
            delay: self.delay,
            shutdown: self.shutdown,
            sink: self.sink,
        })
    }
}

/// A trace loop holding a live attachment
pub struct AttachedLoop<B: TraceBackend> {
    attachment: Attachment<B>,
    tracee: Tracee,
    delay: Duration,
    shutdown: ShutdownFlag,
    sink: Arc<dyn EventSink>,
}

impl<B: TraceBackend> AttachedLoop<B> {
    /// Run until the tracee exits or shutdown is requested, then detach
    pub fn run(mut self) -> LoopExit {
        let exit = self.run_until_stopped();
        tracing::debug!("Trace loop for {} stopping: {:?}", self.tracee.tid, exit);

        if self.attachment.is_attached() {
            // Failures are reported as DetachFailed and are not fatal
            let _ = self.attachment.detach();
        }
        exit
    }

    fn run_until_stopped(&mut self) -> LoopExit {
        let tid = self.tracee.tid;
        let mut resume = true;

        loop {
            // The tracee is in a ptrace-stop here, so a detach can succeed
            if resume {
                if self.shutdown.is_requested() {
                    return LoopExit::Shutdown;
                }
                let signal = self.attachment.pending_signal.take();
                if let Err(e) = self.attachment.backend.resume(tid, signal) {
                    tracing::warn!("Failed to resume {}: {}", tid, e);
                    return LoopExit::Lost;
                }
            }
            resume = true;

            let stop = match self.attachment.backend.wait(tid) {
                Ok(stop) => stop,
                Err(e) => {
                    tracing::warn!("Failed to wait for {}: {}", tid, e);
                    return LoopExit::Lost;
                }
            };

            match stop {
                Stop::Exited(_) | Stop::Killed(_) => {
                    self.attachment.release();
                    self.sink.emit(TraceEvent::TraceeExited {
                        tracee: tid.as_raw(),
                        status: describe_exit(stop),
                    });
                    return LoopExit::TraceeExited(stop);
                }
                Stop::SyscallBoundary => match self.attachment.backend.syscall_number(tid) {
                    Ok(syscall) => self.on_syscall(syscall),
                    Err(e) => {
                        // Usually the tracee died between the wait and the read
                        self.sink.emit(TraceEvent::PeekFailed {
                            tracee: tid.as_raw(),
                            cause: e.to_string(),
                        });
                        resume = false;
                    }
                },
                Stop::Signal(sig) => {
                    tracing::trace!("{} received {:?}", tid, sig);
                    self.attachment.pending_signal = Some(sig);
                }
                Stop::GroupStop(_) | Stop::Event(_) => {}
            }
        }
    }

    fn on_syscall(&mut self, syscall: i64) {
        let tid = self.tracee.tid.as_raw();
        match self.tracee.observe(syscall) {
            Observation::Ignored => self.sink.emit(TraceEvent::ignored(tid, syscall)),
            Observation::Entered => {}
            Observation::Completed => {
                self.sink.emit(TraceEvent::delayed(
                    tid,
                    syscall,
                    self.delay.as_micros() as u64,
                ));
                self.attachment.backend.hold(self.delay);
            }
        }
    }
}

fn describe_exit(stop: Stop) -> String {
    match stop {
        Stop::Exited(code) => format!("exited with status {}", code),
        Stop::Killed(sig) => format!("killed by {:?}", sig),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CollectingSink;
    use nix::errno::Errno;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Attach,
        Resume(Option<Signal>),
        Wait,
        Peek,
        Detach(Option<Signal>),
        Hold(Duration),
    }

    enum Step {
        Syscall(i64),
        PeekFails,
        Stop(Stop),
        WaitFails,
        RequestShutdown,
    }

    struct Scripted {
        steps: VecDeque<Step>,
        peek: Option<nix::Result<i64>>,
        calls: Arc<Mutex<Vec<Call>>>,
        shutdown: ShutdownFlag,
        attach_result: nix::Result<()>,
        detach_result: nix::Result<()>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>, shutdown: &ShutdownFlag) -> (Self, Arc<Mutex<Vec<Call>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let backend = Self {
                steps: steps.into(),
                peek: None,
                calls: calls.clone(),
                shutdown: shutdown.clone(),
                attach_result: Ok(()),
                detach_result: Ok(()),
            };
            (backend, calls)
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl TraceBackend for Scripted {
        fn attach(&mut self, _tid: Pid) -> nix::Result<()> {
            self.record(Call::Attach);
            self.attach_result
        }

        fn resume(&mut self, _tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
            self.record(Call::Resume(signal));
            Ok(())
        }

        fn wait(&mut self, _tid: Pid) -> nix::Result<Stop> {
            self.record(Call::Wait);
            loop {
                match self.steps.pop_front() {
                    Some(Step::Syscall(nr)) => {
                        self.peek = Some(Ok(nr));
                        return Ok(Stop::SyscallBoundary);
                    }
                    Some(Step::PeekFails) => {
                        self.peek = Some(Err(Errno::ESRCH));
                        return Ok(Stop::SyscallBoundary);
                    }
                    Some(Step::Stop(stop)) => return Ok(stop),
                    Some(Step::WaitFails) => return Err(Errno::ECHILD),
                    Some(Step::RequestShutdown) => self.shutdown.request(),
                    None => return Ok(Stop::Exited(0)),
                }
            }
        }

        fn syscall_number(&mut self, _tid: Pid) -> nix::Result<i64> {
            self.record(Call::Peek);
            self.peek.take().unwrap_or(Err(Errno::ESRCH))
        }

        fn detach(&mut self, _tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
            self.record(Call::Detach(signal));
            self.detach_result
        }

        fn hold(&mut self, delay: Duration) {
            self.record(Call::Hold(delay));
        }
    }

    fn run_script(steps: Vec<Step>, delay_us: u64) -> (LoopExit, Vec<TraceEvent>, Vec<Call>) {
        let shutdown = ShutdownFlag::new();
        let (backend, calls) = Scripted::new(steps, &shutdown);
        let sink = Arc::new(CollectingSink::new());
        let trace = TraceLoop::new(
            Pid::from_raw(100),
            Duration::from_micros(delay_us),
            shutdown,
            sink.clone(),
        );
        let exit = trace.attach(backend).unwrap().run();
        let calls = calls.lock().unwrap().clone();
        (exit, sink.events(), calls)
    }

    fn syscall_events(events: &[TraceEvent]) -> Vec<TraceEvent> {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    TraceEvent::IgnoredSyscall { .. } | TraceEvent::DelayedSyscall { .. }
                )
            })
            .cloned()
            .collect()
    }

    fn detach_count(calls: &[Call]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, Call::Detach(_)))
            .count()
    }

    #[test]
    fn test_tracee_toggle_alternates() {
        let mut tracee = Tracee::new(Pid::from_raw(1));
        assert_eq!(tracee.observe(libc::SYS_read), Observation::Entered);
        assert!(tracee.in_syscall);
        assert_eq!(tracee.observe(libc::SYS_read), Observation::Completed);
        assert!(!tracee.in_syscall);
    }

    #[test]
    fn test_ignored_syscall_leaves_toggle() {
        let mut tracee = Tracee::new(Pid::from_raw(1));
        tracee.observe(libc::SYS_write);
        assert_eq!(tracee.observe(libc::SYS_futex), Observation::Ignored);
        assert!(tracee.in_syscall);
    }

    #[test]
    fn test_read_futex_write_scenario() {
        let steps = vec![
            Step::Syscall(libc::SYS_read),
            Step::Syscall(libc::SYS_read),
            Step::Syscall(libc::SYS_futex),
            Step::Syscall(libc::SYS_futex),
            Step::Syscall(libc::SYS_write),
            Step::Syscall(libc::SYS_write),
        ];
        let (exit, events, calls) = run_script(steps, 500);

        assert_eq!(exit, LoopExit::TraceeExited(Stop::Exited(0)));
        assert_eq!(
            syscall_events(&events),
            vec![
                TraceEvent::delayed(100, libc::SYS_read, 500),
                TraceEvent::ignored(100, libc::SYS_futex),
                TraceEvent::ignored(100, libc::SYS_futex),
                TraceEvent::delayed(100, libc::SYS_write, 500),
            ]
        );
        let holds: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::Hold(_)))
            .collect();
        assert_eq!(holds, vec![&Call::Hold(Duration::from_micros(500)); 2]);
    }

    #[test]
    fn test_exited_tracee_is_not_detached() {
        let (_, events, calls) = run_script(vec![Step::Syscall(libc::SYS_read)], 1);
        assert_eq!(detach_count(&calls), 0);
        assert!(events
            .iter()
            .any(|e| matches!(e, TraceEvent::TraceeExited { tracee: 100, .. })));
    }

    #[test]
    fn test_shutdown_detaches_once_without_further_delay() {
        let steps = vec![
            Step::Syscall(libc::SYS_read),
            Step::RequestShutdown,
            Step::Syscall(libc::SYS_read),
            Step::Syscall(libc::SYS_write),
            Step::Syscall(libc::SYS_write),
        ];
        let (exit, events, calls) = run_script(steps, 10);

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(detach_count(&calls), 1);
        // The read exit was already being handled when shutdown was observed
        assert_eq!(
            syscall_events(&events),
            vec![TraceEvent::delayed(100, libc::SYS_read, 10)]
        );
        assert_eq!(calls.last(), Some(&Call::Detach(None)));
        assert!(events.contains(&TraceEvent::Detached { tracee: 100 }));
    }

    #[test]
    fn test_shutdown_before_first_resume() {
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        let (backend, calls) = Scripted::new(vec![Step::Syscall(libc::SYS_read)], &shutdown);
        let sink = Arc::new(CollectingSink::new());
        let exit = TraceLoop::new(Pid::from_raw(5), Duration::from_micros(1), shutdown, sink)
            .attach(backend)
            .unwrap()
            .run();

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(*calls.lock().unwrap(), vec![Call::Attach, Call::Detach(None)]);
    }

    #[test]
    fn test_peek_failure_keeps_toggle_and_skips_resume() {
        let steps = vec![
            Step::Syscall(libc::SYS_read),
            Step::PeekFails,
            Step::Syscall(libc::SYS_read),
        ];
        let (exit, events, calls) = run_script(steps, 7);

        assert_eq!(exit, LoopExit::TraceeExited(Stop::Exited(0)));
        assert!(events
            .iter()
            .any(|e| matches!(e, TraceEvent::PeekFailed { tracee: 100, .. })));
        // The entry before the failure is closed by the stop after it
        assert_eq!(
            syscall_events(&events),
            vec![TraceEvent::delayed(100, libc::SYS_read, 7)]
        );

        let failed_peek = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Call::Peek)
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(calls[failed_peek + 1], Call::Wait);
    }

    #[test]
    fn test_signal_is_forwarded_and_not_classified() {
        let steps = vec![
            Step::Syscall(libc::SYS_read),
            Step::Stop(Stop::Signal(Signal::SIGUSR1)),
            Step::Syscall(libc::SYS_read),
        ];
        let (_, events, calls) = run_script(steps, 3);

        assert!(calls.contains(&Call::Resume(Some(Signal::SIGUSR1))));
        assert_eq!(
            syscall_events(&events),
            vec![TraceEvent::delayed(100, libc::SYS_read, 3)]
        );
    }

    #[test]
    fn test_pending_signal_delivered_on_detach() {
        let steps = vec![
            Step::RequestShutdown,
            Step::Stop(Stop::Signal(Signal::SIGUSR2)),
        ];
        let (exit, _, calls) = run_script(steps, 1);

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(calls.last(), Some(&Call::Detach(Some(Signal::SIGUSR2))));
    }

    #[test]
    fn test_peek_failure_then_shutdown_detaches_once() {
        let steps = vec![
            Step::Syscall(libc::SYS_read),
            Step::PeekFails,
            Step::RequestShutdown,
            Step::Syscall(libc::SYS_read),
        ];
        let (exit, events, calls) = run_script(steps, 40);

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(detach_count(&calls), 1);
        assert_eq!(calls.last(), Some(&Call::Detach(None)));
        // The failed read left the entry open, so the next stop completes it
        assert_eq!(
            syscall_events(&events),
            vec![TraceEvent::delayed(100, libc::SYS_read, 40)]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, TraceEvent::PeekFailed { tracee: 100, .. })));
        assert_eq!(
            events.iter().filter(|e| **e == TraceEvent::Detached { tracee: 100 }).count(),
            1
        );
    }

    #[test]
    fn test_group_stop_resumed_without_signal() {
        let steps = vec![
            Step::Stop(Stop::GroupStop(Signal::SIGSTOP)),
            Step::Syscall(libc::SYS_read),
        ];
        let (_, _, calls) = run_script(steps, 1);
        assert!(calls
            .iter()
            .all(|c| !matches!(c, Call::Resume(Some(_)))));
    }

    #[test]
    fn test_wait_failure_still_detaches_once() {
        let (exit, _, calls) = run_script(vec![Step::Syscall(libc::SYS_read), Step::WaitFails], 1);
        assert_eq!(exit, LoopExit::Lost);
        assert_eq!(detach_count(&calls), 1);
    }

    #[test]
    fn test_detach_failure_is_reported_not_fatal() {
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        let (mut backend, calls) = Scripted::new(vec![], &shutdown);
        backend.detach_result = Err(Errno::ESRCH);
        let sink = Arc::new(CollectingSink::new());
        let exit = TraceLoop::new(Pid::from_raw(9), Duration::from_micros(1), shutdown, sink.clone())
            .attach(backend)
            .unwrap()
            .run();

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(detach_count(&calls.lock().unwrap()), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TraceEvent::DetachFailed { tracee: 9, .. })));
    }

    #[test]
    fn test_attach_failure_reported() {
        let shutdown = ShutdownFlag::new();
        let (mut backend, calls) = Scripted::new(vec![], &shutdown);
        backend.attach_result = Err(Errno::EPERM);
        let sink = Arc::new(CollectingSink::new());
        let trace = TraceLoop::new(Pid::from_raw(11), Duration::from_micros(1), shutdown, sink.clone());

        let err = trace.attach(backend).err().unwrap();
        assert!(matches!(err, TraceError::Attach { source: Errno::EPERM, .. }));
        assert_eq!(
            sink.events(),
            vec![TraceEvent::AttachFailed {
                tracee: 11,
                cause: Errno::EPERM.to_string()
            }]
        );
        assert_eq!(detach_count(&calls.lock().unwrap()), 0);
    }

    #[test]
    fn test_dropping_attached_loop_detaches() {
        let shutdown = ShutdownFlag::new();
        let (backend, calls) = Scripted::new(vec![], &shutdown);
        let sink = Arc::new(CollectingSink::new());
        let attached = TraceLoop::new(Pid::from_raw(12), Duration::from_micros(1), shutdown, sink)
            .attach(backend)
            .unwrap();
        drop(attached);
        assert_eq!(*calls.lock().unwrap(), vec![Call::Attach, Call::Detach(None)]);
    }
}
