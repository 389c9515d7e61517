//! Thread discovery, attachment and trace-loop lifecycle
//!
//! The supervisor spawns one named control thread per tracee. Each control
//! thread attaches *itself* (the kernel makes the attaching thread the
//! tracer) and reports the outcome over a rendezvous channel before it
//! enters its loop, so attach failures surface here as ordinary `Result`s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use crate::config::{AttachPolicy, TracerConfig};
use crate::delay::{self, DelayStore};
use crate::discovery;
use crate::error::{Result, TraceError};
use crate::event::EventSink;
use crate::ptrace::{NixPtrace, TraceBackend};
use crate::shutdown::ShutdownFlag;
use crate::trace_loop::{LoopExit, TraceLoop};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running control thread and the tracee it owns
#[derive(Debug)]
pub struct TraceHandle {
    tid: Pid,
    thread: JoinHandle<LoopExit>,
}

impl TraceHandle {
    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Owns every trace loop of one target process
pub struct Supervisor<B> {
    config: TracerConfig,
    shutdown: ShutdownFlag,
    sink: Arc<dyn EventSink>,
    delay: &'static DelayStore,
    backend: B,
    proc_root: PathBuf,
    loops: HashMap<Pid, TraceHandle>,
}

impl Supervisor<NixPtrace> {
    /// Supervisor backed by the real ptrace, /proc and the process-wide
    /// delay store
    pub fn new(config: TracerConfig, shutdown: ShutdownFlag, sink: Arc<dyn EventSink>) -> Self {
        Self::with_backend(
            config,
            shutdown,
            sink,
            delay::global(),
            NixPtrace::new(),
            PathBuf::from("/proc"),
        )
    }
}

impl<B> Supervisor<B>
where
    B: TraceBackend + Clone + Send + 'static,
{
    /// Supervisor with an explicit delay store, backend and procfs root
    ///
    /// `backend` is cloned into every control thread.
    pub fn with_backend(
        config: TracerConfig,
        shutdown: ShutdownFlag,
        sink: Arc<dyn EventSink>,
        delay: &'static DelayStore,
        backend: B,
        proc_root: PathBuf,
    ) -> Self {
        Self {
            config,
            shutdown,
            sink,
            delay,
            backend,
            proc_root,
            loops: HashMap::new(),
        }
    }

    /// Thread ids with a live control thread, sorted
    pub fn live_tracees(&self) -> Vec<Pid> {
        let mut tids: Vec<Pid> = self
            .loops
            .values()
            .filter(|handle| !handle.is_finished())
            .map(TraceHandle::tid)
            .collect();
        tids.sort_unstable_by_key(|tid| tid.as_raw());
        tids
    }

    /// Enumerate the target's threads and attach a trace loop to each
    ///
    /// Returns the number of threads attached. On the first attach failure
    /// the configured [`AttachPolicy`] decides what happens to the loops
    /// already running; the failure is returned either way.
    pub fn attach_all(&mut self) -> Result<usize> {
        self.delay.require()?;
        let tids = discovery::list_threads_in(&self.proc_root, self.config.target)?;
        if tids.is_empty() {
            tracing::warn!("Process {} has no threads to trace", self.config.target);
        }

        let mut attached = 0;
        for tid in tids {
            match self.spawn(tid) {
                Ok(true) => attached += 1,
                Ok(false) => {}
                Err(e) => return Err(self.on_attach_failure(e)),
            }
        }
        Ok(attached)
    }

    fn on_attach_failure(&mut self, err: TraceError) -> TraceError {
        match self.config.attach_policy {
            AttachPolicy::Abort => {
                tracing::debug!("Aborting after attach failure: {}", err);
            }
            AttachPolicy::Rollback => {
                tracing::warn!(
                    "Rolling back {} attached threads after: {}",
                    self.loops.len(),
                    err
                );
                self.shutdown.request();
                self.join_all(self.config.shutdown_grace);
            }
        }
        err
    }

    /// Spawn a control thread for `tid` unless one already exists
    ///
    /// Returns Ok(false) for a thread that is already traced. Fails if
    /// the delay has not been published yet.
    pub fn spawn(&mut self, tid: Pid) -> Result<bool> {
        if self.loops.contains_key(&tid) {
            return Ok(false);
        }
        let delay = self.delay.require()?;

        let (attach_tx, attach_rx) = mpsc::sync_channel::<Result<()>>(0);
        let trace = TraceLoop::new(tid, delay, self.shutdown.clone(), self.sink.clone());
        let backend = self.backend.clone();

        let thread = thread::Builder::new()
            .name(format!("trace-{}", tid))
            .spawn(move || match trace.attach(backend) {
                Ok(attached) => {
                    let _ = attach_tx.send(Ok(()));
                    attached.run()
                }
                Err(e) => {
                    let _ = attach_tx.send(Err(e));
                    LoopExit::Lost
                }
            })
            .map_err(|source| TraceError::Spawn { tid, source })?;

        match attach_rx.recv() {
            Ok(Ok(())) => {
                self.loops.insert(tid, TraceHandle { tid, thread });
                Ok(true)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TraceError::ControlThreadLost { tid })
            }
        }
    }

    /// Trace threads that appeared since the last enumeration
    ///
    /// A thread can exit between being listed and being attached, so attach
    /// failures here are warnings. Returns the number of new tracees.
    pub fn rescan(&mut self) -> usize {
        let tids = match discovery::list_threads_in(&self.proc_root, self.config.target) {
            Ok(tids) => tids,
            Err(e) => {
                tracing::debug!("Rescan failed: {}", e);
                return 0;
            }
        };

        let mut added = 0;
        for tid in tids {
            match self.spawn(tid) {
                Ok(true) => {
                    tracing::debug!("Tracing new thread {}", tid);
                    added += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Skipping new thread {}: {}", tid, e),
            }
        }
        added
    }

    /// Join control threads whose loop has terminated
    pub fn reap(&mut self) -> usize {
        let finished: Vec<Pid> = self
            .loops
            .values()
            .filter(|handle| handle.is_finished())
            .map(TraceHandle::tid)
            .collect();

        for tid in &finished {
            if let Some(handle) = self.loops.remove(tid) {
                match handle.thread.join() {
                    Ok(exit) => tracing::debug!("Trace loop for {} terminated: {:?}", tid, exit),
                    Err(_) => tracing::warn!("Trace loop for {} panicked", tid),
                }
            }
        }
        finished.len()
    }

    /// Supervise until shutdown is requested or the target is gone
    pub fn run(&mut self) -> Result<()> {
        let mut last_scan = Instant::now();

        while !self.shutdown.is_requested() {
            thread::sleep(POLL_INTERVAL);
            self.reap();

            if let Some(interval) = self.config.rescan_interval {
                if last_scan.elapsed() >= interval {
                    self.rescan();
                    last_scan = Instant::now();
                }
            }

            if self.loops.is_empty()
                && !discovery::process_exists(&self.proc_root, self.config.target)
            {
                tracing::info!("Process {} is gone, nothing left to trace", self.config.target);
                return Ok(());
            }
        }

        self.join_all(self.config.shutdown_grace);
        Ok(())
    }

    /// Wait up to `grace` for every loop to terminate
    ///
    /// Loops still blocked waiting for their tracee are abandoned; the
    /// kernel detaches their tracees when this process exits. Returns the
    /// number of abandoned loops.
    pub fn join_all(&mut self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.loops.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                let abandoned = self.loops.len();
                tracing::warn!(
                    "{} trace loops still waiting on their tracee, leaving them to the kernel",
                    abandoned
                );
                self.loops.clear();
                return abandoned;
            }
            thread::sleep(POLL_INTERVAL.min(grace));
        }
    }
}

/// Discover the target's threads and attach a trace loop to each
pub fn discover_and_attach(
    config: TracerConfig,
    shutdown: ShutdownFlag,
    sink: Arc<dyn EventSink>,
) -> Result<Supervisor<NixPtrace>> {
    let mut supervisor = Supervisor::new(config, shutdown, sink);
    let attached = supervisor.attach_all()?;
    tracing::info!(
        "Attached to {} threads: {:?}",
        attached,
        supervisor.live_tracees()
    );
    Ok(supervisor)
}
