//! Diagnostic events produced by trace loops, and the stderr reporter
//!
//! Trace loops only build [`TraceEvent`] values and hand them to an
//! [`EventSink`]. Formatting lives in [`Reporter`].

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::syscalls;

/// One observation made by a trace loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Attached {
        tracee: i32,
    },
    IgnoredSyscall {
        tracee: i32,
        syscall: i64,
        name: &'static str,
    },
    DelayedSyscall {
        tracee: i32,
        syscall: i64,
        name: &'static str,
        delay_us: u64,
    },
    TraceeExited {
        tracee: i32,
        status: String,
    },
    AttachFailed {
        tracee: i32,
        cause: String,
    },
    PeekFailed {
        tracee: i32,
        cause: String,
    },
    DetachFailed {
        tracee: i32,
        cause: String,
    },
    Detached {
        tracee: i32,
    },
}

impl TraceEvent {
    pub fn ignored(tracee: i32, syscall: i64) -> Self {
        TraceEvent::IgnoredSyscall {
            tracee,
            syscall,
            name: syscalls::syscall_name(syscall),
        }
    }

    pub fn delayed(tracee: i32, syscall: i64, delay_us: u64) -> Self {
        TraceEvent::DelayedSyscall {
            tracee,
            syscall,
            name: syscalls::syscall_name(syscall),
            delay_us,
        }
    }

    /// Attach/detach bookkeeping, only shown in verbose mode
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            TraceEvent::Attached { .. } | TraceEvent::Detached { .. }
        )
    }

    /// Render as a single human-readable line
    pub fn to_text(&self) -> String {
        match self {
            TraceEvent::Attached { tracee } => format!("[{}] attached", tracee),
            TraceEvent::IgnoredSyscall { tracee, name, .. } => format!("[{}] {}(2)", tracee, name),
            TraceEvent::DelayedSyscall {
                tracee,
                name,
                delay_us,
                ..
            } => format!("[{}] {}(2), usleep = {}", tracee, name, delay_us),
            TraceEvent::TraceeExited { tracee, status } => {
                format!("[{}] tracee exited: {}", tracee, status)
            }
            TraceEvent::AttachFailed { tracee, cause } => {
                format!("[{}] failed to attach: {}", tracee, cause)
            }
            TraceEvent::PeekFailed { tracee, cause } => {
                format!("[{}] failed to read syscall number: {}", tracee, cause)
            }
            TraceEvent::DetachFailed { tracee, cause } => {
                format!("[{}] failed to detach: {}", tracee, cause)
            }
            TraceEvent::Detached { tracee } => format!("[{}] detached", tracee),
        }
    }
}

/// Consumer of trace events, shared by every control thread
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Writes events to stderr, one per line
#[derive(Debug)]
pub struct Reporter {
    format: OutputFormat,
    verbose: bool,
}

impl Reporter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    /// Render an event, or None if this reporter filters it out
    pub fn render(&self, event: &TraceEvent) -> Option<String> {
        if event.is_lifecycle() && !self.verbose {
            return None;
        }
        match self.format {
            OutputFormat::Text => Some(event.to_text()),
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!("Failed to serialize event: {}", e);
                    None
                }
            },
        }
    }
}

impl EventSink for Reporter {
    fn emit(&self, event: TraceEvent) {
        if let Some(line) = self.render(&event) {
            // The stderr lock keeps lines from different control threads whole
            let mut stderr = std::io::stderr().lock();
            writeln!(stderr, "{}", line).ok();
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events emitted so far
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
