//! Error types for sysdelay
//!
//! Configuration errors are fatal before any tracing starts. Attach errors
//! are escalated to the supervisor, which applies the configured
//! [`AttachPolicy`](crate::config::AttachPolicy). Everything else is
//! contained inside a single trace loop.

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Invalid command-line configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--pid should be > 0 (got {0})")]
    InvalidPid(i64),

    #[error("--delay should be > 0 (got {0})")]
    InvalidDelay(i64),

    #[error("delay has already been published")]
    DelayAlreadySet,

    #[error("delay must be published before any trace loop is spawned")]
    DelayNotPublished,
}

/// Errors raised while discovering, attaching to, or tracing threads
#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to list threads of process {pid}: {source}")]
    Discovery {
        pid: Pid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to attach to thread {tid}: {source}")]
    Attach {
        tid: Pid,
        #[source]
        source: Errno,
    },

    #[error("Failed to detach from thread {tid}: {source}")]
    Detach {
        tid: Pid,
        #[source]
        source: Errno,
    },

    #[error("Failed to spawn control thread for {tid}: {source}")]
    Spawn {
        tid: Pid,
        #[source]
        source: std::io::Error,
    },

    #[error("Control thread for {tid} exited before reporting its attach result")]
    ControlThreadLost { tid: Pid },
}

/// Result type for tracing operations
pub type Result<T> = std::result::Result<T, TraceError>;
