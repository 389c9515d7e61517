//! CLI argument parsing for sysdelay

use clap::{Parser, ValueEnum};

/// Output format for diagnostic events
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// One JSON object per line
    Json,
}

/// What to do when a thread of the target refuses to be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AttachFailureMode {
    /// Exit immediately with a non-zero status
    Abort,
    /// Detach every thread attached so far, then exit with a non-zero status
    Rollback,
}

#[derive(Parser, Debug)]
#[command(name = "sysdelay")]
#[command(version)]
#[command(about = "Inject latency into every syscall of a running process", long_about = None)]
pub struct Cli {
    /// Process to slow down (all of its threads are traced)
    #[arg(short = 'p', long = "pid", value_name = "PID", allow_hyphen_values = true)]
    pub pid: i64,

    /// Delay injected at the exit of every non-ignored syscall, in microseconds
    #[arg(
        short = 'd',
        long = "delay",
        value_name = "MICROSECONDS",
        allow_hyphen_values = true
    )]
    pub delay: i64,

    /// Also report attach and detach events
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format for events (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output (RUST_LOG is honoured)
    #[arg(long)]
    pub debug: bool,

    /// Policy when attaching to one of the target's threads fails
    #[arg(long = "on-attach-failure", value_enum, default_value = "abort")]
    pub on_attach_failure: AttachFailureMode,

    /// Re-scan the target's threads every MS milliseconds and trace new ones
    #[arg(long = "rescan-ms", value_name = "MS")]
    pub rescan_ms: Option<u64>,

    /// How long shutdown waits for blocked trace loops, in milliseconds
    #[arg(long = "grace-ms", value_name = "MS", default_value = "1000")]
    pub grace_ms: u64,
}
