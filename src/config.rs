//! Validated tracer configuration

use std::time::Duration;

use nix::unistd::Pid;

use crate::cli::{AttachFailureMode, Cli};
use crate::error::ConfigError;

/// How the supervisor reacts when one thread cannot be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPolicy {
    /// Return the error immediately; the process exits and the kernel
    /// releases every tracee still attached
    Abort,
    /// Detach every tracee attached so far before returning the error
    Rollback,
}

impl From<AttachFailureMode> for AttachPolicy {
    fn from(mode: AttachFailureMode) -> Self {
        match mode {
            AttachFailureMode::Abort => AttachPolicy::Abort,
            AttachFailureMode::Rollback => AttachPolicy::Rollback,
        }
    }
}

/// Everything the supervisor needs to run
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Process whose threads are traced
    pub target: Pid,
    pub attach_policy: AttachPolicy,
    /// Re-enumerate the target's threads at this interval (None = one snapshot)
    pub rescan_interval: Option<Duration>,
    /// Upper bound on waiting for trace loops at shutdown
    pub shutdown_grace: Duration,
}

impl TracerConfig {
    /// Validate raw CLI values
    ///
    /// The delay is not part of the config: it is published once to the
    /// [`DelayStore`](crate::delay::DelayStore) and read from there.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let target = validate_pid(cli.pid)?;

        Ok(Self {
            target,
            attach_policy: cli.on_attach_failure.into(),
            rescan_interval: cli
                .rescan_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            shutdown_grace: Duration::from_millis(cli.grace_ms),
        })
    }

    /// Configuration with defaults for everything but the target
    pub fn new(target: Pid) -> Self {
        Self {
            target,
            attach_policy: AttachPolicy::Abort,
            rescan_interval: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Check that a process id is a positive integer that fits a pid_t
pub fn validate_pid(pid: i64) -> Result<Pid, ConfigError> {
    if pid <= 0 {
        return Err(ConfigError::InvalidPid(pid));
    }
    let raw = i32::try_from(pid).map_err(|_| ConfigError::InvalidPid(pid))?;
    Ok(Pid::from_raw(raw))
}

/// Check that a delay is strictly positive
pub fn validate_delay(micros: i64) -> Result<Duration, ConfigError> {
    if micros <= 0 {
        return Err(ConfigError::InvalidDelay(micros));
    }
    Ok(Duration::from_micros(micros as u64))
}
