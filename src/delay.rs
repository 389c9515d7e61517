//! Write-once delay store
//!
//! The injected delay is published exactly once, before the first trace
//! loop is spawned, and is read-only afterwards. `OnceLock` gives the
//! release/acquire handoff between the publishing thread and every reader.

use std::sync::OnceLock;
use std::time::Duration;

use crate::config::validate_delay;
use crate::error::ConfigError;

/// Holds the delay injected at every delayable syscall exit
#[derive(Debug, Default)]
pub struct DelayStore {
    value: OnceLock<Duration>,
}

impl DelayStore {
    pub const fn new() -> Self {
        Self {
            value: OnceLock::new(),
        }
    }

    /// Validate and publish the delay in microseconds
    pub fn publish_micros(&self, micros: i64) -> Result<Duration, ConfigError> {
        self.publish(validate_delay(micros)?)
    }

    /// Publish an already validated delay
    pub fn publish(&self, delay: Duration) -> Result<Duration, ConfigError> {
        if delay.is_zero() {
            return Err(ConfigError::InvalidDelay(0));
        }
        self.value
            .set(delay)
            .map_err(|_| ConfigError::DelayAlreadySet)?;
        Ok(delay)
    }

    /// The published delay, if any
    pub fn get(&self) -> Option<Duration> {
        self.value.get().copied()
    }

    /// The published delay, or an error if nothing was published yet
    pub fn require(&self) -> Result<Duration, ConfigError> {
        self.get().ok_or(ConfigError::DelayNotPublished)
    }
}

static DELAY: DelayStore = DelayStore::new();

/// The process-wide store
///
/// `main` publishes into it before the supervisor spawns any trace loop;
/// the supervisor reads it for every loop it spawns.
pub fn global() -> &'static DelayStore {
    &DELAY
}
