//! Process-wide shutdown flag
//!
//! Set once by SIGINT/SIGTERM, polled by every trace loop, never cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

/// Shared "shutdown requested" flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; later calls are no-ops
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Route SIGINT, SIGTERM and SIGHUP to `flag`
///
/// Can only be installed once per process.
pub fn install(flag: &ShutdownFlag) -> Result<()> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        flag.request();
    })
    .context("Failed to install SIGINT/SIGTERM handler")
}
