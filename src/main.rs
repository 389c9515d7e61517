use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sysdelay::cli::Cli;
use sysdelay::config::TracerConfig;
use sysdelay::event::Reporter;
use sysdelay::shutdown::{self, ShutdownFlag};
use sysdelay::{delay, supervisor};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = TracerConfig::from_cli(&args)?;
    // Published before any control thread exists
    let delay = delay::global().publish_micros(args.delay)?;

    init_tracing(args.debug);
    tracing::debug!("Injecting {:?} after each delayable syscall", delay);

    let shutdown = ShutdownFlag::new();
    shutdown::install(&shutdown)?;

    let sink = Arc::new(Reporter::new(args.format, args.verbose));
    let target = config.target;
    let mut supervisor = supervisor::discover_and_attach(config, shutdown, sink)
        .with_context(|| format!("Failed to attach to process {}", target))?;

    supervisor.run()?;
    Ok(())
}
