//! Diagnostics go to stderr through `tracing-subscriber`. The crate logs with
//! the `log` macros; the subscriber's `log` bridge picks those records up.

use std::io;

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Overrides the level chosen from the command line, e.g. `FARMER_LOG=debug`
/// or `FARMER_LOG=farmer::tasklist=trace`.
pub const LOG_ENV: &str = "FARMER_LOG";

pub fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
}
