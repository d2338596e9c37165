//! # Logging
//!
//! Structured logging through `tracing`. `RUST_LOG` takes precedence over
//! the configured level so a single module can be turned up without editing
//! the config file:
//!
//! ```text
//! RUST_LOG=gquic::session=trace gquicd --config gquicd.toml
//! ```

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Install the global subscriber.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_string()))
        .context("invalid log filter")?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_file(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("logging already initialized")?;

    tracing::info!(%level, "Logging initialized");
    Ok(())
}
