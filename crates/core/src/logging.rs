//! Logging and observability
//!
//! This module provides structured logging, tracing, and observability utilities.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable controlling the log filter
pub const LOG_ENV_VAR: &str = "HABITAT_LOG";

/// Initialize the logging system
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::debug!("Logging initialized");
    Ok(())
}
