//! Logging setup.
//!
//! Components log through `tracing`; this module only installs a subscriber.
//! Libraries embedding wirelink may install their own instead.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install a global `tracing` subscriber built from the logging configuration.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::level`] when set.
///
/// # Errors
/// Returns [`Error::Configuration`] if the filter directive is malformed or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::configuration(format!("Invalid log level '{}': {e}", config.level)))?,
    };

    let layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| Error::configuration(format!("Failed to install subscriber: {e}")))
}

/// Install a debug-level subscriber for tests, ignoring repeated calls.
pub fn init_test_logging() {
    tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init().ok();
}
