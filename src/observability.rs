//! Logging initialization.

use crate::config::ObservabilityConfig;
use crate::error::{BasaltError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber from configuration.
///
/// Safe to call once per process; a second call reports `Config` instead of
/// panicking so tests can share a process.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| BasaltError::Config(format!("bad log_level filter: {}", e)))?;

    let result = if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.map_err(|e| BasaltError::Config(format!("failed to install subscriber: {}", e)))
}
