//! Tracing subscriber setup
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and either
//! a human-readable or a JSON formatting layer. `RUST_LOG` takes precedence
//! over the configured level when it is set and valid.

use pubguard_core::{PubSubError, Result};
use pubguard_domain::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`
///
/// Returns `Ok(true)` when this call installed the subscriber and
/// `Ok(false)` when one was already installed.
///
/// # Errors
/// Returns `PubSubError::Config` when `config.level` is not a valid filter
/// directive and `RUST_LOG` does not override it.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    match installed {
        Ok(()) => {
            tracing::debug!(level = %config.level, format = ?config.format, "tracing_initialised");
            Ok(true)
        }
        Err(err) => {
            tracing::debug!(error = %err, "tracing_already_initialised");
            Ok(false)
        }
    }
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| PubSubError::Config(format!("Invalid log level '{level}': {e}")))
}
