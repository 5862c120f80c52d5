//! Logging setup
//!
//! One `tracing_subscriber` registry with an `EnvFilter` and a fmt layer.
//! `RUST_LOG` wins over the level passed in.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the subscriber
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: `RUST_LOG` if set, otherwise `level`
pub fn env_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => {
            Ok(EnvFilter::new(level.to_ascii_lowercase()))
        }
        _ => Err(TelemetryError::InvalidLevel(level.to_string())),
    }
}

/// Install the global subscriber
///
/// With `json` the fmt layer emits one JSON object per event.
pub fn init_subscriber(level: &str, json: bool) -> Result<(), TelemetryError> {
    let filter = env_filter(level)?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json();
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(filter).with(fmt_layer),
        )
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(filter).with(fmt_layer),
        )
    };

    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(matches!(
            env_filter("loud"),
            Err(TelemetryError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_accepts_known_level() {
        assert!(env_filter("DEBUG").is_ok());
    }
}
