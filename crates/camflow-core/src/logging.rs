/*!
 * Logging functionality for camflow.
 *
 * This module provides tracing setup and the spans used to attach camera and
 * fan-out context to log lines.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "camflow_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Initialize the logging system from the `[logging]` config section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    if !config.json_format {
        return init_with_filter(&config.level);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(fmt::layer().json().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for work on a single camera
///
/// # Arguments
///
/// * `address` - The camera's address
/// * `user_id` - The DeviceUserID, if already known
pub fn camera_span(address: &str, user_id: Option<&str>) -> Span {
    match user_id {
        Some(user_id) => tracing::info_span!("camera", address = %address, user_id = %user_id),
        None => tracing::info_span!("camera", address = %address),
    }
}

/// Create a span for one fan-out batch
///
/// # Arguments
///
/// * `operation` - The operation being fanned out
/// * `devices` - The number of devices in the batch
pub fn dispatch_span(operation: &str, devices: usize) -> Span {
    tracing::info_span!("dispatch", operation = %operation, devices = devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Only the first call in the process can install a subscriber
        let _ = init();
        assert!(init_with_filter("debug").is_err());

        let json = LoggingConfig {
            level: "debug".to_string(),
            json_format: true,
        };
        assert!(init_from_config(&json).is_err());
        assert!(init_from_config(&LoggingConfig::default()).is_err());
    }

    #[test]
    fn test_camera_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = camera_span("192.168.1.10", Some("left"));
            assert_eq!(span.metadata().map(|m| m.name()), Some("camera"));

            let span = camera_span("192.168.1.10", None);
            assert!(!span.is_disabled());
        });
    }

    #[test]
    fn test_dispatch_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = dispatch_span("open", 3);
            assert_eq!(span.metadata().map(|m| m.name()), Some("dispatch"));
        });
    }
}
