/*!
 * Prelude module for camflow core.
 *
 * This module re-exports commonly used types and functions from the camflow
 * core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{AccessMode, CreateHandleMethod, GrabMethod, Id, Rotation, Value};

// Re-export config types
pub use crate::config::{CameraConfig, Config, ConfigBuilder, DispatchConfig};

// Re-export utility functions
pub use crate::utils::{default_multicast_for, host_ip_for, ip_to_u32};

// Re-export logging helpers
pub use crate::logging::{camera_span, dispatch_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
