/*!
 * camflow Core
 *
 * This crate provides the shared foundation for camflow: identifiers and
 * parameter values, the camera vocabulary enums, configuration, logging,
 * and address helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tracing;
}

/// camflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("camflow core {} initialized", VERSION);
    Ok(())
}
