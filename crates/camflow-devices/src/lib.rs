/*!
 * camflow Devices
 *
 * This crate drives GigE industrial cameras: per-camera handles with a
 * strict lifecycle, a registry that fans operations out to every camera on
 * its own thread, and sessions that enter and release a camera group
 * together. The vendor SDK sits behind the [`sdk::CameraSdk`] trait;
 * [`sdk::sim`] provides an in-process implementation.
 */

#![warn(missing_docs)]

// Re-export core types
pub use camflow_core::prelude;

pub mod camera;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod nodes;
pub mod params;
pub mod registry;
pub mod sdk;
pub mod session;

pub use camera::{Camera, CameraEvent, CameraState};
pub use discovery::{CameraDiscoverer, CameraSelector};
pub use error::{DeviceError, Result};
pub use frame::Image;
pub use params::{CameraParams, CameraSettings, CustomParams, ParamsBlock};
pub use registry::{CameraCommand, CommandOutput, DispatchOptions, Dispatched, MultiCameras};
pub use session::{CameraSession, SessionError, SessionPolicy};

/// camflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
