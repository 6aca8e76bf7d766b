/*!
 * Error types for camera and dispatcher operations.
 */
use thiserror::Error;

use camflow_core::error::Error as CoreError;

use crate::sdk::SdkError;

/// Error type for camera operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The native layer rejected the device address
    #[error("Handle creation failed: {0}")]
    HandleCreation(String),

    /// The device is not reachable under the requested access mode
    #[error("Device not accessible: {0}")]
    Access(String),

    /// The native layer refused to open the device
    #[error("Open failed: {0}")]
    Open(String),

    /// Multicast transmission negotiation failed
    #[error("Transmission configuration failed: {0}")]
    TransmissionConfig(String),

    /// Acquisition could not be started
    #[error("Start grabbing failed: {0}")]
    GrabStart(String),

    /// No frame arrived within the configured timeout
    #[error("Frame timeout: {0}")]
    FrameTimeout(String),

    /// The frame's pixel encoding cannot be converted
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// Enumeration of devices failed
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// Enumeration returned no devices
    #[error("No device found")]
    NoDevice,

    /// The node table declares a data type that cannot be handled
    #[error("Illegal node data type: {0}")]
    ConfigType(String),

    /// The handle is in the wrong lifecycle state for the operation
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// The parameter is not present in the node table
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// The value does not fit the parameter's data type
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The parameter key
        key: String,
        /// What was wrong with the value
        message: String,
    },

    /// An argument was out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Images cannot be saved with this extension
    #[error("Unsupported file format: {0}")]
    UnsupportedFileFormat(String),

    /// The name passed to `invoke` is neither an attribute nor an operation
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A native SDK call failed
    #[error("SDK error: {0}")]
    Sdk(#[from] SdkError),

    /// A fan-out worker could not be spawned
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// A fan-out worker panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was poisoned
    #[error("Lock error: {0}")]
    Lock(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for camera operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Build an `InvalidValue` error
    pub fn invalid_value<K: AsRef<str>, M: AsRef<str>>(key: K, message: M) -> Self {
        DeviceError::InvalidValue {
            key: key.as_ref().to_string(),
            message: message.as_ref().to_string(),
        }
    }

    /// Build a `Lock` error naming the poisoned lock
    pub fn lock<S: AsRef<str>>(what: S) -> Self {
        DeviceError::Lock(format!("Failed to acquire {} lock", what.as_ref()))
    }

    /// Whether the error is a frame timeout, which callers usually retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::FrameTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DeviceError::invalid_value("ExposureTime", "expected float, got string");
        assert_eq!(
            err.to_string(),
            "Invalid value for ExposureTime: expected float, got string"
        );
        assert_eq!(DeviceError::lock("frame").to_string(), "Lock error: Failed to acquire frame lock");
    }

    #[test]
    fn test_sdk_conversion() {
        let err: DeviceError = SdkError::new(0x8000_0203).into();
        assert!(matches!(err, DeviceError::Sdk(ref e) if e.code() == 0x8000_0203));
        assert!(err.to_string().contains("No permission"));
    }

    #[test]
    fn test_is_timeout() {
        assert!(DeviceError::FrameTimeout("camera[10.0.0.1]".into()).is_timeout());
        assert!(!DeviceError::NoDevice.is_timeout());
    }
}
