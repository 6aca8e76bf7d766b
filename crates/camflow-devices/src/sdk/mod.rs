/*!
 * Vendor SDK seam.
 *
 * `CameraSdk` is the process-level half of the vendor library (version,
 * initialization, enumeration, handle creation) and `NativeCamera` is one
 * device handle. Everything above this module talks to cameras only through
 * these two traits, so the same handle logic runs against the real bindings
 * or the in-process [`sim::VirtualSdk`].
 */
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use camflow_core::types::{AccessMode, Value};

use crate::error::{DeviceError, Result};
use crate::nodes::NodeType;

pub mod sim;

/// Vendor "no data" status, returned when a frame wait expires
pub const MV_E_NODATA: u32 = 0x8000_0007;
/// GenICam timeout status
pub const MV_E_GC_TIMEOUT: u32 = 0x8000_0107;
/// Write refused for lack of control permission
pub const MV_E_ACCESS_DENIED: u32 = 0x8000_0203;

const ERROR_DESCRIPTIONS: &[(u32, &str)] = &[
    (0x8000_0000, "Error or invalid handle"),
    (0x8000_0001, "Not supported function"),
    (0x8000_0002, "Buffer overflow"),
    (0x8000_0003, "Function calling order error"),
    (0x8000_0004, "Incorrect parameter"),
    (0x8000_0006, "Applying resource failed"),
    (0x8000_0007, "No data"),
    (0x8000_0008, "Precondition error, or running environment changed"),
    (0x8000_0009, "Version mismatches"),
    (0x8000_000A, "Insufficient memory"),
    (0x8000_000B, "Abnormal image, maybe incomplete image because of lost packet"),
    (0x8000_000C, "Load library failed"),
    (0x8000_000D, "No available buffer"),
    (0x8000_00FF, "Unknown error"),
    (0x8000_0100, "General error"),
    (0x8000_0101, "Illegal parameters"),
    (0x8000_0102, "The value is out of range"),
    (0x8000_0103, "Property"),
    (0x8000_0104, "Running environment error"),
    (0x8000_0105, "Logical error"),
    (0x8000_0106, "Node accessing condition error"),
    (0x8000_0107, "Timeout"),
    (0x8000_0108, "Transformation exception"),
    (0x8000_01FF, "GenICam unknown error"),
    (0x8000_0200, "The command is not supported by device"),
    (0x8000_0201, "The target address being accessed does not exist"),
    (0x8000_0202, "The target address is not writable"),
    (0x8000_0203, "No permission"),
    (0x8000_0204, "Device is busy, or network disconnected"),
    (0x8000_0205, "Network data packet error"),
    (0x8000_0206, "Network error"),
    (0x8000_0221, "Device IP conflict"),
    (0x8000_0300, "Reading USB error"),
    (0x8000_0301, "Writing USB error"),
    (0x8000_0302, "Device exception"),
    (0x8000_0303, "GenICam error"),
    (0x8000_0304, "Insufficient bandwidth"),
    (0x8000_0305, "Driver mismatch or unmounted drive"),
    (0x8000_03FF, "USB unknown error"),
    (0x8000_0400, "Firmware mismatches"),
    (0x8000_0401, "Firmware language mismatches"),
    (0x8000_0402, "Upgrading conflicted"),
    (0x8000_0403, "Camera internal error during upgrade"),
    (0x8000_04FF, "Unknown error during upgrade"),
];

/// Look up the vendor description of a status code
pub fn describe_code(code: u32) -> &'static str {
    ERROR_DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .unwrap_or("Unknown error code")
}

/// A failed vendor call, carrying the raw status code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("error code[{code:#010X} {}]", describe_code(*.code))]
pub struct SdkError {
    code: u32,
}

impl SdkError {
    /// Wrap a vendor status code
    pub fn new(code: u32) -> Self {
        Self { code }
    }

    /// The raw status code
    pub fn code(&self) -> u32 {
        self.code
    }

    /// The vendor description of the code
    pub fn description(&self) -> &'static str {
        describe_code(self.code)
    }

    /// Whether the code means a frame wait expired
    pub fn is_timeout(&self) -> bool {
        matches!(self.code, MV_E_NODATA | MV_E_GC_TIMEOUT)
    }
}

/// Packed SDK version, one byte per component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SdkVersion(pub u32);

impl SdkVersion {
    /// Build a version from its four components
    pub fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        Self(u32::from_be_bytes([major, minor, patch, build]))
    }

    /// Major component
    pub fn major(&self) -> u8 {
        self.0.to_be_bytes()[0]
    }

    /// Minor component
    pub fn minor(&self) -> u8 {
        self.0.to_be_bytes()[1]
    }

    /// Whether the library must be explicitly initialized (only above 4.2)
    pub fn requires_initialize(&self) -> bool {
        (self.major(), self.minor()) > (4, 2)
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{:x}.{:x}.{:x}.{:x}", a, b, c, d)
    }
}

/// Transport layer a device is attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// GigE Vision
    GigE,
    /// USB3 Vision
    Usb,
}

/// What the SDK needs to know to create a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Transport layer
    pub transport: TransportKind,
    /// Current device address
    pub address: Ipv4Addr,
    /// Local interface used to reach the device, if pinned
    pub host_interface: Option<Ipv4Addr>,
    /// Model name, filled in by enumeration
    pub model: Option<String>,
    /// Serial number, filled in by enumeration
    pub serial: Option<String>,
}

impl DeviceDescriptor {
    /// Descriptor for connecting directly by address, without enumeration
    pub fn direct(address: Ipv4Addr, host_interface: Option<Ipv4Addr>) -> Self {
        Self {
            transport: TransportKind::GigE,
            address,
            host_interface,
            model: None,
            serial: None,
        }
    }
}

/// Vendor pixel format code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelType(pub u32);

impl PixelType {
    /// 8-bit monochrome
    pub const MONO8: PixelType = PixelType(0x0108_0001);
    /// 8-bit packed RGB
    pub const RGB8_PACKED: PixelType = PixelType(0x0218_0014);
    /// 8-bit Bayer RG, which frame conversion does not handle
    pub const BAYER_RG8: PixelType = PixelType(0x0108_0009);

    /// Bytes per pixel, if known
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match *self {
            PixelType::MONO8 | PixelType::BAYER_RG8 => Some(1),
            PixelType::RGB8_PACKED => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PixelType::MONO8 => write!(f, "Mono8"),
            PixelType::RGB8_PACKED => write!(f, "RGB8_Packed"),
            PixelType::BAYER_RG8 => write!(f, "BayerRG8"),
            PixelType(code) => write!(f, "{:#010X}", code),
        }
    }
}

/// Metadata of one delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel encoding
    pub pixel_type: PixelType,
    /// Device frame counter
    pub frame_num: u32,
    /// Number of valid bytes in the frame
    pub frame_len: usize,
    /// Host timestamp in milliseconds
    pub host_timestamp: i64,
}

/// A frame buffer owned by the SDK, which must be handed back with
/// [`NativeCamera::free_image_buffer`]
#[derive(Debug)]
pub struct SdkBuffer {
    /// SDK bookkeeping id
    pub id: u64,
    /// Frame metadata
    pub info: FrameInfo,
    /// Frame bytes
    pub data: Vec<u8>,
}

/// Callback invoked on an SDK-owned thread for every frame
pub type FrameCallback = Box<dyn Fn(&[u8], &FrameInfo) + Send + Sync>;

/// Container format for [`NativeCamera::save_image_to_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFileType {
    /// JPEG
    Jpeg,
    /// PNG
    Png,
    /// BMP
    Bmp,
}

/// Arguments of a vendor-side image save
#[derive(Debug)]
pub struct SaveImageParams<'a> {
    /// Destination file
    pub path: PathBuf,
    /// Container format
    pub image_type: ImageFileType,
    /// Metadata of the raw frame
    pub info: FrameInfo,
    /// Raw frame bytes
    pub data: &'a [u8],
    /// JPEG quality, 51..=99
    pub quality: u32,
    /// Bayer interpolation method, 0..=3
    pub interpolation: u32,
}

/// Process-level SDK entry points
pub trait CameraSdk: Send + Sync + fmt::Debug {
    /// Packed library version
    fn version(&self) -> SdkVersion;

    /// Initialize the library
    fn initialize(&self) -> std::result::Result<(), SdkError>;

    /// Release library resources
    fn finalize(&self) -> std::result::Result<(), SdkError>;

    /// List attached devices on a transport
    fn enumerate_devices(
        &self,
        transport: TransportKind,
    ) -> std::result::Result<Vec<DeviceDescriptor>, SdkError>;

    /// Whether the device can be opened with the given access mode
    fn is_accessible(&self, descriptor: &DeviceDescriptor, mode: AccessMode) -> bool;

    /// Create a native handle for the device
    fn create_handle(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> std::result::Result<Arc<dyn NativeCamera>, SdkError>;
}

/// One native device handle
pub trait NativeCamera: Send + Sync + fmt::Debug {
    /// Open the device
    fn open(&self, mode: AccessMode, switchover_key: u32) -> std::result::Result<(), SdkError>;

    /// Close the device
    fn close(&self) -> std::result::Result<(), SdkError>;

    /// Release the handle
    fn destroy(&self) -> std::result::Result<(), SdkError>;

    /// Switch the stream to multicast to the given group
    fn set_transmission_type(&self, group: SocketAddrV4) -> std::result::Result<(), SdkError>;

    /// Best packet size for the link (GigE only)
    fn optimal_packet_size(&self) -> std::result::Result<u32, SdkError>;

    /// Read a node
    fn get_value(&self, key: &str, node_type: NodeType) -> std::result::Result<Value, SdkError>;

    /// Write a node
    fn set_value(
        &self,
        key: &str,
        node_type: NodeType,
        value: &Value,
    ) -> std::result::Result<(), SdkError>;

    /// Execute a command node
    fn execute_command(&self, key: &str) -> std::result::Result<(), SdkError>;

    /// Register the push callback, before acquisition starts
    fn register_frame_callback(&self, callback: FrameCallback)
        -> std::result::Result<(), SdkError>;

    /// Start acquisition
    fn start_grab(&self) -> std::result::Result<(), SdkError>;

    /// Stop acquisition
    fn stop_grab(&self) -> std::result::Result<(), SdkError>;

    /// Copy the next frame into `buffer`, waiting at most `timeout`
    fn get_one_frame(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<FrameInfo, SdkError>;

    /// Borrow the next SDK-owned frame buffer, waiting at most `timeout`
    fn get_image_buffer(&self, timeout: Duration) -> std::result::Result<SdkBuffer, SdkError>;

    /// Return a buffer obtained from `get_image_buffer`
    fn free_image_buffer(&self, buffer: SdkBuffer) -> std::result::Result<(), SdkError>;

    /// Encode a raw frame to a file with the vendor encoder
    fn save_image_to_file(&self, params: &SaveImageParams<'_>) -> std::result::Result<(), SdkError>;
}

/// Lifecycle of the process-wide SDK context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkState {
    /// Not initialized yet
    Uninitialized,
    /// Initialized and usable
    Initialized,
    /// Finalized, cannot be used again
    Finalized,
}

/// Process-scoped SDK context
///
/// Initialization and finalization each happen at most once. Every camera
/// and discoverer is handed the context explicitly.
#[derive(Debug)]
pub struct SdkContext {
    sdk: Arc<dyn CameraSdk>,
    state: Mutex<SdkState>,
}

impl SdkContext {
    /// Wrap an SDK implementation
    pub fn new(sdk: Arc<dyn CameraSdk>) -> Self {
        Self {
            sdk,
            state: Mutex::new(SdkState::Uninitialized),
        }
    }

    /// Wrap an SDK implementation in a shareable context
    pub fn shared(sdk: Arc<dyn CameraSdk>) -> Arc<Self> {
        Arc::new(Self::new(sdk))
    }

    /// The underlying SDK
    pub fn sdk(&self) -> &Arc<dyn CameraSdk> {
        &self.sdk
    }

    /// The SDK version
    pub fn version(&self) -> SdkVersion {
        self.sdk.version()
    }

    /// Current lifecycle state
    pub fn state(&self) -> Result<SdkState> {
        let state = self.state.lock().map_err(|_| DeviceError::lock("SDK context"))?;
        Ok(*state)
    }

    /// Initialize the SDK if that has not happened yet
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| DeviceError::lock("SDK context"))?;
        match *state {
            SdkState::Initialized => Ok(()),
            SdkState::Finalized => Err(DeviceError::InvalidState(
                "SDK context already finalized".to_string(),
            )),
            SdkState::Uninitialized => {
                let version = self.sdk.version();
                if version.requires_initialize() {
                    self.sdk.initialize()?;
                    info!("Initialized camera SDK {}", version);
                } else {
                    debug!("Camera SDK {} needs no initialization", version);
                }
                *state = SdkState::Initialized;
                Ok(())
            }
        }
    }

    /// Finalize the SDK; later calls are no-ops
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| DeviceError::lock("SDK context"))?;
        if *state == SdkState::Initialized {
            let version = self.sdk.version();
            if version.requires_initialize() {
                self.sdk.finalize()?;
            }
            info!("Finalized camera SDK {}", version);
        }
        *state = SdkState::Finalized;
        Ok(())
    }
}

impl Drop for SdkContext {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize camera SDK: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::VirtualSdk;
    use super::*;

    #[test]
    fn test_sdk_error_display() {
        let err = SdkError::new(0x8000_0107);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "error code[0x80000107 Timeout]");
        assert_eq!(SdkError::new(0x1234).description(), "Unknown error code");

        let boxed: Box<dyn std::error::Error> = Box::new(SdkError::new(0x8000_0203));
        assert_eq!(boxed.to_string(), "error code[0x80000203 No permission]");
    }

    #[test]
    fn test_version_decoding() {
        let version = SdkVersion(0x0403_0102);
        assert_eq!(version.to_string(), "4.3.1.2");
        assert!(version.requires_initialize());
        assert!(!SdkVersion::new(4, 2, 9, 9).requires_initialize());
        assert!(!SdkVersion::new(3, 9, 0, 0).requires_initialize());
        assert_eq!(SdkVersion::new(0x10, 0, 0, 0).to_string(), "10.0.0.0");
    }

    #[test]
    fn test_context_initializes_once() {
        let sdk = Arc::new(VirtualSdk::new());
        let ctx = SdkContext::new(sdk.clone());
        assert_eq!(ctx.state().unwrap(), SdkState::Uninitialized);

        ctx.initialize().unwrap();
        ctx.initialize().unwrap();
        assert_eq!(sdk.initialize_calls(), 1);

        ctx.finalize().unwrap();
        ctx.finalize().unwrap();
        assert_eq!(sdk.finalize_calls(), 1);
        assert!(matches!(ctx.initialize(), Err(DeviceError::InvalidState(_))));
    }

    #[test]
    fn test_context_skips_initialize_on_old_sdk() {
        let sdk = Arc::new(VirtualSdk::with_version(SdkVersion::new(4, 1, 0, 0)));
        let ctx = SdkContext::new(sdk.clone());
        ctx.initialize().unwrap();
        assert_eq!(ctx.state().unwrap(), SdkState::Initialized);
        assert_eq!(sdk.initialize_calls(), 0);
    }

    #[test]
    fn test_context_finalizes_on_drop() {
        let sdk = Arc::new(VirtualSdk::new());
        {
            let ctx = SdkContext::new(sdk.clone());
            ctx.initialize().unwrap();
        }
        assert_eq!(sdk.finalize_calls(), 1);
    }
}
