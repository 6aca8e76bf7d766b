/*!
 * In-process camera SDK.
 *
 * `VirtualSdk` behaves like the vendor library for a set of simulated GigE
 * devices: handles open and close, nodes keep their values, acquisition
 * produces synthetic frames, and the callback mode runs its own grab thread.
 * Each device can be scripted to fail or stall at any call, and keeps a
 * journal of the calls it received.
 */
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use camflow_core::types::{AccessMode, Value};
use camflow_core::utils::ip_to_u32;

use super::{
    CameraSdk, DeviceDescriptor, FrameCallback, FrameInfo, NativeCamera,
    PixelType, SaveImageParams, SdkBuffer, SdkError, SdkVersion, TransportKind, MV_E_ACCESS_DENIED,
    MV_E_NODATA,
};
use crate::frame::{Image, SaveOptions};
use crate::nodes::{NodeTable, NodeType};

const MV_E_HANDLE: u32 = 0x8000_0000;
const MV_E_SUPPORT: u32 = 0x8000_0001;
const MV_E_CALLORDER: u32 = 0x8000_0003;
const MV_E_PARAMETER: u32 = 0x8000_0004;
const MV_E_RESOURCE: u32 = 0x8000_0006;
const MV_E_NOENOUGH_BUF: u32 = 0x8000_000A;
const MV_E_GC_RANGE: u32 = 0x8000_0102;
const MV_E_GC_ACCESS: u32 = 0x8000_0106;

/// Optimal packet size reported for GigE devices
pub const VIRTUAL_PACKET_SIZE: u32 = 8164;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A native call that can be scripted to fail or stall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPoint {
    /// `CameraSdk::create_handle`
    CreateHandle,
    /// `NativeCamera::open`
    Open,
    /// `NativeCamera::close`
    Close,
    /// `NativeCamera::destroy`
    Destroy,
    /// `NativeCamera::set_transmission_type`
    SetTransmission,
    /// `NativeCamera::optimal_packet_size`
    PacketSize,
    /// `NativeCamera::get_value`
    GetValue,
    /// `NativeCamera::set_value`
    SetValue,
    /// `NativeCamera::execute_command`
    Command,
    /// `NativeCamera::register_frame_callback`
    RegisterCallback,
    /// `NativeCamera::start_grab`
    StartGrab,
    /// `NativeCamera::stop_grab`
    StopGrab,
    /// `get_one_frame` and `get_image_buffer`
    GetFrame,
    /// `NativeCamera::save_image_to_file`
    SaveImage,
}

/// Description of a simulated device
#[derive(Debug, Clone)]
pub struct VirtualDeviceSpec {
    address: Ipv4Addr,
    transport: TransportKind,
    model: String,
    serial: String,
    user_id: String,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    frame_interval: Duration,
    failures: HashMap<CallPoint, u32>,
    delays: HashMap<CallPoint, Duration>,
    inaccessible: Vec<AccessMode>,
    values: BTreeMap<String, Value>,
}

impl VirtualDeviceSpec {
    /// A 64x48 Mono8 GigE device at `address`
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            transport: TransportKind::GigE,
            model: "MV-CA050-10GM".to_string(),
            serial: format!("VIRT{:08X}", ip_to_u32(address)),
            user_id: String::new(),
            width: 64,
            height: 48,
            pixel_type: PixelType::MONO8,
            frame_interval: Duration::from_millis(5),
            failures: HashMap::new(),
            delays: HashMap::new(),
            inaccessible: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    /// Set the DeviceUserID
    pub fn with_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Set the sensor size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the pixel encoding of produced frames
    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    /// Set the time between frames
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Attach the device through USB instead of GigE
    pub fn usb(mut self) -> Self {
        self.transport = TransportKind::Usb;
        self
    }

    /// Make every call at `point` fail with `code`
    pub fn failing_at(mut self, point: CallPoint, code: u32) -> Self {
        self.failures.insert(point, code);
        self
    }

    /// Make every call at `point` take at least `delay`
    pub fn delayed_at(mut self, point: CallPoint, delay: Duration) -> Self {
        self.delays.insert(point, delay);
        self
    }

    /// Report the device as unreachable under `mode`
    pub fn inaccessible_in(mut self, mode: AccessMode) -> Self {
        self.inaccessible.push(mode);
        self
    }

    /// Preset a node value
    pub fn with_value<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
struct Script {
    failures: HashMap<CallPoint, u32>,
    delays: HashMap<CallPoint, Duration>,
    inaccessible: Vec<AccessMode>,
    pixel_type: PixelType,
    frame_interval: Duration,
}

/// A simulated device, shared by every handle created for it
#[derive(Debug)]
pub struct VirtualDevice {
    address: Ipv4Addr,
    transport: TransportKind,
    model: String,
    serial: String,
    script: Mutex<Script>,
    values: Mutex<BTreeMap<String, Value>>,
    journal: Mutex<Vec<String>>,
    opened: AtomicBool,
    grabbing: AtomicBool,
    outstanding_buffers: AtomicUsize,
    transmission: Mutex<Option<SocketAddrV4>>,
    access: Mutex<Option<AccessMode>>,
}

impl VirtualDevice {
    fn from_spec(spec: VirtualDeviceSpec) -> Self {
        let mut values = BTreeMap::new();
        values.insert("DeviceUserID".to_string(), Value::String(spec.user_id));
        values.insert("DeviceModelName".to_string(), Value::String(spec.model.clone()));
        values.insert("DeviceSerialNumber".to_string(), Value::String(spec.serial.clone()));
        values.insert("Width".to_string(), Value::Integer(spec.width as i64));
        values.insert("Height".to_string(), Value::Integer(spec.height as i64));
        values.insert("PixelFormat".to_string(), Value::Integer(spec.pixel_type.0 as i64));
        values.insert(
            "GevCurrentIPAddress".to_string(),
            Value::Integer(ip_to_u32(spec.address) as i64),
        );
        values.insert("GevSCPSPacketSize".to_string(), Value::Integer(1500));
        values.insert("ExposureTime".to_string(), Value::Float(10000.0));
        values.insert("Gain".to_string(), Value::Float(0.0));
        values.insert("TriggerMode".to_string(), Value::Integer(0));
        values.insert("AcquisitionMode".to_string(), Value::Integer(2));
        values.extend(spec.values);

        Self {
            address: spec.address,
            transport: spec.transport,
            model: spec.model,
            serial: spec.serial,
            script: Mutex::new(Script {
                failures: spec.failures,
                delays: spec.delays,
                inaccessible: spec.inaccessible,
                pixel_type: spec.pixel_type,
                frame_interval: spec.frame_interval,
            }),
            values: Mutex::new(values),
            journal: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            grabbing: AtomicBool::new(false),
            outstanding_buffers: AtomicUsize::new(0),
            transmission: Mutex::new(None),
            access: Mutex::new(None),
        }
    }

    /// Device address
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Make calls at `point` fail with `code` from now on
    pub fn inject_failure(&self, point: CallPoint, code: u32) {
        lock(&self.script).failures.insert(point, code);
    }

    /// Stop failing calls at `point`
    pub fn clear_failure(&self, point: CallPoint) {
        lock(&self.script).failures.remove(&point);
    }

    /// Change the pixel encoding of frames produced from now on
    pub fn set_pixel_type(&self, pixel_type: PixelType) {
        lock(&self.script).pixel_type = pixel_type;
    }

    /// Every call received so far, oldest first
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    /// How many times a call was received
    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.journal).iter().filter(|c| c.as_str() == call).count()
    }

    /// Whether the device is currently open
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether the device is currently streaming
    pub fn is_grabbing(&self) -> bool {
        self.grabbing.load(Ordering::SeqCst)
    }

    /// SDK buffers handed out and not yet freed
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding_buffers.load(Ordering::SeqCst)
    }

    /// The multicast group the stream was switched to, if any
    pub fn transmission(&self) -> Option<SocketAddrV4> {
        *lock(&self.transmission)
    }

    /// The access mode the device was last opened with
    pub fn access_mode(&self) -> Option<AccessMode> {
        *lock(&self.access)
    }

    /// Current value of a node
    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            transport: self.transport,
            address: self.address,
            host_interface: None,
            model: Some(self.model.clone()),
            serial: Some(self.serial.clone()),
        }
    }

    /// Record the call, apply its scripted delay, then its scripted failure
    fn enter(&self, point: CallPoint, call: &str) -> Result<(), SdkError> {
        lock(&self.journal).push(call.to_string());
        let (delay, failure) = {
            let script = lock(&self.script);
            (script.delays.get(&point).copied(), script.failures.get(&point).copied())
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        match failure {
            Some(code) => Err(SdkError::new(code)),
            None => Ok(()),
        }
    }

    fn dimension(&self, key: &str) -> u32 {
        lock(&self.values)
            .get(key)
            .and_then(Value::as_integer)
            .unwrap_or(0)
            .max(0) as u32
    }

    fn payload_size(&self) -> usize {
        let bpp = lock(&self.script).pixel_type.bytes_per_pixel().unwrap_or(1);
        self.dimension("Width") as usize * self.dimension("Height") as usize * bpp
    }

    fn synthesize(&self, frame_num: u32) -> (Vec<u8>, FrameInfo) {
        let pixel_type = lock(&self.script).pixel_type;
        let width = self.dimension("Width");
        let height = self.dimension("Height");
        let bpp = pixel_type.bytes_per_pixel().unwrap_or(1);

        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            for x in 0..width {
                let level = (x + y + frame_num) as u8;
                for _ in 0..bpp {
                    data.push(level);
                }
            }
        }

        let info = FrameInfo {
            width,
            height,
            pixel_type,
            frame_num,
            frame_len: data.len(),
            host_timestamp: chrono::Utc::now().timestamp_millis(),
        };
        (data, info)
    }

    fn frame_interval(&self) -> Duration {
        lock(&self.script).frame_interval
    }
}

/// Simulated SDK over a set of [`VirtualDevice`]s
#[derive(Debug)]
pub struct VirtualSdk {
    version: SdkVersion,
    nodes: Arc<NodeTable>,
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    enumerate_failure: Mutex<Option<u32>>,
    initialize_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl VirtualSdk {
    /// An SDK reporting version 4.4.0.0 with no devices
    pub fn new() -> Self {
        Self::with_version(SdkVersion::new(4, 4, 0, 0))
    }

    /// An SDK reporting `version` with no devices
    pub fn with_version(version: SdkVersion) -> Self {
        Self {
            version,
            nodes: Arc::new(NodeTable::builtin()),
            devices: Mutex::new(Vec::new()),
            enumerate_failure: Mutex::new(None),
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    /// Use `nodes` to resolve enumeration labels written by name
    pub fn with_nodes(mut self, nodes: Arc<NodeTable>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Attach a device, returning its control handle
    pub fn add_device(&self, spec: VirtualDeviceSpec) -> Arc<VirtualDevice> {
        let device = Arc::new(VirtualDevice::from_spec(spec));
        lock(&self.devices).push(device.clone());
        device
    }

    /// Attach plain devices at each address
    pub fn with_devices<I: IntoIterator<Item = Ipv4Addr>>(self, addresses: I) -> Self {
        for address in addresses {
            self.add_device(VirtualDeviceSpec::new(address));
        }
        self
    }

    /// Find an attached device
    pub fn device(&self, address: Ipv4Addr) -> Option<Arc<VirtualDevice>> {
        lock(&self.devices).iter().find(|d| d.address == address).cloned()
    }

    /// Make enumeration fail with `code`, or succeed again with `None`
    pub fn fail_enumeration(&self, code: Option<u32>) {
        *lock(&self.enumerate_failure) = code;
    }

    /// Number of `initialize` calls received
    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Number of `finalize` calls received
    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

impl Default for VirtualSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSdk for VirtualSdk {
    fn version(&self) -> SdkVersion {
        self.version
    }

    fn initialize(&self) -> Result<(), SdkError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finalize(&self) -> Result<(), SdkError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enumerate_devices(&self, transport: TransportKind) -> Result<Vec<DeviceDescriptor>, SdkError> {
        if let Some(code) = *lock(&self.enumerate_failure) {
            return Err(SdkError::new(code));
        }
        Ok(lock(&self.devices)
            .iter()
            .filter(|d| d.transport == transport)
            .map(|d| d.descriptor())
            .collect())
    }

    fn is_accessible(&self, descriptor: &DeviceDescriptor, mode: AccessMode) -> bool {
        match self.device(descriptor.address) {
            Some(device) => !lock(&device.script).inaccessible.contains(&mode),
            None => false,
        }
    }

    fn create_handle(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn NativeCamera>, SdkError> {
        let device = self
            .device(descriptor.address)
            .ok_or_else(|| SdkError::new(MV_E_PARAMETER))?;
        let call = match descriptor.host_interface {
            Some(host) => format!("create_handle via {}", host),
            None => "create_handle".to_string(),
        };
        device.enter(CallPoint::CreateHandle, &call)?;

        Ok(Arc::new(VirtualCamera {
            device,
            nodes: self.nodes.clone(),
            callback: Mutex::new(None),
            pump: Mutex::new(None),
            frame_counter: Arc::new(AtomicU64::new(0)),
            next_buffer_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct Pump {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Native handle onto a [`VirtualDevice`]
pub struct VirtualCamera {
    device: Arc<VirtualDevice>,
    nodes: Arc<NodeTable>,
    callback: Mutex<Option<Arc<FrameCallback>>>,
    pump: Mutex<Option<Pump>>,
    frame_counter: Arc<AtomicU64>,
    next_buffer_id: AtomicU64,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for VirtualCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCamera")
            .field("address", &self.device.address)
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl VirtualCamera {
    fn ensure_live(&self) -> Result<(), SdkError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SdkError::new(MV_E_HANDLE))
        } else {
            Ok(())
        }
    }

    fn ensure_opened(&self) -> Result<(), SdkError> {
        self.ensure_live()?;
        if self.device.is_opened() {
            Ok(())
        } else {
            Err(SdkError::new(MV_E_CALLORDER))
        }
    }

    fn next_frame(&self, timeout: Duration) -> Result<(Vec<u8>, FrameInfo), SdkError> {
        if !self.device.is_grabbing() {
            return Err(SdkError::new(MV_E_CALLORDER));
        }
        let interval = self.device.frame_interval();
        if interval > timeout {
            thread::sleep(timeout);
            return Err(SdkError::new(MV_E_NODATA));
        }
        thread::sleep(interval);
        let frame_num = self.frame_counter.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(self.device.synthesize(frame_num))
    }

    fn stop_pump(&self) {
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            pump.stop.store(true, Ordering::SeqCst);
            if pump.handle.join().is_err() {
                debug!("Virtual grab thread for {} panicked", self.device.address);
            }
        }
    }

    fn check_type(key: &str, node_type: NodeType, value: &Value) -> Result<(), SdkError> {
        let ok = match node_type {
            NodeType::Boolean => value.as_bool().is_some(),
            NodeType::Enumeration | NodeType::Integer => value.as_integer().is_some(),
            NodeType::Float => value.as_float().is_some(),
            NodeType::String => value.as_str().is_some(),
            NodeType::Command => true,
        };
        if ok {
            Ok(())
        } else {
            trace!("Rejected {} value {} for {}", node_type, value, key);
            Err(SdkError::new(MV_E_PARAMETER))
        }
    }
}

impl NativeCamera for VirtualCamera {
    fn open(&self, mode: AccessMode, _switchover_key: u32) -> Result<(), SdkError> {
        self.ensure_live()?;
        self.device.enter(CallPoint::Open, "open")?;
        if self.device.opened.swap(true, Ordering::SeqCst) {
            return Err(SdkError::new(MV_E_CALLORDER));
        }
        *lock(&self.device.access) = Some(mode);
        Ok(())
    }

    fn close(&self) -> Result<(), SdkError> {
        self.ensure_live()?;
        self.device.enter(CallPoint::Close, "close")?;
        self.stop_pump();
        self.device.grabbing.store(false, Ordering::SeqCst);
        self.device.opened.store(false, Ordering::SeqCst);
        *lock(&self.device.transmission) = None;
        Ok(())
    }

    fn destroy(&self) -> Result<(), SdkError> {
        self.ensure_live()?;
        self.device.enter(CallPoint::Destroy, "destroy")?;
        self.stop_pump();
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_transmission_type(&self, group: SocketAddrV4) -> Result<(), SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::SetTransmission, "set_transmission_type")?;
        *lock(&self.device.transmission) = Some(group);
        Ok(())
    }

    fn optimal_packet_size(&self) -> Result<u32, SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::PacketSize, "optimal_packet_size")?;
        match self.device.transport {
            TransportKind::GigE => Ok(VIRTUAL_PACKET_SIZE),
            TransportKind::Usb => Err(SdkError::new(MV_E_SUPPORT)),
        }
    }

    fn get_value(&self, key: &str, node_type: NodeType) -> Result<Value, SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::GetValue, &format!("get {}", key))?;
        if key == "PayloadSize" {
            return Ok(Value::Integer(self.device.payload_size() as i64));
        }
        let value = self
            .device
            .value(key)
            .ok_or_else(|| SdkError::new(MV_E_GC_ACCESS))?;
        Self::check_type(key, node_type, &value)?;
        Ok(value)
    }

    fn set_value(&self, key: &str, node_type: NodeType, value: &Value) -> Result<(), SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::SetValue, &format!("set {}", key))?;
        if *lock(&self.device.access) == Some(AccessMode::Monitor) {
            return Err(SdkError::new(MV_E_ACCESS_DENIED));
        }

        let value = match (node_type, value) {
            (NodeType::Enumeration, Value::String(label)) => {
                let entry = self.nodes.get(key).ok_or_else(|| SdkError::new(MV_E_GC_ACCESS))?;
                Value::Integer(entry.enum_value(label).ok_or_else(|| SdkError::new(MV_E_GC_RANGE))?)
            }
            (NodeType::Float, Value::Integer(i)) => Value::Float(*i as f64),
            (_, other) => other.clone(),
        };
        Self::check_type(key, node_type, &value)?;

        if key == "PixelFormat" {
            if let Some(code) = value.as_integer() {
                self.device.set_pixel_type(PixelType(code as u32));
            }
        }
        lock(&self.device.values).insert(key.to_string(), value);
        Ok(())
    }

    fn execute_command(&self, key: &str) -> Result<(), SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::Command, &format!("execute {}", key))
    }

    fn register_frame_callback(&self, callback: FrameCallback) -> Result<(), SdkError> {
        self.ensure_live()?;
        self.device.enter(CallPoint::RegisterCallback, "register_frame_callback")?;
        *lock(&self.callback) = Some(Arc::new(callback));
        Ok(())
    }

    fn start_grab(&self) -> Result<(), SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::StartGrab, "start_grab")?;
        if self.device.grabbing.swap(true, Ordering::SeqCst) {
            return Err(SdkError::new(MV_E_CALLORDER));
        }

        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            let stop = Arc::new(AtomicBool::new(false));
            let device = self.device.clone();
            let counter = self.frame_counter.clone();
            let thread_stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("virtual-grab-{}", device.address))
                .spawn(move || {
                    while !thread_stop.load(Ordering::SeqCst) {
                        thread::sleep(device.frame_interval());
                        if thread_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let frame_num = counter.fetch_add(1, Ordering::SeqCst) as u32;
                        let (data, info) = device.synthesize(frame_num);
                        (**callback)(&data[..], &info);
                    }
                })
                .map_err(|_| SdkError::new(MV_E_RESOURCE))?;
            *lock(&self.pump) = Some(Pump { stop, handle });
        }
        Ok(())
    }

    fn stop_grab(&self) -> Result<(), SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::StopGrab, "stop_grab")?;
        self.stop_pump();
        self.device.grabbing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get_one_frame(&self, buffer: &mut [u8], timeout: Duration) -> Result<FrameInfo, SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::GetFrame, "get_one_frame")?;
        let (data, info) = self.next_frame(timeout)?;
        if buffer.len() < data.len() {
            return Err(SdkError::new(MV_E_NOENOUGH_BUF));
        }
        buffer[..data.len()].copy_from_slice(&data);
        Ok(info)
    }

    fn get_image_buffer(&self, timeout: Duration) -> Result<SdkBuffer, SdkError> {
        self.ensure_opened()?;
        self.device.enter(CallPoint::GetFrame, "get_image_buffer")?;
        let (data, info) = self.next_frame(timeout)?;
        self.device.outstanding_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(SdkBuffer {
            id: self.next_buffer_id.fetch_add(1, Ordering::SeqCst),
            info,
            data,
        })
    }

    fn free_image_buffer(&self, buffer: SdkBuffer) -> Result<(), SdkError> {
        self.ensure_live()?;
        lock(&self.device.journal).push(format!("free_image_buffer {}", buffer.id));
        self.device.outstanding_buffers.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn save_image_to_file(&self, params: &SaveImageParams<'_>) -> Result<(), SdkError> {
        self.ensure_live()?;
        self.device.enter(CallPoint::SaveImage, "save_image_to_file")?;
        let image = Image::from_raw(params.data, &params.info).map_err(|_| SdkError::new(MV_E_SUPPORT))?;
        let options = SaveOptions {
            jpeg_quality: params.quality.min(100) as u8,
            ..SaveOptions::default()
        };
        trace!("Saving {:?} image to {}", params.image_type, params.path.display());
        image
            .save(&params.path, &options)
            .map_err(|_| SdkError::new(MV_E_PARAMETER))
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn opened_camera(sdk: &VirtualSdk, last: u8) -> Arc<dyn NativeCamera> {
        let handle = sdk.create_handle(&DeviceDescriptor::direct(addr(last), None)).unwrap();
        handle.open(AccessMode::Exclusive, 0).unwrap();
        handle
    }

    #[test]
    fn test_enumeration_keeps_insertion_order() {
        let sdk = VirtualSdk::new().with_devices([addr(20), addr(10)]);
        sdk.add_device(VirtualDeviceSpec::new(addr(30)).usb());

        let found = sdk.enumerate_devices(TransportKind::GigE).unwrap();
        let addresses: Vec<_> = found.iter().map(|d| d.address).collect();
        assert_eq!(addresses, vec![addr(20), addr(10)]);

        sdk.fail_enumeration(Some(0x8000_0206));
        assert_eq!(sdk.enumerate_devices(TransportKind::GigE).unwrap_err().code(), 0x8000_0206);
    }

    #[test]
    fn test_unknown_address_rejected() {
        let sdk = VirtualSdk::new();
        let err = sdk.create_handle(&DeviceDescriptor::direct(addr(1), None)).unwrap_err();
        assert_eq!(err.code(), MV_E_PARAMETER);
    }

    #[test]
    fn test_scripted_failure_and_journal() {
        let sdk = VirtualSdk::new();
        let device = sdk.add_device(VirtualDeviceSpec::new(addr(5)).failing_at(CallPoint::Open, MV_E_ACCESS_DENIED));
        let handle = sdk.create_handle(&DeviceDescriptor::direct(addr(5), Some(addr(1)))).unwrap();

        assert_eq!(handle.open(AccessMode::Exclusive, 0).unwrap_err().code(), MV_E_ACCESS_DENIED);
        assert!(!device.is_opened());

        device.clear_failure(CallPoint::Open);
        handle.open(AccessMode::Exclusive, 0).unwrap();
        assert!(device.is_opened());
        assert_eq!(device.journal(), vec!["create_handle via 192.168.1.1", "open", "open"]);
        assert_eq!(device.call_count("open"), 2);
    }

    #[test]
    fn test_enum_written_by_label() {
        let sdk = VirtualSdk::new().with_devices([addr(2)]);
        let handle = opened_camera(&sdk, 2);

        handle
            .set_value("TriggerMode", NodeType::Enumeration, &Value::from("On"))
            .unwrap();
        assert_eq!(
            handle.get_value("TriggerMode", NodeType::Enumeration).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            handle
                .set_value("TriggerMode", NodeType::Enumeration, &Value::from("Sideways"))
                .unwrap_err()
                .code(),
            MV_E_GC_RANGE
        );
    }

    #[test]
    fn test_monitor_cannot_write() {
        let sdk = VirtualSdk::new().with_devices([addr(3)]);
        let handle = sdk.create_handle(&DeviceDescriptor::direct(addr(3), None)).unwrap();
        handle.open(AccessMode::Monitor, 0).unwrap();
        let err = handle
            .set_value("ExposureTime", NodeType::Float, &Value::Float(5.0))
            .unwrap_err();
        assert_eq!(err.code(), MV_E_ACCESS_DENIED);
    }

    #[test]
    fn test_poll_frames() {
        let sdk = VirtualSdk::new();
        let device = sdk.add_device(VirtualDeviceSpec::new(addr(4)).with_size(4, 2));
        let handle = opened_camera(&sdk, 4);
        handle.start_grab().unwrap();

        let mut buffer = vec![0u8; 8];
        let info = handle.get_one_frame(&mut buffer, Duration::from_secs(1)).unwrap();
        assert_eq!((info.width, info.height, info.frame_len), (4, 2, 8));
        assert_eq!(buffer[..4], [0, 1, 2, 3]);

        let frame = handle.get_image_buffer(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.info.frame_num, 1);
        assert_eq!(device.outstanding_buffers(), 1);
        handle.free_image_buffer(frame).unwrap();
        assert_eq!(device.outstanding_buffers(), 0);

        let mut small = vec![0u8; 2];
        assert_eq!(
            handle.get_one_frame(&mut small, Duration::from_secs(1)).unwrap_err().code(),
            MV_E_NOENOUGH_BUF
        );
    }

    #[test]
    fn test_poll_timeout() {
        let sdk = VirtualSdk::new();
        sdk.add_device(VirtualDeviceSpec::new(addr(6)).with_frame_interval(Duration::from_secs(5)));
        let handle = opened_camera(&sdk, 6);
        handle.start_grab().unwrap();

        let err = handle.get_image_buffer(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_callback_pump() {
        let sdk = VirtualSdk::new().with_devices([addr(7)]);
        let handle = opened_camera(&sdk, 7);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        handle
            .register_frame_callback(Box::new(move |data: &[u8], info: &FrameInfo| {
                let _ = lock(&tx).send((data.len(), info.frame_num));
            }))
            .unwrap();
        handle.start_grab().unwrap();

        let (len, first) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(len, 64 * 48);
        let (_, second) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second > first);

        handle.stop_grab().unwrap();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_destroyed_handle_rejects_calls() {
        let sdk = VirtualSdk::new().with_devices([addr(8)]);
        let handle = opened_camera(&sdk, 8);
        handle.close().unwrap();
        handle.destroy().unwrap();
        assert_eq!(handle.open(AccessMode::Exclusive, 0).unwrap_err().code(), MV_E_HANDLE);
    }
}
