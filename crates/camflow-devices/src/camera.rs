/*!
 * Camera device handle.
 *
 * A [`Camera`] drives one device through the linear lifecycle
 * `Unopened → HandleCreated → Opened → Grabbing` and back. Forward steps are
 * no-ops when already taken, reverse steps are no-ops when already undone.
 *
 * Two locks guard a camera. The lifecycle lock covers the state flags and the
 * native handle. The frame lock covers the frame buffers, the resize and
 * rotation settings, and parameter I/O. The SDK frame callback only takes the
 * frame lock, so stopping acquisition never waits on a callback that waits on
 * the lifecycle lock. Whenever both are held the lifecycle lock is taken first.
 */
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use camflow_core::logging::camera_span;
use camflow_core::types::{CreateHandleMethod, GrabMethod, Id, Rotation, Value};
use camflow_core::utils::duration_to_millis;

use crate::error::{DeviceError, Result};
use crate::frame::{file_type_for, Image};
use crate::nodes::{NodeEntry, NodeTable, NodeType};
use crate::params::CameraSettings;
use crate::sdk::{
    DeviceDescriptor, FrameInfo, NativeCamera, SaveImageParams, SdkContext, SdkError,
    TransportKind,
};

const EVENT_CAPACITY: usize = 100;

/// Lifecycle state of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraState {
    /// No native handle
    Unopened,
    /// Native handle allocated
    HandleCreated,
    /// Device opened and configured
    Opened,
    /// Acquisition running
    Grabbing,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Camera event
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// The camera changed lifecycle state
    StateChanged {
        /// The camera ID
        id: Id,
        /// The old state
        old_state: CameraState,
        /// The new state
        new_state: CameraState,
    },
    /// A frame was converted
    Frame {
        /// The camera ID
        id: Id,
        /// The converted frame
        image: Arc<Image>,
    },
    /// A parameter was written
    ParameterChanged {
        /// The camera ID
        id: Id,
        /// The parameter key
        key: String,
        /// The value written
        value: Value,
    },
}

#[derive(Debug, Default)]
struct Lifecycle {
    handle_created: bool,
    opened: bool,
    grabbing: bool,
    native: Option<Arc<dyn NativeCamera>>,
    descriptor: Option<DeviceDescriptor>,
}

impl Lifecycle {
    fn state(&self) -> CameraState {
        if self.grabbing {
            CameraState::Grabbing
        } else if self.opened {
            CameraState::Opened
        } else if self.handle_created {
            CameraState::HandleCreated
        } else {
            CameraState::Unopened
        }
    }

    fn native(&self, required: CameraState, action: &str) -> Result<Arc<dyn NativeCamera>> {
        let reached = match required {
            CameraState::Unopened => true,
            CameraState::HandleCreated => self.handle_created,
            CameraState::Opened => self.opened,
            CameraState::Grabbing => self.grabbing,
        };
        match (&self.native, reached) {
            (Some(native), true) => Ok(native.clone()),
            _ => Err(DeviceError::InvalidState(format!(
                "cannot {} in state {}, camera must be {}",
                action,
                self.state(),
                required
            ))),
        }
    }
}

#[derive(Debug)]
enum Delivery {
    Frame(Arc<Image>),
    Rejected(String),
}

#[derive(Debug)]
struct FrameState {
    poll_buffer: Vec<u8>,
    frame_buffer: Vec<u8>,
    last_info: Option<FrameInfo>,
    latest: Option<Delivery>,
    delivered: u64,
    consumed: u64,
    resize_ratio: f64,
    rotation: Rotation,
}

impl FrameState {
    /// Copy a raw frame into the private buffer and convert it
    fn store(&mut self, data: &[u8], info: &FrameInfo) -> Result<Image> {
        let len = info.frame_len.min(data.len());
        if self.frame_buffer.len() != len {
            if !self.frame_buffer.is_empty() {
                debug!("Frame length changed from {} to {} bytes", self.frame_buffer.len(), len);
            }
            self.frame_buffer.resize(len, 0);
        }
        self.frame_buffer.copy_from_slice(&data[..len]);
        self.last_info = Some(*info);

        let image = Image::from_raw(&self.frame_buffer, info)?;
        Ok(image.adjust(self.resize_ratio, self.rotation))
    }

    fn clear(&mut self) {
        self.poll_buffer = Vec::new();
        self.frame_buffer = Vec::new();
        self.last_info = None;
        self.latest = None;
        self.consumed = self.delivered;
    }
}

/// State shared with the SDK frame callback
#[derive(Debug)]
struct FrameShared {
    id: Id,
    state: Mutex<FrameState>,
    arrived: Condvar,
    events: broadcast::Sender<CameraEvent>,
}

impl FrameShared {
    fn lock(&self) -> Result<MutexGuard<'_, FrameState>> {
        self.state.lock().map_err(|_| DeviceError::lock("frame"))
    }

    fn publish(&self, image: Image) -> Image {
        let image = Arc::new(image);
        let _ = self.events.send(CameraEvent::Frame {
            id: self.id.clone(),
            image: image.clone(),
        });
        Arc::try_unwrap(image).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Entry point of the push callback, runs on an SDK thread
    fn deliver(&self, data: &[u8], info: &FrameInfo) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!("Dropped frame {} from camera {}: frame lock poisoned", info.frame_num, self.id);
                return;
            }
        };

        let delivery = match state.store(data, info) {
            Ok(image) => {
                let image = Arc::new(image);
                let _ = self.events.send(CameraEvent::Frame {
                    id: self.id.clone(),
                    image: image.clone(),
                });
                Delivery::Frame(image)
            }
            Err(e) => {
                warn!("Dropped frame {} from camera {}: {}", info.frame_num, self.id, e);
                match e {
                    DeviceError::UnsupportedFormat(format) => Delivery::Rejected(format),
                    other => Delivery::Rejected(other.to_string()),
                }
            }
        };
        state.latest = Some(delivery);
        state.delivered += 1;
        drop(state);
        self.arrived.notify_all();
    }

    /// Wait for a frame delivered after the last one handed out
    fn wait_next(&self, timeout: Duration, identity: &str) -> Result<Image> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        while state.delivered == state.consumed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::FrameTimeout(format!(
                    "{} delivered no frame within {} ms",
                    identity,
                    duration_to_millis(timeout)
                )));
            }
            state = self
                .arrived
                .wait_timeout(state, remaining)
                .map_err(|_| DeviceError::lock("frame"))?
                .0;
        }

        state.consumed = state.delivered;
        match &state.latest {
            Some(Delivery::Frame(image)) => Ok((**image).clone()),
            Some(Delivery::Rejected(reason)) => Err(DeviceError::UnsupportedFormat(reason.clone())),
            None => Err(DeviceError::InvalidState(format!("{} stopped grabbing", identity))),
        }
    }
}

/// One camera
#[derive(Debug)]
pub struct Camera {
    id: Id,
    settings: CameraSettings,
    native_params: Vec<(String, Value)>,
    context: Arc<SdkContext>,
    nodes: Arc<NodeTable>,
    enumerated: Option<DeviceDescriptor>,
    lifecycle: Mutex<Lifecycle>,
    user_id: Mutex<Option<String>>,
    frames: Arc<FrameShared>,
}

impl Camera {
    /// Create a camera; nothing touches the device until [`Camera::create_handle`]
    pub fn new(context: Arc<SdkContext>, nodes: Arc<NodeTable>, settings: CameraSettings) -> Self {
        let id = Id::from(settings.address);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let frames = Arc::new(FrameShared {
            id: id.clone(),
            state: Mutex::new(FrameState {
                poll_buffer: Vec::new(),
                frame_buffer: Vec::new(),
                last_info: None,
                latest: None,
                delivered: 0,
                consumed: 0,
                resize_ratio: settings.resize_ratio,
                rotation: settings.rotation,
            }),
            arrived: Condvar::new(),
            events,
        });

        Self {
            id,
            settings,
            native_params: Vec::new(),
            context,
            nodes,
            enumerated: None,
            lifecycle: Mutex::new(Lifecycle::default()),
            user_id: Mutex::new(None),
            frames,
        }
    }

    /// Node values written, in order, every time the camera is opened
    pub fn with_native_params(mut self, params: Vec<(String, Value)>) -> Self {
        self.native_params = params;
        self
    }

    /// Use a descriptor found by enumeration instead of looking it up again
    pub fn with_descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.enumerated = Some(descriptor);
        self
    }

    /// The camera ID, its address
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The camera address
    pub fn address(&self) -> Ipv4Addr {
        self.settings.address
    }

    /// The resolved settings
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// The cached DeviceUserID, read on open
    pub fn device_user_id(&self) -> Option<String> {
        self.user_id.lock().ok().and_then(|id| id.clone())
    }

    /// `camera[<ip>]`, or `camera[<ip>|<DeviceUserID>]` once the ID is known
    pub fn identity(&self) -> String {
        match self.device_user_id() {
            Some(user_id) if !user_id.is_empty() => format!("camera[{}|{}]", self.id, user_id),
            _ => format!("camera[{}]", self.id),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> Result<CameraState> {
        Ok(self.lifecycle()?.state())
    }

    /// Subscribe to camera events
    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.frames.events.subscribe()
    }

    fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        self.lifecycle.lock().map_err(|_| DeviceError::lock("camera lifecycle"))
    }

    fn emit_state(&self, old_state: CameraState, new_state: CameraState) {
        if old_state == new_state {
            return;
        }
        debug!("{} {} -> {}", self.identity(), old_state, new_state);
        let _ = self.frames.events.send(CameraEvent::StateChanged {
            id: self.id.clone(),
            old_state,
            new_state,
        });
    }

    fn span(&self) -> tracing::Span {
        camera_span(self.id.as_str(), self.device_user_id().as_deref())
    }

    fn resolve_descriptor(&self) -> Result<DeviceDescriptor> {
        match self.settings.create_handle_method {
            CreateHandleMethod::Direct => Ok(DeviceDescriptor::direct(
                self.settings.address,
                self.settings.host_ip,
            )),
            CreateHandleMethod::Enumerate => {
                if let Some(descriptor) = &self.enumerated {
                    return Ok(descriptor.clone());
                }
                for transport in [TransportKind::GigE, TransportKind::Usb] {
                    let found = self
                        .context
                        .sdk()
                        .enumerate_devices(transport)
                        .map_err(|e| DeviceError::Enumeration(e.to_string()))?
                        .into_iter()
                        .find(|d| d.address == self.settings.address);
                    if let Some(descriptor) = found {
                        return Ok(descriptor);
                    }
                }
                Err(DeviceError::HandleCreation(format!(
                    "{} not found by enumeration",
                    self.identity()
                )))
            }
        }
    }

    /// Allocate the native handle
    pub fn create_handle(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if lifecycle.handle_created {
            return Ok(());
        }

        self.context.initialize()?;
        let descriptor = self.resolve_descriptor()?;
        let native = self
            .context
            .sdk()
            .create_handle(&descriptor)
            .map_err(|e| DeviceError::HandleCreation(format!("{}: {}", self.identity(), e)))?;

        lifecycle.native = Some(native);
        lifecycle.descriptor = Some(descriptor);
        lifecycle.handle_created = true;
        drop(lifecycle);

        self.emit_state(CameraState::Unopened, CameraState::HandleCreated);
        Ok(())
    }

    /// Open and configure the device
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if lifecycle.opened {
            return Ok(());
        }
        let native = lifecycle.native(CameraState::HandleCreated, "open")?;
        let descriptor = lifecycle
            .descriptor
            .clone()
            .ok_or_else(|| DeviceError::InvalidState("handle has no descriptor".to_string()))?;

        let mode = self.settings.access_mode;
        if !self.context.sdk().is_accessible(&descriptor, mode) {
            return Err(DeviceError::Access(format!(
                "{} under {} mode",
                self.identity(),
                mode
            )));
        }
        native
            .open(mode, 0)
            .map_err(|e| DeviceError::Open(format!("{}: {}", self.identity(), e)))?;
        lifecycle.opened = true;

        match self.read_node(&*native, "DeviceUserID") {
            Ok(Value::String(user_id)) => self.cache_user_id(user_id),
            Ok(other) => warn!("{} reported DeviceUserID {}", self.identity(), other),
            Err(e) => warn!("Failed to read DeviceUserID of {}: {}", self.identity(), e),
        }

        let result = self.configure(&*native, &descriptor);
        drop(lifecycle);
        self.emit_state(CameraState::HandleCreated, CameraState::Opened);
        result?;

        info!("Opened {} with {} access", self.identity(), mode);
        Ok(())
    }

    /// Stream, packet size and node setup run right after the native open
    fn configure(&self, native: &dyn NativeCamera, descriptor: &DeviceDescriptor) -> Result<()> {
        if let Some(group) = self.settings.multicast {
            native.set_transmission_type(group).map_err(|e| {
                DeviceError::TransmissionConfig(format!("{} to {}: {}", self.identity(), group, e))
            })?;
            debug!("{} streaming to multicast group {}", self.identity(), group);
        }

        if descriptor.transport == TransportKind::GigE {
            match native.optimal_packet_size() {
                Ok(size) if size > 0 => {
                    if let Err(e) = self.write_node(
                        native,
                        "GevSCPSPacketSize",
                        Value::Integer(size as i64),
                    ) {
                        warn!("Failed to set packet size of {}: {}", self.identity(), e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to query packet size of {}: {}", self.identity(), e),
            }
        }

        for (key, value) in &self.native_params {
            self.write_node(native, key, value.clone())?;
        }
        Ok(())
    }

    /// Start acquisition with the configured grab method
    pub fn start_grabbing(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if lifecycle.grabbing {
            return Ok(());
        }
        let native = lifecycle.native(CameraState::Opened, "start grabbing")?;
        let grab_start = |e: DeviceError| DeviceError::GrabStart(format!("{}: {}", self.identity(), e));

        match self.settings.grab_method {
            GrabMethod::GetOneFrameTimeout => {
                let payload = self
                    .read_node(&*native, "PayloadSize")
                    .map_err(grab_start)?
                    .as_integer()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| grab_start(DeviceError::invalid_value("PayloadSize", "not a positive size")))?;
                self.frames.lock()?.poll_buffer = vec![0; payload as usize];
            }
            GrabMethod::GetImageBuffer => {}
            GrabMethod::ImageCallback => {
                let frames = self.frames.clone();
                native
                    .register_frame_callback(Box::new(move |data: &[u8], info: &FrameInfo| {
                        frames.deliver(data, info)
                    }))
                    .map_err(|e| grab_start(e.into()))?;
            }
        }

        native.start_grab().map_err(|e| grab_start(e.into()))?;
        lifecycle.grabbing = true;
        drop(lifecycle);

        self.emit_state(CameraState::Opened, CameraState::Grabbing);
        debug!("{} grabbing with {}", self.identity(), self.settings.grab_method);
        Ok(())
    }

    fn frame_error(&self, e: SdkError) -> DeviceError {
        if e.is_timeout() {
            DeviceError::FrameTimeout(format!(
                "{} delivered no frame within {} ms",
                self.identity(),
                duration_to_millis(self.settings.frame_timeout)
            ))
        } else {
            e.into()
        }
    }

    /// Wait for the next frame, convert it and apply resize and rotation
    pub fn capture_frame(&self) -> Result<Image> {
        let native = self.lifecycle()?.native(CameraState::Grabbing, "capture a frame")?;
        let timeout = self.settings.frame_timeout;

        match self.settings.grab_method {
            GrabMethod::GetOneFrameTimeout => {
                let mut state = self.frames.lock()?;
                let mut buffer = std::mem::take(&mut state.poll_buffer);
                let result = native
                    .get_one_frame(&mut buffer, timeout)
                    .map_err(|e| self.frame_error(e))
                    .and_then(|info| state.store(&buffer, &info));
                state.poll_buffer = buffer;
                drop(state);
                Ok(self.frames.publish(result?))
            }
            GrabMethod::GetImageBuffer => {
                let mut state = self.frames.lock()?;
                let buffer = native
                    .get_image_buffer(timeout)
                    .map_err(|e| self.frame_error(e))?;
                let result = state.store(&buffer.data, &buffer.info);
                let id = buffer.id;
                if let Err(e) = native.free_image_buffer(buffer) {
                    warn!("Failed to free image buffer {} of {}: {}", id, self.identity(), e);
                }
                drop(state);
                Ok(self.frames.publish(result?))
            }
            GrabMethod::ImageCallback => self.frames.wait_next(timeout, &self.identity()),
        }
    }

    /// Stop acquisition and release the frame buffers
    pub fn stop_grabbing(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if !lifecycle.grabbing {
            return Ok(());
        }
        let native = lifecycle.native(CameraState::Grabbing, "stop grabbing")?;
        native.stop_grab()?;
        lifecycle.grabbing = false;
        self.frames.lock()?.clear();
        drop(lifecycle);

        self.emit_state(CameraState::Grabbing, CameraState::Opened);
        Ok(())
    }

    /// Close the device
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if !lifecycle.opened {
            return Ok(());
        }
        let old_state = lifecycle.state();
        let native = lifecycle.native(CameraState::Opened, "close")?;
        native.close()?;
        lifecycle.opened = false;
        lifecycle.grabbing = false;
        self.frames.lock()?.clear();
        drop(lifecycle);

        self.emit_state(old_state, CameraState::HandleCreated);
        info!("Closed {}", self.identity());
        Ok(())
    }

    /// Release the native handle
    pub fn destroy_handle(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle()?;
        if !lifecycle.handle_created {
            return Ok(());
        }
        let old_state = lifecycle.state();
        let native = lifecycle.native(CameraState::HandleCreated, "destroy the handle")?;
        native.destroy()?;
        *lifecycle = Lifecycle::default();
        drop(lifecycle);

        self.emit_state(old_state, CameraState::Unopened);
        Ok(())
    }

    /// Create the handle, open the device and start grabbing
    pub fn enter(&self) -> Result<()> {
        let _span = self.span().entered();
        self.create_handle()?;
        self.open()?;
        self.start_grabbing()
    }

    /// Undo every step taken so far, continuing past failures
    ///
    /// Each failure is logged; the last one is returned.
    pub fn exit(&self) -> Result<()> {
        let _span = self.span().entered();
        let steps: [(&str, fn(&Self) -> Result<()>); 3] = [
            ("stop grabbing", Self::stop_grabbing),
            ("close", Self::close),
            ("destroy handle of", Self::destroy_handle),
        ];

        let mut last_error = None;
        for (action, step) in steps {
            if let Err(e) = step(self) {
                warn!("Failed to {} {}: {}", action, self.identity(), e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn cache_user_id(&self, user_id: String) {
        if let Ok(mut cached) = self.user_id.lock() {
            *cached = Some(user_id);
        }
    }

    fn node(&self, key: &str) -> Result<(&NodeEntry, NodeType)> {
        let entry = self.nodes.lookup(key)?;
        let node_type = entry.node_type()?;
        Ok((entry, node_type))
    }

    fn read_node(&self, native: &dyn NativeCamera, key: &str) -> Result<Value> {
        let (entry, node_type) = self.node(key)?;
        if node_type == NodeType::Command {
            return Err(DeviceError::invalid_value(key, "command nodes cannot be read"));
        }

        let _frames = self.frames.lock()?;
        let value = native.get_value(key, node_type)?;
        if let (NodeType::Enumeration, Value::Integer(raw)) = (node_type, &value) {
            debug!(
                "{} got {} = {} ({})",
                self.identity(),
                key,
                raw,
                entry.enum_label(*raw).unwrap_or("unlisted")
            );
        }
        Ok(value)
    }

    fn write_node(&self, native: &dyn NativeCamera, key: &str, value: Value) -> Result<()> {
        let (entry, node_type) = self.node(key)?;
        let coerced = coerce(entry, node_type, &value)?;

        if !self.settings.access_mode.has_control_permission() {
            warn!(
                "No permission to set {} on {} under {} mode",
                key,
                self.identity(),
                self.settings.access_mode
            );
            return Ok(());
        }

        let frames = self.frames.lock()?;
        match node_type {
            NodeType::Command => native.execute_command(key)?,
            _ => native.set_value(key, node_type, &coerced)?,
        }
        drop(frames);

        if key == "DeviceUserID" {
            if let Value::String(user_id) = &value {
                self.cache_user_id(user_id.clone());
            }
        }
        debug!("{} set {} = {}", self.identity(), key, value);
        let _ = self.frames.events.send(CameraEvent::ParameterChanged {
            id: self.id.clone(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Read a node, or one of the local keys `rotation`, `resize_ratio` and
    /// `image_size`
    ///
    /// Enumeration values come back as the raw integer code; see
    /// [`Camera::get_parameter_label`] for the label.
    pub fn get_parameter(&self, key: &str) -> Result<Value> {
        match key {
            "rotation" => Ok(Value::Integer(self.frames.lock()?.rotation.code())),
            "resize_ratio" => Ok(Value::Float(self.frames.lock()?.resize_ratio)),
            "image_size" => {
                let (height, width) = self.image_size()?;
                Ok(Value::Array(vec![Value::from(height), Value::from(width)]))
            }
            _ => {
                let native = self.lifecycle()?.native(CameraState::Opened, "read parameters")?;
                self.read_node(&*native, key)
            }
        }
    }

    /// Read an enumeration node and resolve its label from the node table
    pub fn get_parameter_label(&self, key: &str) -> Result<String> {
        let (entry, node_type) = self.node(key)?;
        if node_type != NodeType::Enumeration {
            return Err(DeviceError::invalid_value(key, format!("{} has no labels", node_type)));
        }
        let native = self.lifecycle()?.native(CameraState::Opened, "read parameters")?;
        let raw = self
            .read_node(&*native, key)?
            .as_integer()
            .ok_or_else(|| DeviceError::invalid_value(key, "not an enumeration value"))?;
        entry
            .enum_label(raw)
            .map(str::to_string)
            .ok_or_else(|| DeviceError::invalid_value(key, format!("no label for {}", raw)))
    }

    /// Write a node, or one of the local keys `rotation` and `resize_ratio`
    ///
    /// Enumerations accept a label or a raw value. Command nodes are executed.
    /// Without control permission the write is logged and skipped.
    pub fn set_parameter<V: Into<Value>>(&self, key: &str, value: V) -> Result<()> {
        let value = value.into();
        match key {
            "rotation" => {
                let rotation = match &value {
                    Value::Integer(code) => Rotation::from_code(*code),
                    Value::String(name) => name.parse(),
                    other => return Err(DeviceError::invalid_value(key, format!("unexpected {}", other.kind()))),
                }
                .map_err(|e| DeviceError::invalid_value(key, e.to_string()))?;
                self.frames.lock()?.rotation = rotation;
                Ok(())
            }
            "resize_ratio" => {
                let ratio = value
                    .as_float()
                    .filter(|r| *r > 0.0)
                    .ok_or_else(|| DeviceError::invalid_value(key, "must be a positive number"))?;
                self.frames.lock()?.resize_ratio = ratio;
                Ok(())
            }
            "image_size" => Err(DeviceError::invalid_value(key, "read-only")),
            _ => {
                let native = self.lifecycle()?.native(CameraState::Opened, "write parameters")?;
                self.write_node(&*native, key, value)
            }
        }
    }

    /// (height, width) of converted frames, after resize and rotation
    pub fn image_size(&self) -> Result<(u32, u32)> {
        let native = self.lifecycle()?.native(CameraState::Opened, "read the image size")?;
        let dimension = |key: &str| -> Result<u32> {
            self.read_node(&*native, key)?
                .as_integer()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| DeviceError::invalid_value(key, "not a size"))
        };
        let width = dimension("Width")?;
        let height = dimension("Height")?;

        let (ratio, rotation) = {
            let state = self.frames.lock()?;
            (state.resize_ratio, state.rotation)
        };
        let scale = |v: u32| ((v as f64 * ratio) as u32).max(1);
        let (height, width) = (scale(height), scale(width));
        Ok(if rotation.is_90() { (width, height) } else { (height, width) })
    }

    /// Save the last raw frame with the vendor encoder
    ///
    /// `quality` is clamped to 51..=99 and `interpolation` to 0..=3.
    pub fn save_image<P: AsRef<Path>>(&self, path: P, quality: u32, interpolation: u32) -> Result<()> {
        let path = path.as_ref();
        let image_type = file_type_for(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let native = self.lifecycle()?.native(CameraState::HandleCreated, "save an image")?;
        let state = self.frames.lock()?;
        let info = state
            .last_info
            .ok_or_else(|| DeviceError::InvalidState(format!("{} has no frame to save", self.identity())))?;

        native.save_image_to_file(&SaveImageParams {
            path: path.to_path_buf(),
            image_type,
            info,
            data: &state.frame_buffer,
            quality: quality.clamp(51, 99),
            interpolation: interpolation.min(3),
        })?;
        debug!("{} saved frame {} to {}", self.identity(), info.frame_num, path.display());
        Ok(())
    }
}

/// Check a value against a node's type, resolving enumeration labels
fn coerce(entry: &NodeEntry, node_type: NodeType, value: &Value) -> Result<Value> {
    let key = entry.key.as_str();
    let mismatch = || DeviceError::invalid_value(key, format!("expected {}, got {}", node_type, value.kind()));

    match node_type {
        NodeType::Command => Ok(Value::Null),
        NodeType::Boolean => value.as_bool().map(Value::Bool).ok_or_else(mismatch),
        NodeType::Integer => match value {
            Value::Integer(v) => Ok(Value::Integer(*v)),
            _ => Err(mismatch()),
        },
        NodeType::Float => value.as_float().map(Value::Float).ok_or_else(mismatch),
        NodeType::String => value.as_str().map(Value::from).ok_or_else(mismatch),
        NodeType::Enumeration => {
            let raw = match value {
                Value::String(label) => entry.enum_value(label).ok_or_else(|| {
                    DeviceError::invalid_value(key, format!("'{}' is not a legal value", label))
                })?,
                Value::Integer(raw) => *raw,
                _ => return Err(mismatch()),
            };
            if !entry.enum_range.is_empty() && entry.enum_label(raw).is_none() {
                return Err(DeviceError::invalid_value(key, format!("{} is not a legal value", raw)));
            }
            Ok(Value::Integer(raw))
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        let active = self
            .lifecycle
            .get_mut()
            .map(|lifecycle| lifecycle.handle_created)
            .unwrap_or(true);
        if active {
            if let Err(e) = self.exit() {
                warn!("Failed to release {}: {}", self.identity(), e);
            }
        }
    }
}
