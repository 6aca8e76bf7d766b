/*!
 * Camera registry and fan-out dispatcher.
 *
 * [`MultiCameras`] owns a set of cameras keyed by address and runs one
 * operation on all of them at once. Every fan-out spawns scoped worker threads,
 * isolates each camera's failure (panics included) and returns the results
 * sorted by camera ID.
 */
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use tracing::{debug, warn};

use camflow_core::config::DispatchConfig;
use camflow_core::logging::dispatch_span;
use camflow_core::types::{Id, Value};

use crate::camera::Camera;
use crate::error::{DeviceError, Result};
use crate::frame::Image;

/// Per-camera results of one fan-out, sorted by camera ID
pub type Dispatched<R> = BTreeMap<Id, Result<R>>;

/// How a fan-out schedules its workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOptions {
    /// Upper bound on concurrent workers; one worker per camera when unset
    pub max_workers: Option<usize>,
}

impl DispatchOptions {
    /// One worker per camera
    pub fn unbounded() -> Self {
        Self { max_workers: None }
    }

    /// At most `workers` concurrent workers
    pub fn bounded(workers: usize) -> Self {
        Self {
            max_workers: Some(workers),
        }
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_workers: config.max_workers,
        }
    }
}

/// An operation that can be fanned out by name
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCommand {
    /// [`Camera::create_handle`]
    CreateHandle,
    /// [`Camera::open`]
    Open,
    /// [`Camera::start_grabbing`]
    StartGrabbing,
    /// [`Camera::capture_frame`]
    CaptureFrame,
    /// [`Camera::stop_grabbing`]
    StopGrabbing,
    /// [`Camera::close`]
    Close,
    /// [`Camera::destroy_handle`]
    DestroyHandle,
    /// [`Camera::enter`]
    Enter,
    /// [`Camera::exit`]
    Exit,
    /// [`Camera::get_parameter`]
    GetParameter(String),
    /// [`Camera::set_parameter`]
    SetParameter(String, Value),
    /// [`Camera::image_size`]
    ImageSize,
    /// [`Camera::save_image`] to `<directory>/<camera id>.<extension>`
    SaveImage {
        /// Output directory
        directory: PathBuf,
        /// File extension, which picks the format
        extension: String,
        /// JPEG quality
        quality: u32,
        /// Bayer interpolation method
        interpolation: u32,
    },
}

/// Output of one [`CameraCommand`] on one camera
#[derive(Debug, Clone)]
pub enum CommandOutput {
    /// The command has no output
    Done,
    /// A captured frame
    Frame(Image),
    /// A parameter or attribute value
    Value(Value),
    /// (height, width)
    Size(u32, u32),
}

impl CommandOutput {
    /// The value, if this output carries one
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            CommandOutput::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The frame, if this output carries one
    pub fn into_frame(self) -> Option<Image> {
        match self {
            CommandOutput::Frame(image) => Some(image),
            _ => None,
        }
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(DeviceError::InvalidArgument(format!(
            "{} takes {} arguments, got {}",
            name,
            expected,
            args.len()
        )))
    }
}

fn string_arg(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DeviceError::InvalidArgument(format!("{} expects a string, got {}", name, value.kind())))
}

impl CameraCommand {
    /// The operation name accepted by [`MultiCameras::invoke`]
    pub fn name(&self) -> &'static str {
        match self {
            CameraCommand::CreateHandle => "create_handle",
            CameraCommand::Open => "open",
            CameraCommand::StartGrabbing => "start_grabbing",
            CameraCommand::CaptureFrame => "capture_frame",
            CameraCommand::StopGrabbing => "stop_grabbing",
            CameraCommand::Close => "close",
            CameraCommand::DestroyHandle => "destroy_handle",
            CameraCommand::Enter => "enter",
            CameraCommand::Exit => "exit",
            CameraCommand::GetParameter(_) => "get_parameter",
            CameraCommand::SetParameter(..) => "set_parameter",
            CameraCommand::ImageSize => "image_size",
            CameraCommand::SaveImage { .. } => "save_image",
        }
    }

    /// Resolve an operation name and its arguments
    pub fn parse(name: &str, args: &[Value]) -> Result<Self> {
        let no_args = |command: CameraCommand| arity(name, args, 0).map(|_| command);
        match name {
            "create_handle" => no_args(CameraCommand::CreateHandle),
            "open" => no_args(CameraCommand::Open),
            "start_grabbing" => no_args(CameraCommand::StartGrabbing),
            "capture_frame" => no_args(CameraCommand::CaptureFrame),
            "stop_grabbing" => no_args(CameraCommand::StopGrabbing),
            "close" => no_args(CameraCommand::Close),
            "destroy_handle" => no_args(CameraCommand::DestroyHandle),
            "enter" => no_args(CameraCommand::Enter),
            "exit" => no_args(CameraCommand::Exit),
            "image_size" => no_args(CameraCommand::ImageSize),
            "get_parameter" => {
                arity(name, args, 1)?;
                Ok(CameraCommand::GetParameter(string_arg(name, &args[0])?))
            }
            "set_parameter" => {
                arity(name, args, 2)?;
                Ok(CameraCommand::SetParameter(string_arg(name, &args[0])?, args[1].clone()))
            }
            "save_image" => {
                if args.len() < 2 || args.len() > 4 {
                    return Err(DeviceError::InvalidArgument(format!(
                        "save_image takes 2 to 4 arguments, got {}",
                        args.len()
                    )));
                }
                let number = |index: usize, default: u32| -> Result<u32> {
                    match args.get(index) {
                        None => Ok(default),
                        Some(value) => value
                            .as_integer()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| DeviceError::InvalidArgument(format!("save_image argument {} must be a number", index))),
                    }
                };
                Ok(CameraCommand::SaveImage {
                    directory: PathBuf::from(string_arg(name, &args[0])?),
                    extension: string_arg(name, &args[1])?,
                    quality: number(2, 95)?,
                    interpolation: number(3, 1)?,
                })
            }
            other => Err(DeviceError::UnknownOperation(other.to_string())),
        }
    }

    /// Run the command on one camera
    pub fn execute(&self, camera: &Camera) -> Result<CommandOutput> {
        match self {
            CameraCommand::CreateHandle => camera.create_handle().map(|_| CommandOutput::Done),
            CameraCommand::Open => camera.open().map(|_| CommandOutput::Done),
            CameraCommand::StartGrabbing => camera.start_grabbing().map(|_| CommandOutput::Done),
            CameraCommand::CaptureFrame => camera.capture_frame().map(CommandOutput::Frame),
            CameraCommand::StopGrabbing => camera.stop_grabbing().map(|_| CommandOutput::Done),
            CameraCommand::Close => camera.close().map(|_| CommandOutput::Done),
            CameraCommand::DestroyHandle => camera.destroy_handle().map(|_| CommandOutput::Done),
            CameraCommand::Enter => camera.enter().map(|_| CommandOutput::Done),
            CameraCommand::Exit => camera.exit().map(|_| CommandOutput::Done),
            CameraCommand::GetParameter(key) => camera.get_parameter(key).map(CommandOutput::Value),
            CameraCommand::SetParameter(key, value) => camera
                .set_parameter(key, value.clone())
                .map(|_| CommandOutput::Done),
            CameraCommand::ImageSize => camera
                .image_size()
                .map(|(height, width)| CommandOutput::Size(height, width)),
            CameraCommand::SaveImage {
                directory,
                extension,
                quality,
                interpolation,
            } => {
                let path = directory.join(format!("{}.{}", camera.id(), extension));
                camera
                    .save_image(path, *quality, *interpolation)
                    .map(|_| CommandOutput::Done)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `op`, turning a panic into an error
fn run_isolated<R, F>(camera: &Camera, op: &F) -> Result<R>
where
    F: Fn(&Camera) -> Result<R>,
{
    panic::catch_unwind(AssertUnwindSafe(|| op(camera))).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        warn!("Worker for camera {} panicked: {}", camera.id(), message);
        Err(DeviceError::WorkerPanicked(format!("{}: {}", camera.id(), message)))
    })
}

/// Cameras keyed by address
#[derive(Debug, Default)]
pub struct MultiCameras {
    cameras: BTreeMap<Id, Camera>,
    options: DispatchOptions,
}

impl MultiCameras {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting duplicate IDs
    pub fn from_cameras<I: IntoIterator<Item = Camera>>(cameras: I) -> Result<Self> {
        let mut registry = Self::new();
        for camera in cameras {
            registry.insert(camera)?;
        }
        Ok(registry)
    }

    /// Set the default dispatch options
    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// The default dispatch options
    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    /// Add a camera
    pub fn insert(&mut self, camera: Camera) -> Result<()> {
        let id = camera.id().clone();
        if self.cameras.contains_key(&id) {
            return Err(DeviceError::InvalidArgument(format!(
                "Camera with ID {} already registered",
                id
            )));
        }
        debug!("Registered camera with ID {}", id);
        self.cameras.insert(id, camera);
        Ok(())
    }

    /// Find a camera
    pub fn get(&self, id: &Id) -> Option<&Camera> {
        self.cameras.get(id)
    }

    /// Camera IDs, sorted
    pub fn ids(&self) -> Vec<Id> {
        self.cameras.keys().cloned().collect()
    }

    /// Cameras in ID order
    pub fn iter(&self) -> impl Iterator<Item = (&Id, &Camera)> {
        self.cameras.iter()
    }

    /// Number of cameras
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Read a value from every camera on the calling thread
    pub fn read<R, F>(&self, f: F) -> BTreeMap<Id, R>
    where
        F: Fn(&Camera) -> R,
    {
        self.cameras
            .iter()
            .map(|(id, camera)| (id.clone(), f(camera)))
            .collect()
    }

    /// Run `op` on every camera concurrently with the default options
    pub fn dispatch<R, F>(&self, op: F) -> Result<Dispatched<R>>
    where
        R: Send,
        F: Fn(&Camera) -> Result<R> + Sync,
    {
        self.fan_out("dispatch", self.options, &op)
    }

    /// Run `op` on every camera concurrently with explicit options
    pub fn dispatch_with<R, F>(&self, options: DispatchOptions, op: F) -> Result<Dispatched<R>>
    where
        R: Send,
        F: Fn(&Camera) -> Result<R> + Sync,
    {
        self.fan_out("dispatch", options, &op)
    }

    /// Fan a command out to every camera
    pub fn apply(&self, command: &CameraCommand) -> Result<Dispatched<CommandOutput>> {
        self.fan_out(command.name(), self.options, &|camera: &Camera| command.execute(camera))
    }

    /// Resolve `name` to an attribute read or a fanned-out operation
    ///
    /// `identity`, `state`, `address` and `device_user_id` are read on the
    /// calling thread. Everything else goes through [`CameraCommand::parse`].
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Dispatched<CommandOutput>> {
        let attribute = |f: &dyn Fn(&Camera) -> Result<Value>| -> Result<Dispatched<CommandOutput>> {
            arity(name, args, 0)?;
            Ok(self.read(|camera| f(camera).map(CommandOutput::Value)))
        };

        match name {
            "identity" => attribute(&|camera| Ok(Value::from(camera.identity()))),
            "state" => attribute(&|camera| camera.state().map(|state| Value::from(state.to_string()))),
            "address" => attribute(&|camera| Ok(Value::from(camera.address().to_string()))),
            "device_user_id" => attribute(&|camera| Ok(Value::from(camera.device_user_id()))),
            _ => {
                let command = CameraCommand::parse(name, args)?;
                self.apply(&command)
            }
        }
    }

    fn fan_out<R, F>(&self, operation: &str, options: DispatchOptions, op: &F) -> Result<Dispatched<R>>
    where
        R: Send,
        F: Fn(&Camera) -> Result<R> + Sync,
    {
        let _span = dispatch_span(operation, self.len()).entered();
        let results = Mutex::new(BTreeMap::new());
        let store = |id: &Id, outcome: Result<R>| match results.lock() {
            Ok(mut results) => {
                results.insert(id.clone(), outcome);
            }
            Err(_) => warn!("Dropped result of camera {}: results lock poisoned", id),
        };

        let spawn_error = match options.max_workers {
            Some(0) => {
                return Err(DeviceError::InvalidArgument(
                    "max_workers must be at least 1".to_string(),
                ))
            }
            Some(limit) if limit < self.len() => self.run_bounded(limit, op, &store),
            _ => self.run_per_camera(op, &store),
        };
        if let Some(e) = spawn_error {
            return Err(e);
        }

        let results = results
            .into_inner()
            .map_err(|_| DeviceError::lock("dispatch results"))?;
        debug!("Dispatched {} to {} cameras", operation, results.len());
        Ok(results)
    }

    /// One scoped worker per camera; returns the first spawn failure after
    /// every started worker has joined
    fn run_per_camera<R, F, S>(&self, op: &F, store: &S) -> Option<DeviceError>
    where
        R: Send,
        F: Fn(&Camera) -> Result<R> + Sync,
        S: Fn(&Id, Result<R>) + Sync,
    {
        thread::scope(|scope| {
            for (id, camera) in &self.cameras {
                let spawned = thread::Builder::new()
                    .name(format!("camflow-{}", id))
                    .spawn_scoped(scope, move || store(id, run_isolated(camera, op)));
                if let Err(e) = spawned {
                    warn!("Failed to spawn worker for camera {}: {}", id, e);
                    return Some(DeviceError::Spawn(format!("camera {}: {}", id, e)));
                }
            }
            None
        })
    }

    /// `limit` scoped workers pulling cameras from a shared cursor
    fn run_bounded<R, F, S>(&self, limit: usize, op: &F, store: &S) -> Option<DeviceError>
    where
        R: Send,
        F: Fn(&Camera) -> Result<R> + Sync,
        S: Fn(&Id, Result<R>) + Sync,
    {
        let cameras: Vec<(&Id, &Camera)> = self.cameras.iter().collect();
        let cursor = AtomicUsize::new(0);
        let cameras = &cameras;
        let cursor = &cursor;

        thread::scope(|scope| {
            for worker in 0..limit {
                let spawned = thread::Builder::new()
                    .name(format!("camflow-worker-{}", worker))
                    .spawn_scoped(scope, move || loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some((id, camera)) = cameras.get(index) else {
                            break;
                        };
                        store(id, run_isolated(camera, op));
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn dispatch worker {}: {}", worker, e);
                    if worker == 0 {
                        return Some(DeviceError::Spawn(e.to_string()));
                    }
                    break;
                }
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use camflow_core::config::CameraConfig;

    use super::*;
    use crate::camera::CameraState;
    use crate::nodes::NodeTable;
    use crate::params::CustomParams;
    use crate::sdk::sim::{CallPoint, VirtualDevice, VirtualDeviceSpec, VirtualSdk};
    use crate::sdk::SdkContext;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn registry(specs: Vec<VirtualDeviceSpec>) -> (Vec<Arc<VirtualDevice>>, MultiCameras) {
        let sdk = Arc::new(VirtualSdk::new());
        let devices: Vec<_> = specs.into_iter().map(|spec| sdk.add_device(spec)).collect();
        let context = SdkContext::shared(sdk);
        let nodes = Arc::new(NodeTable::builtin());

        let cameras = devices.iter().map(|device| {
            let settings = CustomParams::default()
                .resolve(device.address(), &CameraConfig::default())
                .unwrap();
            Camera::new(context.clone(), nodes.clone(), settings)
        });
        let registry = MultiCameras::from_cameras(cameras.collect::<Vec<_>>()).unwrap();
        (devices, registry)
    }

    fn plain(lasts: &[u8]) -> Vec<VirtualDeviceSpec> {
        lasts.iter().map(|last| VirtualDeviceSpec::new(addr(*last))).collect()
    }

    #[test]
    fn test_duplicates_rejected() {
        let (_devices, mut cameras) = registry(plain(&[1]));
        let sdk = Arc::new(VirtualSdk::new().with_devices([addr(1)]));
        let settings = CustomParams::default().resolve(addr(1), &CameraConfig::default()).unwrap();
        let duplicate = Camera::new(SdkContext::shared(sdk), Arc::new(NodeTable::builtin()), settings);
        assert!(matches!(cameras.insert(duplicate), Err(DeviceError::InvalidArgument(_))));
        assert_eq!(cameras.len(), 1);
    }

    #[test]
    fn test_results_keyed_by_every_camera() {
        let (_devices, cameras) = registry(plain(&[3, 1, 2]));
        let results = cameras.dispatch(|camera| Ok(camera.address())).unwrap();

        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), cameras.ids());
        for (id, result) in &results {
            assert_eq!(result.as_ref().unwrap().to_string(), id.as_str());
        }
    }

    #[test]
    fn test_sorted_under_delays() {
        let (_devices, cameras) = registry(plain(&[1, 2, 3, 4]));
        let finished = Mutex::new(Vec::new());
        let results = cameras
            .dispatch(|camera| {
                let last = camera.address().octets()[3];
                thread::sleep(Duration::from_millis(10 * (5 - last as u64)));
                finished.lock().unwrap().push(last);
                Ok(last)
            })
            .unwrap();

        assert_eq!(results.values().map(|r| *r.as_ref().unwrap()).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(finished.into_inner().unwrap().len(), 4);
    }

    #[test]
    fn test_failure_is_isolated() {
        let mut specs = plain(&[1, 3]);
        specs.push(VirtualDeviceSpec::new(addr(2)).failing_at(CallPoint::Open, 0x8000_0204));
        let (devices, cameras) = registry(specs);

        let results = cameras.apply(&CameraCommand::Enter).unwrap();
        assert!(matches!(results[&Id::from(addr(2))], Err(DeviceError::Open(_))));
        assert!(results[&Id::from(addr(1))].is_ok());
        assert!(results[&Id::from(addr(3))].is_ok());
        assert!(devices[0].is_grabbing());
        assert!(devices[1].is_grabbing());
        assert!(!devices[2].is_opened());
    }

    #[test]
    fn test_panic_is_captured() {
        let (_devices, cameras) = registry(plain(&[1, 2]));
        let results = cameras
            .dispatch(|camera| {
                if camera.address() == addr(2) {
                    panic!("sensor on fire");
                }
                Ok(())
            })
            .unwrap();

        assert!(results[&Id::from(addr(1))].is_ok());
        assert!(matches!(
            &results[&Id::from(addr(2))],
            Err(DeviceError::WorkerPanicked(message)) if message.contains("sensor on fire")
        ));
    }

    #[test]
    fn test_worker_threads() {
        let (_devices, cameras) = registry(plain(&[1, 2]));
        let caller = thread::current().id();

        let read = cameras.read(|_| thread::current().id());
        assert!(read.values().all(|id| *id == caller));

        let names = cameras
            .dispatch(|_| Ok(thread::current().name().map(str::to_string)))
            .unwrap();
        assert_eq!(
            names[&Id::from(addr(1))].as_ref().unwrap().as_deref(),
            Some("camflow-10.0.0.1")
        );
    }

    #[test]
    fn test_three_device_scenario() {
        let specs = vec![
            VirtualDeviceSpec::new(addr(1)),
            VirtualDeviceSpec::new(addr(2)).inaccessible_in(camflow_core::types::AccessMode::Exclusive),
            VirtualDeviceSpec::new(addr(3)),
        ];
        let (_devices, cameras) = registry(specs);

        let created = cameras.apply(&CameraCommand::CreateHandle).unwrap();
        assert!(created.values().all(|r| r.is_ok()));

        let opened = cameras.apply(&CameraCommand::Open).unwrap();
        assert!(matches!(opened[&Id::from(addr(2))], Err(DeviceError::Access(_))));

        let states = cameras.read(|camera| camera.state().unwrap());
        assert_eq!(states[&Id::from(addr(1))], CameraState::Opened);
        assert_eq!(states[&Id::from(addr(2))], CameraState::HandleCreated);
        assert_eq!(states[&Id::from(addr(3))], CameraState::Opened);
    }

    #[test]
    fn test_bounded_matches_unbounded() {
        let (_devices, cameras) = registry(plain(&[5, 1, 4, 2, 3]));
        let op = |camera: &Camera| {
            if camera.address() == addr(4) {
                return Err(DeviceError::InvalidState("scripted".to_string()));
            }
            Ok(camera.address().octets()[3] * 2)
        };

        let unbounded = cameras.dispatch_with(DispatchOptions::unbounded(), op).unwrap();
        let bounded = cameras.dispatch_with(DispatchOptions::bounded(2), op).unwrap();
        assert_eq!(unbounded.keys().collect::<Vec<_>>(), bounded.keys().collect::<Vec<_>>());
        for (id, result) in &unbounded {
            assert_eq!(result.as_ref().ok(), bounded[id].as_ref().ok());
        }

        let names = cameras
            .dispatch_with(DispatchOptions::bounded(2), |_| {
                Ok(thread::current().name().unwrap_or_default().to_string())
            })
            .unwrap();
        let distinct: BTreeSet<_> = names.values().map(|r| r.as_ref().unwrap().clone()).collect();
        assert!(distinct.len() <= 2);
        assert!(distinct.iter().all(|name| name.starts_with("camflow-worker-")));

        assert!(matches!(
            cameras.dispatch_with(DispatchOptions::bounded(0), op),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invoke_by_name() {
        let (_devices, cameras) = registry(plain(&[1, 2]));

        let identities = cameras.invoke("identity", &[]).unwrap();
        assert_eq!(
            identities[&Id::from(addr(1))].as_ref().unwrap().as_value(),
            Some(&Value::from("camera[10.0.0.1]"))
        );

        let entered = cameras.invoke("enter", &[]).unwrap();
        assert!(entered.values().all(|r| r.is_ok()));

        cameras
            .invoke("set_parameter", &[Value::from("Gain"), Value::from(2.5)])
            .unwrap();
        let gains = cameras.invoke("get_parameter", &[Value::from("Gain")]).unwrap();
        assert!(gains
            .values()
            .all(|r| r.as_ref().unwrap().as_value() == Some(&Value::Float(2.5))));

        let states = cameras.invoke("state", &[]).unwrap();
        assert_eq!(
            states[&Id::from(addr(2))].as_ref().unwrap().as_value(),
            Some(&Value::from("Grabbing"))
        );

        assert!(matches!(cameras.invoke("explode", &[]), Err(DeviceError::UnknownOperation(_))));
        assert!(matches!(cameras.invoke("get_parameter", &[]), Err(DeviceError::InvalidArgument(_))));
    }

    #[test]
    fn test_capture_and_save_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (_devices, cameras) = registry(plain(&[1, 2]));
        cameras.apply(&CameraCommand::Enter).unwrap();

        let frames = cameras.apply(&CameraCommand::CaptureFrame).unwrap();
        for result in frames.into_values() {
            let image = result.unwrap().into_frame().unwrap();
            assert_eq!((image.width(), image.height()), (64, 48));
        }

        let command = CameraCommand::parse(
            "save_image",
            &[Value::from(dir.path().to_string_lossy().to_string()), Value::from("png")],
        )
        .unwrap();
        let saved = cameras.apply(&command).unwrap();
        assert!(saved.values().all(|r| r.is_ok()));
        assert!(dir.path().join("10.0.0.2.png").exists());
    }

    #[test]
    fn test_empty_registry() {
        let cameras = MultiCameras::new();
        assert!(cameras.dispatch(|_| Ok(())).unwrap().is_empty());
        assert!(cameras.read(|camera| camera.identity()).is_empty());
    }
}
