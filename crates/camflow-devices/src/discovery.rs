/*!
 * Camera discovery.
 *
 * [`CameraDiscoverer`] enumerates attached cameras and builds [`Camera`]s and
 * [`MultiCameras`] from them. Each camera's settings are the configured
 * defaults, overlaid by the params file's `global` block, its own block and
 * finally any caller overrides.
 */
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info};

use camflow_core::config::{CameraConfig, Config};

use crate::camera::Camera;
use crate::error::{DeviceError, Result};
use crate::nodes::NodeTable;
use crate::params::{CameraParams, ParamsBlock};
use crate::registry::{DispatchOptions, MultiCameras};
use crate::sdk::{DeviceDescriptor, SdkContext, TransportKind};

/// Which enumerated camera to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraSelector {
    /// The camera with the lowest address
    First,
    /// The camera at this address
    Address(Ipv4Addr),
    /// The n-th camera in address order
    Index(usize),
}

/// Builds cameras from enumeration, configuration and the params file
#[derive(Debug)]
pub struct CameraDiscoverer {
    context: Arc<SdkContext>,
    nodes: Arc<NodeTable>,
    params: CameraParams,
    defaults: CameraConfig,
    overrides: ParamsBlock,
    dispatch: DispatchOptions,
}

impl CameraDiscoverer {
    /// A discoverer with the builtin node table and no params file
    pub fn new(context: Arc<SdkContext>) -> Self {
        Self {
            context,
            nodes: Arc::new(NodeTable::builtin()),
            params: CameraParams::new(),
            defaults: CameraConfig::default(),
            overrides: ParamsBlock::default(),
            dispatch: DispatchOptions::default(),
        }
    }

    /// A discoverer set up from the `[camera]` and `[dispatch]` sections,
    /// loading the node table and params file they name
    pub fn from_config(context: Arc<SdkContext>, config: &Config) -> Result<Self> {
        let nodes = match &config.camera.nodes_file {
            Some(path) => NodeTable::load(path)?,
            None => NodeTable::builtin(),
        };
        let params = match &config.camera.params_file {
            Some(path) => CameraParams::load(path)?,
            None => CameraParams::new(),
        };

        Ok(Self::new(context)
            .with_nodes(Arc::new(nodes))
            .with_params(params)
            .with_defaults(config.camera.clone())
            .with_dispatch(DispatchOptions::from(&config.dispatch)))
    }

    /// Use a different node table
    pub fn with_nodes(mut self, nodes: Arc<NodeTable>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Use a params file
    pub fn with_params(mut self, params: CameraParams) -> Self {
        self.params = params;
        self
    }

    /// Use different camera defaults
    pub fn with_defaults(mut self, defaults: CameraConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Values laid over every camera's params block
    pub fn with_overrides(mut self, overrides: ParamsBlock) -> Self {
        self.overrides = overrides;
        self
    }

    /// Dispatch options for the registries this discoverer builds
    pub fn with_dispatch(mut self, dispatch: DispatchOptions) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// The SDK context
    pub fn context(&self) -> &Arc<SdkContext> {
        &self.context
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.context.initialize()?;
        let mut devices = self
            .context
            .sdk()
            .enumerate_devices(TransportKind::GigE)
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
        if devices.is_empty() {
            return Err(DeviceError::NoDevice);
        }

        devices.sort_by_key(|d| d.address);
        devices.dedup_by_key(|d| d.address);
        debug!("Enumerated {} cameras", devices.len());
        Ok(devices)
    }

    /// Addresses of every attached GigE camera, sorted
    pub fn enumerate_addresses(&self) -> Result<Vec<Ipv4Addr>> {
        Ok(self.enumerate()?.into_iter().map(|d| d.address).collect())
    }

    fn build(&self, address: Ipv4Addr, descriptor: Option<DeviceDescriptor>) -> Result<Camera> {
        let mut block = self.params.for_camera(&address.to_string());
        block.merge(&self.overrides);
        let settings = block.custom.resolve(address, &self.defaults)?;

        let camera = Camera::new(self.context.clone(), self.nodes.clone(), settings)
            .with_native_params(block.native);
        Ok(match descriptor {
            Some(descriptor) => camera.with_descriptor(descriptor),
            None => camera,
        })
    }

    /// Build one camera
    ///
    /// `Address` skips enumeration; `First` and `Index` pick from the sorted
    /// enumeration.
    pub fn create_camera(&self, selector: CameraSelector) -> Result<Camera> {
        let camera = match selector {
            CameraSelector::Address(address) => self.build(address, None)?,
            CameraSelector::First | CameraSelector::Index(_) => {
                let index = match selector {
                    CameraSelector::Index(index) => index,
                    _ => 0,
                };
                let mut devices = self.enumerate()?;
                if index >= devices.len() {
                    return Err(DeviceError::InvalidArgument(format!(
                        "camera index {} out of range, {} cameras attached",
                        index,
                        devices.len()
                    )));
                }
                let descriptor = devices.swap_remove(index);
                self.build(descriptor.address, Some(descriptor))?
            }
        };
        debug!("Created {}", camera.identity());
        Ok(camera)
    }

    /// Build a registry of cameras at `addresses`, or of every enumerated
    /// camera when `None`
    pub fn create_all_cameras(&self, addresses: Option<Vec<Ipv4Addr>>) -> Result<MultiCameras> {
        let mut cameras = MultiCameras::new().with_options(self.dispatch);
        match addresses {
            Some(addresses) => {
                for address in addresses {
                    cameras.insert(self.build(address, None)?)?;
                }
            }
            None => {
                for descriptor in self.enumerate()? {
                    cameras.insert(self.build(descriptor.address, Some(descriptor))?)?;
                }
            }
        }
        info!("Created {} cameras", cameras.len());
        Ok(cameras)
    }
}
