/*!
 * Per-camera parameter file.
 *
 * The YAML file has a `global` block and one block per camera address. Each
 * block carries `native` node values, written to the device on open, and
 * `custom` settings that drive how camflow talks to the camera. A camera's
 * effective block is its own block laid over `global`.
 *
 * ```yaml
 * global:
 *   native:
 *     ExposureTime: 8000.0
 *   custom:
 *     grab_method: 2
 * 192.168.1.10:
 *   native:
 *     DeviceUserID: left
 *   custom:
 *     access_mode: monitor
 * ```
 */
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use tracing::debug;
use yaml_rust::{Yaml, YamlLoader};

use camflow_core::config::CameraConfig;
use camflow_core::error::Error as CoreError;
use camflow_core::types::{AccessMode, CreateHandleMethod, GrabMethod, Rotation, Value};
use camflow_core::utils::{default_multicast_for, host_ip_for};

use crate::error::{DeviceError, Result};

/// Camera settings that are not device nodes; unset fields fall through
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomParams {
    /// Local interface, `""` to auto-detect
    pub host_ip: Option<String>,
    /// Frame acquisition strategy
    pub grab_method: Option<GrabMethod>,
    /// Device access mode
    pub access_mode: Option<AccessMode>,
    /// Handle creation method
    pub create_handle_method: Option<CreateHandleMethod>,
    /// Frame scale factor
    pub resize_ratio: Option<f64>,
    /// Frame rotation
    pub rotation: Option<Rotation>,
    /// Frame wait timeout in milliseconds
    pub get_one_frame_timeout_ms: Option<u64>,
    /// Multicast group address
    pub multicast_ip: Option<Ipv4Addr>,
    /// Multicast group port
    pub multicast_port: Option<u16>,
}

/// Fully resolved settings for one camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// Camera address
    pub address: Ipv4Addr,
    /// Local interface pinned for handle creation
    pub host_ip: Option<Ipv4Addr>,
    /// Frame acquisition strategy
    pub grab_method: GrabMethod,
    /// Device access mode
    pub access_mode: AccessMode,
    /// Handle creation method
    pub create_handle_method: CreateHandleMethod,
    /// Frame scale factor
    pub resize_ratio: f64,
    /// Frame rotation
    pub rotation: Rotation,
    /// Frame wait timeout
    pub frame_timeout: Duration,
    /// Multicast group, set only for non-exclusive access
    pub multicast: Option<SocketAddrV4>,
}

fn yaml_key(key: &Yaml) -> Option<String> {
    match key {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Real(r) => Some(r.clone()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Convert a scalar or list YAML node into a parameter value
pub fn yaml_to_value(key: &str, node: &Yaml) -> Result<Value> {
    match node {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(*b)),
        Yaml::Integer(i) => Ok(Value::Integer(*i)),
        Yaml::Real(_) => node
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| DeviceError::invalid_value(key, "unparseable float")),
        Yaml::String(s) => Ok(Value::String(s.clone())),
        Yaml::Array(items) => items
            .iter()
            .map(|item| yaml_to_value(key, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        _ => Err(DeviceError::invalid_value(key, "nested maps are not supported")),
    }
}

fn code_or_name<T>(
    key: &str,
    value: &Value,
    from_code: impl Fn(i64) -> camflow_core::error::Result<T>,
    from_name: impl Fn(&str) -> camflow_core::error::Result<T>,
) -> Result<Option<T>> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Integer(code) => from_code(*code),
        Value::String(name) => from_name(name),
        other => return Err(DeviceError::invalid_value(key, format!("unexpected {}", other.kind()))),
    };
    parsed
        .map(Some)
        .map_err(|e| DeviceError::invalid_value(key, e.to_string()))
}

impl CustomParams {
    /// Apply one `custom` entry
    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            "host_ip" => {
                self.host_ip = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.trim().to_string()),
                    other => return Err(DeviceError::invalid_value(key, format!("unexpected {}", other.kind()))),
                }
            }
            "grab_method" => {
                self.grab_method = code_or_name(key, value, GrabMethod::from_code, str::parse)?
            }
            "access_mode" => {
                self.access_mode = code_or_name(key, value, AccessMode::from_code, str::parse)?
            }
            "create_handle_method" => {
                self.create_handle_method =
                    code_or_name(key, value, CreateHandleMethod::from_code, str::parse)?
            }
            "rotation" => self.rotation = code_or_name(key, value, Rotation::from_code, str::parse)?,
            "resize_ratio" => {
                self.resize_ratio = match value {
                    Value::Null => Some(1.0),
                    other => Some(
                        other
                            .as_float()
                            .ok_or_else(|| DeviceError::invalid_value(key, "expected a number"))?,
                    ),
                }
            }
            "get_one_frame_timeout_ms" => {
                self.get_one_frame_timeout_ms = Some(
                    value
                        .as_integer()
                        .filter(|ms| *ms >= 0)
                        .ok_or_else(|| DeviceError::invalid_value(key, "expected milliseconds"))?
                        as u64,
                )
            }
            "multicast_ip" => {
                self.multicast_ip = match value {
                    Value::Null => None,
                    Value::String(s) => Some(
                        s.trim()
                            .parse()
                            .map_err(|_| DeviceError::invalid_value(key, format!("bad address '{}'", s)))?,
                    ),
                    other => return Err(DeviceError::invalid_value(key, format!("unexpected {}", other.kind()))),
                }
            }
            "multicast_port" => {
                self.multicast_port = Some(
                    value
                        .as_integer()
                        .and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| DeviceError::invalid_value(key, "expected a port number"))?,
                )
            }
            other => {
                return Err(DeviceError::InvalidArgument(format!(
                    "unknown custom parameter '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Lay `other` over `self`: every field `other` sets wins
    pub fn merge(&mut self, other: &CustomParams) {
        if other.host_ip.is_some() {
            self.host_ip = other.host_ip.clone();
        }
        self.grab_method = other.grab_method.or(self.grab_method);
        self.access_mode = other.access_mode.or(self.access_mode);
        self.create_handle_method = other.create_handle_method.or(self.create_handle_method);
        self.resize_ratio = other.resize_ratio.or(self.resize_ratio);
        self.rotation = other.rotation.or(self.rotation);
        self.get_one_frame_timeout_ms = other.get_one_frame_timeout_ms.or(self.get_one_frame_timeout_ms);
        self.multicast_ip = other.multicast_ip.or(self.multicast_ip);
        self.multicast_port = other.multicast_port.or(self.multicast_port);
    }

    /// Resolve against the configured defaults for the camera at `address`
    pub fn resolve(&self, address: Ipv4Addr, defaults: &CameraConfig) -> Result<CameraSettings> {
        let host_ip = match self.host_ip.as_deref().or(defaults.host_ip.as_deref()) {
            None => None,
            Some("") => Some(host_ip_for(address)?),
            Some(ip) => Some(ip.parse::<Ipv4Addr>().map_err(CoreError::from)?),
        };

        let access_mode = self.access_mode.unwrap_or(defaults.access_mode);
        let resize_ratio = self.resize_ratio.unwrap_or(defaults.resize_ratio);
        if !(resize_ratio > 0.0) {
            return Err(DeviceError::invalid_value(
                "resize_ratio",
                format!("must be positive, got {}", resize_ratio),
            ));
        }

        let multicast = (!access_mode.is_exclusive()).then(|| {
            SocketAddrV4::new(
                self.multicast_ip.unwrap_or_else(|| default_multicast_for(address)),
                self.multicast_port.unwrap_or(defaults.multicast_port),
            )
        });

        Ok(CameraSettings {
            address,
            host_ip,
            grab_method: self.grab_method.unwrap_or(defaults.grab_method),
            access_mode,
            create_handle_method: self
                .create_handle_method
                .unwrap_or(defaults.create_handle_method),
            resize_ratio,
            rotation: self.rotation.unwrap_or(defaults.rotation),
            frame_timeout: Duration::from_millis(
                self.get_one_frame_timeout_ms
                    .unwrap_or(defaults.get_one_frame_timeout_ms),
            ),
            multicast,
        })
    }
}

/// One block of the params file, or a set of caller overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamsBlock {
    /// Device node values in file order
    pub native: Vec<(String, Value)>,
    /// Camera settings
    pub custom: CustomParams,
}

impl ParamsBlock {
    /// Set a native node value, replacing in place if already present
    pub fn set_native<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        match self.native.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.native.push((key, value)),
        }
    }

    /// Lay `other` over `self`, keeping `self`'s native order for shared keys
    pub fn merge(&mut self, other: &ParamsBlock) {
        for (key, value) in &other.native {
            self.set_native(key.clone(), value.clone());
        }
        self.custom.merge(&other.custom);
    }

    fn from_yaml(block: &Yaml) -> Result<Self> {
        let mut parsed = Self::default();
        let Some(hash) = block.as_hash() else {
            return Ok(parsed);
        };

        if let Some(native) = hash.get(&Yaml::String("native".into())).and_then(Yaml::as_hash) {
            for (k, v) in native {
                let key = yaml_key(k)
                    .ok_or_else(|| DeviceError::InvalidArgument("non-scalar native key".into()))?;
                let value = yaml_to_value(&key, v)?;
                parsed.set_native(key, value);
            }
        }

        if let Some(custom) = hash.get(&Yaml::String("custom".into())).and_then(Yaml::as_hash) {
            for (k, v) in custom {
                let key = yaml_key(k)
                    .ok_or_else(|| DeviceError::InvalidArgument("non-scalar custom key".into()))?;
                let value = yaml_to_value(&key, v)?;
                parsed.custom.set(&key, &value)?;
            }
        }

        Ok(parsed)
    }
}

/// The parsed params file
#[derive(Debug, Clone, Default)]
pub struct CameraParams {
    global: ParamsBlock,
    cameras: BTreeMap<String, ParamsBlock>,
}

impl CameraParams {
    /// A params file with no entries
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse params YAML
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(source)
            .map_err(|e| CoreError::parse(format!("Invalid camera params: {}", e)))?;

        let mut params = Self::new();
        let Some(root) = docs.first().and_then(Yaml::as_hash) else {
            return Ok(params);
        };

        for (k, block) in root {
            let key = yaml_key(k)
                .ok_or_else(|| DeviceError::InvalidArgument("non-scalar camera key".into()))?;
            let parsed = ParamsBlock::from_yaml(block)?;
            if key == "global" {
                params.global = parsed;
            } else {
                params.cameras.insert(key, parsed);
            }
        }
        Ok(params)
    }

    /// Load params YAML from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let params = Self::from_yaml_str(&source)?;
        debug!(
            "Loaded params for {} cameras from {}",
            params.cameras.len(),
            path.display()
        );
        Ok(params)
    }

    /// The `global` block
    pub fn global(&self) -> &ParamsBlock {
        &self.global
    }

    /// Addresses with their own block, sorted
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.cameras.keys().map(String::as_str)
    }

    /// Effective block for a camera: its own block over `global`
    pub fn for_camera(&self, address: &str) -> ParamsBlock {
        let mut block = self.global.clone();
        if let Some(local) = self.cameras.get(address) {
            block.merge(local);
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global:
  native:
    ExposureTime: 8000.0
    Gain: 2
    TriggerMode: "Off"
  custom:
    grab_method: 2
    get_one_frame_timeout_ms: 500
192.168.1.10:
  native:
    Gain: 6
    DeviceUserID: left
  custom:
    access_mode: monitor
    rotation: 2
192.168.1.11:
  custom:
    multicast_ip: 239.192.1.200
    multicast_port: 2000
    access_mode: 3
"#;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    #[test]
    fn test_local_over_global() {
        let params = CameraParams::from_yaml_str(SAMPLE).unwrap();
        let block = params.for_camera("192.168.1.10");

        let keys: Vec<_> = block.native.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ExposureTime", "Gain", "TriggerMode", "DeviceUserID"]);
        assert_eq!(block.native[1].1, Value::Integer(6));
        assert_eq!(block.custom.access_mode, Some(AccessMode::Monitor));
        assert_eq!(block.custom.grab_method, Some(GrabMethod::GetImageBuffer));
        assert_eq!(block.custom.rotation, Some(Rotation::Ccw90));
    }

    #[test]
    fn test_unlisted_camera_gets_global() {
        let params = CameraParams::from_yaml_str(SAMPLE).unwrap();
        let block = params.for_camera("10.0.0.1");
        assert_eq!(&block, params.global());
        assert_eq!(params.addresses().collect::<Vec<_>>(), vec!["192.168.1.10", "192.168.1.11"]);
    }

    #[test]
    fn test_resolve_defaults_and_multicast() {
        let params = CameraParams::from_yaml_str(SAMPLE).unwrap();
        let defaults = CameraConfig::default();

        let left = params.for_camera("192.168.1.10").custom.resolve(addr(10), &defaults).unwrap();
        assert_eq!(left.frame_timeout, Duration::from_millis(500));
        assert_eq!(
            left.multicast,
            Some(SocketAddrV4::new(Ipv4Addr::new(239, 192, 1, 10), 1042))
        );

        let right = params.for_camera("192.168.1.11").custom.resolve(addr(11), &defaults).unwrap();
        assert_eq!(right.access_mode, AccessMode::Control);
        assert_eq!(
            right.multicast,
            Some(SocketAddrV4::new(Ipv4Addr::new(239, 192, 1, 200), 2000))
        );

        let other = params.for_camera("192.168.1.12").custom.resolve(addr(12), &defaults).unwrap();
        assert_eq!(other.access_mode, AccessMode::Exclusive);
        assert!(other.multicast.is_none());
        assert!(other.host_ip.is_none());
    }

    #[test]
    fn test_host_ip_auto_detect() {
        let custom = CustomParams {
            host_ip: Some(String::new()),
            ..CustomParams::default()
        };
        let settings = custom
            .resolve(Ipv4Addr::LOCALHOST, &CameraConfig::default())
            .unwrap();
        assert!(settings.host_ip.unwrap().is_loopback());
    }

    #[test]
    fn test_override_merge() {
        let mut block = CameraParams::from_yaml_str(SAMPLE).unwrap().for_camera("192.168.1.10");
        let mut overrides = ParamsBlock::default();
        overrides.set_native("ExposureTime", 1000.0);
        overrides.custom.access_mode = Some(AccessMode::Exclusive);

        block.merge(&overrides);
        assert_eq!(block.native[0], ("ExposureTime".to_string(), Value::Float(1000.0)));
        assert_eq!(block.custom.access_mode, Some(AccessMode::Exclusive));
        assert_eq!(block.custom.rotation, Some(Rotation::Ccw90));
    }

    #[test]
    fn test_bad_custom_values() {
        let err = CameraParams::from_yaml_str("global:\n  custom:\n    access_mode: 2\n").unwrap_err();
        assert!(matches!(err, DeviceError::InvalidValue { ref key, .. } if key == "access_mode"));

        let err = CameraParams::from_yaml_str("global:\n  custom:\n    exposure: 2\n").unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));

        let custom = CustomParams {
            resize_ratio: Some(0.0),
            ..CustomParams::default()
        };
        assert!(custom.resolve(addr(1), &CameraConfig::default()).is_err());
    }

    #[test]
    fn test_empty_and_missing_file() {
        assert!(CameraParams::from_yaml_str("").unwrap().global().native.is_empty());
        assert!(matches!(
            CameraParams::load("/nonexistent/params.yaml"),
            Err(DeviceError::Io(_))
        ));
    }
}
