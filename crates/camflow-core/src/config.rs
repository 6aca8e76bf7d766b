/*!
 * Configuration management for camflow.
 *
 * This module loads the process-level settings: logging, the defaults every
 * camera starts from before its params file block is applied, and the
 * fan-out dispatcher limits.
 */
use std::path::Path;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{AccessMode, CreateHandleMethod, GrabMethod, Rotation};

/// Environment prefix used when none is given
pub const DEFAULT_ENV_PREFIX: &str = "camflow";

/// Top-level camflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Camera defaults
    #[serde(default)]
    pub camera: CameraConfig,

    /// Fan-out dispatcher configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Defaults applied to every camera before its params file block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Local interface used to reach the cameras, `""` to auto-detect per camera
    #[serde(default)]
    pub host_ip: Option<String>,

    /// Frame acquisition strategy
    #[serde(default = "default_grab_method")]
    pub grab_method: GrabMethod,

    /// Device access mode
    #[serde(default = "default_access_mode")]
    pub access_mode: AccessMode,

    /// How native handles are created
    #[serde(default = "default_create_handle_method")]
    pub create_handle_method: CreateHandleMethod,

    /// Scale factor applied to every converted frame
    #[serde(default = "default_resize_ratio")]
    pub resize_ratio: f64,

    /// Rotation applied to every converted frame
    #[serde(default)]
    pub rotation: Rotation,

    /// Frame wait timeout in milliseconds
    #[serde(default = "default_frame_timeout_ms")]
    pub get_one_frame_timeout_ms: u64,

    /// Multicast group port used in non-exclusive modes
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,

    /// Path of the node table (TOML)
    #[serde(default)]
    pub nodes_file: Option<String>,

    /// Path of the per-camera params file (YAML)
    #[serde(default)]
    pub params_file: Option<String>,
}

/// Fan-out dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on concurrent workers per fan-out, unbounded when unset
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            host_ip: None,
            grab_method: default_grab_method(),
            access_mode: default_access_mode(),
            create_handle_method: default_create_handle_method(),
            resize_ratio: default_resize_ratio(),
            rotation: Rotation::None,
            get_one_frame_timeout_ms: default_frame_timeout_ms(),
            multicast_port: default_multicast_port(),
            nodes_file: None,
            params_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grab_method() -> GrabMethod {
    GrabMethod::GetImageBuffer
}

fn default_access_mode() -> AccessMode {
    AccessMode::Exclusive
}

fn default_create_handle_method() -> CreateHandleMethod {
    CreateHandleMethod::Direct
}

fn default_resize_ratio() -> f64 {
    1.0
}

fn default_frame_timeout_ms() -> u64 {
    1000
}

fn default_multicast_port() -> u16 {
    1042
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Use the default `CAMFLOW__` environment prefix
    pub fn with_default_environment(self) -> Self {
        self.with_environment_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            debug!("Using caller-provided configuration");
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

impl Config {
    /// Check value ranges the type system cannot express
    pub fn validate(&self) -> Result<()> {
        if !(self.camera.resize_ratio > 0.0) {
            return Err(Error::config(format!(
                "camera.resize_ratio must be positive, got {}",
                self.camera.resize_ratio
            )));
        }
        if self.dispatch.max_workers == Some(0) {
            return Err(Error::config("dispatch.max_workers must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.camera.grab_method, GrabMethod::GetImageBuffer);
        assert_eq!(config.camera.access_mode, AccessMode::Exclusive);
        assert_eq!(config.camera.create_handle_method, CreateHandleMethod::Direct);
        assert!(config.camera.host_ip.is_none());
        assert_eq!(config.camera.get_one_frame_timeout_ms, 1000);
        assert_eq!(config.camera.multicast_port, 1042);
        assert!(config.dispatch.max_workers.is_none());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.camera.rotation, Rotation::None);
        assert_eq!(config.camera.resize_ratio, 1.0);
        assert!(config.camera.params_file.is_none());
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("camflow.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [logging]
                level = "debug"

                [camera]
                access_mode = "monitor"
                rotation = "ccw90"
                resize_ratio = 0.5
                params_file = "params.yaml"

                [dispatch]
                max_workers = 4
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.camera.access_mode, AccessMode::Monitor);
        assert_eq!(config.camera.rotation, Rotation::Ccw90);
        assert_eq!(config.camera.resize_ratio, 0.5);
        assert_eq!(config.camera.params_file.as_deref(), Some("params.yaml"));
        assert_eq!(config.dispatch.max_workers, Some(4));

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("CAMFLOWENV__LOGGING__LEVEL", "trace");
        env::set_var("CAMFLOWENV__CAMERA__GET_ONE_FRAME_TIMEOUT_MS", "250");

        let config = ConfigBuilder::new()
            .with_environment_prefix("camflowenv")
            .build()?;

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.camera.get_one_frame_timeout_ms, 250);

        env::remove_var("CAMFLOWENV__LOGGING__LEVEL");
        env::remove_var("CAMFLOWENV__CAMERA__GET_ONE_FRAME_TIMEOUT_MS");

        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = Config::default();
        config.camera.resize_ratio = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.dispatch.max_workers = Some(0);
        assert!(config.validate().is_err());
    }
}
