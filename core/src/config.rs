//! Configuration types for aoti-container.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{ContainerError, Result};
use crate::graph::ExecutionMode;
use crate::tensor::DType;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Container configuration.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Reference model configuration.
    #[serde(default)]
    pub model: ModelConfig,
}

/// Container configuration.
#[derive(Debug, Deserialize)]
pub struct ContainerConfig {
    /// Number of model instances that may run concurrently.
    #[serde(default = "default_num_models")]
    pub num_models: usize,

    /// Device to run on (cpu, cuda, cuda:N, gpu).
    #[serde(default = "default_device")]
    pub device: String,

    /// Directory holding auxiliary device binaries.
    #[serde(default)]
    pub cubin_dir: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            num_models: default_num_models(),
            device: default_device(),
            cubin_dir: None,
        }
    }
}

/// Reference graph configuration.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Display name, used in logs and `info` output.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_input")]
    pub input: String,

    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_dtype")]
    pub dtype: DType,

    /// Maximum extent of every dimension.
    #[serde(default = "default_max_shape")]
    pub max_shape: Vec<i64>,

    #[serde(default = "default_scale")]
    pub scale: f32,

    #[serde(default)]
    pub bias: f32,

    /// Route one step through the proxy executor.
    #[serde(default)]
    pub extern_op: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            input: default_input(),
            output: default_output(),
            dtype: default_dtype(),
            max_shape: default_max_shape(),
            scale: default_scale(),
            bias: 0.0,
            extern_op: false,
        }
    }
}

fn default_num_models() -> usize {
    1
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_name() -> String {
    "affine".to_string()
}

fn default_input() -> String {
    "x".to_string()
}

fn default_output() -> String {
    "y".to_string()
}

fn default_dtype() -> DType {
    DType::F32
}

fn default_max_shape() -> Vec<i64> {
    vec![4, 4]
}

fn default_scale() -> f32 {
    1.0
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ContainerError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.container.num_models == 0 {
            return Err(ContainerError::config("container.num_models must be at least 1"));
        }
        self.container.device.parse::<ExecutionMode>()?;
        if self.model.max_shape.iter().any(|&d| d < 0) {
            return Err(ContainerError::config(
                "model.max_shape extents must be non-negative",
            ));
        }
        Ok(())
    }
}
