//! Engine configuration.

use halocorr_core::{DeviceClass, Error, QueueConfig, Result, XCORR_ENTRY_POINT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// What to do when a device cannot be brought up (context, queue, program,
/// kernel or buffer creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePolicy {
    /// First failure aborts engine construction.
    Strict,
    /// Drop the device and continue with the rest.
    #[default]
    ExcludeFailed,
}

/// What to do when one image fails during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePolicy {
    /// Stop every worker at its next claim and return the failure.
    Abort,
    /// Record the failure, zero the output slot and keep going.
    #[default]
    Record,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device class to enumerate.
    pub device_class: DeviceClass,
    /// Total command queues; `None` creates one per device.
    pub queues: Option<usize>,
    /// Queue creation flags.
    pub queue: QueueConfig,
    /// Kernel entry point name.
    pub entry_point: String,
    /// Options passed to the runtime compiler.
    pub build_options: String,
    pub device_policy: DevicePolicy,
    pub image_policy: ImagePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Gpu,
            queues: None,
            queue: QueueConfig::default(),
            entry_point: XCORR_ENTRY_POINT.to_string(),
            build_options: String::new(),
            device_policy: DevicePolicy::ExcludeFailed,
            image_policy: ImagePolicy::Record,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self).map_err(ConfigError::from)?)
    }

    /// Fail on the first device or image error instead of degrading.
    pub fn strict(mut self) -> Self {
        self.device_policy = DevicePolicy::Strict;
        self.image_policy = ImagePolicy::Abort;
        self
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.queues == Some(0) {
            return Err(ConfigError::Invalid {
                field: "queues",
                reason: "at least one command queue is required".into(),
            }
            .into());
        }
        if self.entry_point.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "entry_point",
                reason: "kernel entry point name is empty".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Number of queues to create for `devices` devices.
    pub fn queue_count(&self, devices: usize) -> usize {
        self.queues.unwrap_or(devices)
    }
}
