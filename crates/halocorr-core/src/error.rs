//! Error types for multi-device dispatch.
//!
//! Every call into a compute runtime yields a [`RuntimeError`] on failure.
//! The engine lifts those into [`Error`], whose [`ErrorClass`] decides at the
//! top level whether the run aborts and which exit code it reports.

use crate::types::{DeviceClass, DispatchStage, ResourceKind};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Result type alias for raw runtime calls.
pub type RuntimeResult<T> = core::result::Result<T, RuntimeError>;

/// A failed call into the compute runtime.
///
/// `code` is the runtime's own status value (an OpenCL `cl_int` for the
/// OpenCL backend); `call` names the entry point that returned it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed with status {code}")]
pub struct RuntimeError {
    pub call: &'static str,
    pub code: i32,
}

impl RuntimeError {
    pub fn new(call: &'static str, code: i32) -> Self {
        RuntimeError { call, code }
    }
}

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime reports no platforms at all.
    #[error("no compute platforms found")]
    NoPlatforms,

    /// No platform exposes a device of the requested class.
    #[error("no {class} devices found across {platforms} platform(s)")]
    NoDevices { class: DeviceClass, platforms: usize },

    /// Platform or device discovery call failed.
    #[error("device enumeration failed: {0}")]
    Enumeration(#[source] RuntimeError),

    /// Creating a context, queue, program, kernel or buffer failed.
    #[error("failed to create {resource} for device {device}: {source}")]
    ResourceCreation {
        resource: ResourceKind,
        device: String,
        #[source]
        source: RuntimeError,
    },

    /// Kernel source failed to compile for a device.
    #[error("kernel build failed for device {device}")]
    Build { device: String, log: String },

    /// A kernel was requested from a program that never compiled.
    #[error("invalid program for device {device}: cannot extract kernel `{entry_point}`")]
    InvalidProgram { device: String, entry_point: String },

    /// Every device was excluded before dispatch could begin.
    #[error("no usable devices remain ({excluded} excluded)")]
    NoUsableDevices { excluded: usize },

    /// A per-image device call failed.
    #[error("{stage} failed for image {index} on device {device}: {source}")]
    Dispatch {
        index: usize,
        device: String,
        stage: DispatchStage,
        #[source]
        source: RuntimeError,
    },

    /// A command queue failed to complete its outstanding work.
    #[error("command queue {queue} failed to drain: {source}")]
    Drain {
        queue: usize,
        #[source]
        source: RuntimeError,
    },

    /// Input data does not satisfy the engine's preconditions.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A file's byte count does not match the declared shape.
    #[error("size mismatch for {what}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error from tensor or configuration files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification driving the fatal/recoverable decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Enumeration,
    Resource,
    Compilation,
    Dispatch,
    Precondition,
    Io,
    Config,
}

impl ErrorClass {
    /// Stable process exit code for a fatal error of this class.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::Enumeration => 201,
            ErrorClass::Resource => 202,
            ErrorClass::Compilation => 203,
            ErrorClass::Dispatch => 204,
            ErrorClass::Precondition => 205,
            ErrorClass::Io => 206,
            ErrorClass::Config => 207,
        }
    }
}

impl Error {
    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a resource creation error.
    pub fn resource(resource: ResourceKind, device: impl Into<String>, source: RuntimeError) -> Self {
        Error::ResourceCreation {
            resource,
            device: device.into(),
            source,
        }
    }

    /// Create a byte-count mismatch error.
    pub fn size_mismatch(what: impl Into<String>, expected: u64, actual: u64) -> Self {
        Error::SizeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Classify the error against the dispatch taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NoPlatforms | Error::NoDevices { .. } | Error::Enumeration(_) => {
                ErrorClass::Enumeration
            }
            Error::ResourceCreation { .. } | Error::NoUsableDevices { .. } | Error::Drain { .. } => {
                ErrorClass::Resource
            }
            Error::Build { .. } | Error::InvalidProgram { .. } => ErrorClass::Compilation,
            Error::Dispatch { .. } => ErrorClass::Dispatch,
            Error::Precondition(_) | Error::SizeMismatch { .. } => ErrorClass::Precondition,
            Error::Io(_) => ErrorClass::Io,
            Error::Config(_) => ErrorClass::Config,
        }
    }

    /// Check whether the run may continue past this error.
    ///
    /// Per-image dispatch failures are recorded and skipped; per-device
    /// resource and build failures only exclude that device. Everything else
    /// is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Dispatch { .. } | Error::ResourceCreation { .. } | Error::Build { .. }
        )
    }

    /// Process exit code for this error when it terminates the run.
    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }

    /// Get error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Error::NoPlatforms => "no_platforms",
            Error::NoDevices { .. } => "no_devices",
            Error::Enumeration(_) => "enumeration",
            Error::ResourceCreation { .. } => "resource_creation",
            Error::Build { .. } => "build",
            Error::InvalidProgram { .. } => "invalid_program",
            Error::NoUsableDevices { .. } => "no_usable_devices",
            Error::Dispatch { .. } => "dispatch",
            Error::Drain { .. } => "drain",
            Error::Precondition(_) => "precondition",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::Config(_) => "config",
            Error::Io(_) => "io_error",
        }
    }

    /// Build log carried by a compilation failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Error::Build { log, .. } => Some(log),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let classes = [
            ErrorClass::Enumeration,
            ErrorClass::Resource,
            ErrorClass::Compilation,
            ErrorClass::Dispatch,
            ErrorClass::Precondition,
            ErrorClass::Io,
            ErrorClass::Config,
        ];
        let mut codes: Vec<u8> = classes.iter().map(|c| c.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert!(codes.iter().all(|&c| c >= 200));
    }

    #[test]
    fn test_classification() {
        let err = Error::NoDevices {
            class: DeviceClass::Gpu,
            platforms: 2,
        };
        assert_eq!(err.class(), ErrorClass::Enumeration);
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "no gpu devices found across 2 platform(s)");

        let err = Error::Dispatch {
            index: 3,
            device: "dev1".into(),
            stage: DispatchStage::CopyIn,
            source: RuntimeError::new("clEnqueueWriteBuffer", -5),
        };
        assert_eq!(err.class(), ErrorClass::Dispatch);
        assert!(err.is_recoverable());
        assert_eq!(err.exit_code(), 204);
    }

    #[test]
    fn test_build_log() {
        let err = Error::Build {
            device: "dev0".into(),
            log: "error: expected ';'".into(),
        };
        assert_eq!(err.build_log(), Some("error: expected ';'"));
        assert_eq!(err.class(), ErrorClass::Compilation);
        assert_eq!(Error::NoPlatforms.build_log(), None);
    }

    #[test]
    fn test_size_mismatch_is_precondition() {
        let err = Error::size_mismatch("images_in.dat", 64, 60);
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert_eq!(err.category(), "size_mismatch");
    }
}
