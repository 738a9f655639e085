//! OpenCL Backend for halocorr
//!
//! Implements [`halocorr_core::ComputeBackend`] on top of `opencl3`, so the
//! dispatch engine can drive every OpenCL device on the host.
//!
//! # Architecture
//!
//! ```text
//!   clGetPlatformIDs ─► clGetDeviceIDs ─► clCreateContext (one per device)
//!                                              │
//!        clCreateCommandQueue ◄────────────────┤
//!        clBuildProgram / clCreateKernel ◄─────┤
//!        clCreateBuffer ×3 ◄───────────────────┘
//!
//!   per image:  WriteBuffer ─► NDRangeKernel ─► ReadBuffer ─► clFinish
//! ```
//!
//! Commands are chained through events, so the same sequence is correct on
//! in-order and out-of-order queues.
//!
//! # Example
//!
//! ```no_run
//! use halocorr_core::DeviceClass;
//!
//! if halocorr_opencl::is_available() {
//!     for device in halocorr_opencl::probe_devices(DeviceClass::All) {
//!         println!("{}", device);
//!     }
//! }
//! ```

pub mod backend;
pub mod error;

pub use backend::{
    ClBuffer, ClContext, ClDevice, ClEvent, ClKernel, ClPlatform, ClProgram, ClQueue,
    OpenClBackend,
};
pub use error::status_name;

pub use halocorr_core::{XCORR_ENTRY_POINT, XCORR_KERNEL_SOURCE};

use halocorr_core::{ComputeBackend, DeviceClass, DeviceInfo};

/// Check if an OpenCL runtime with at least one platform is installed.
pub fn is_available() -> bool {
    OpenClBackend::new()
        .platforms()
        .map(|platforms| !platforms.is_empty())
        .unwrap_or(false)
}

/// Describe every device of `class` without creating contexts.
///
/// Returns an empty vec if no OpenCL runtime is installed (never errors).
pub fn probe_devices(class: DeviceClass) -> Vec<DeviceInfo> {
    let backend = OpenClBackend::new();
    let platforms = match backend.platforms() {
        Ok(platforms) => platforms,
        Err(err) => {
            tracing::debug!("OpenCL platform query failed: {}", err);
            return Vec::new();
        }
    };

    platforms
        .iter()
        .flat_map(|platform| backend.devices(platform, class).unwrap_or_default())
        .filter_map(|device| backend.device_info(&device).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_source_entry_point() {
        assert!(XCORR_KERNEL_SOURCE.contains("__kernel void xcorr("));
        assert!(XCORR_KERNEL_SOURCE.contains(XCORR_ENTRY_POINT));
    }

    #[test]
    fn test_probe_devices() {
        // Succeeds with or without an OpenCL runtime installed.
        for device in probe_devices(DeviceClass::All) {
            println!("{}", device);
        }
    }
}
