//! # halocorr Core
//!
//! Shared types, the error taxonomy, and the compute runtime abstraction for
//! the halocorr multi-device cross-correlation engine.
//!
//! The engine never talks to a vendor runtime directly. Everything it needs
//! from platforms, devices, contexts, queues, programs, kernels and buffers is
//! expressed by the [`ComputeBackend`] trait, implemented once over OpenCL
//! (`halocorr-opencl`) and once as a deterministic host simulation.
//!
//! ## Core Types
//!
//! - [`FrameShape`] - Height/width of one image in the batch
//! - [`HaloExtents`] / [`HaloKernel`] - Asymmetric correlation window
//! - [`ImageBatch`] - Row-major batch of equally sized frames
//! - [`DeviceClass`] / [`QueueConfig`] - Enumeration and queue options
//!
//! ## Example
//!
//! ```
//! use halocorr_core::{correlate_frame, FrameShape, HaloKernel, HaloExtents};
//!
//! let frame = FrameShape::new(2, 2);
//! let halo = HaloKernel::identity(HaloExtents::uniform(1));
//! let input = [1.0, 2.0, 3.0, 4.0];
//! let mut output = [0.0; 4];
//! correlate_frame(&input, &mut output, frame, &halo);
//! assert_eq!(input, output);
//! ```

pub mod backend;
pub mod error;
pub mod reference;
pub mod types;

pub use backend::{BuildFailure, ComputeBackend, KernelArgs};
pub use error::{Error, ErrorClass, Result, RuntimeError, RuntimeResult};
pub use reference::{correlate_batch, correlate_frame};
pub use types::{
    BufferAccess, DeviceClass, DeviceInfo, DispatchStage, FrameShape, HaloExtents, HaloKernel,
    ImageBatch, PlatformInfo, QueueConfig, ResourceKind,
};

/// Default correlation kernel source (OpenCL C).
///
/// Entry point [`XCORR_ENTRY_POINT`] with arguments
/// `(src, dst, coeff, L0, R0, L1, R1)` over a `width × height` global range.
pub const XCORR_KERNEL_SOURCE: &str = include_str!("../kernels/xcorr.cl");

/// Entry point name in [`XCORR_KERNEL_SOURCE`].
pub const XCORR_ENTRY_POINT: &str = "xcorr";
