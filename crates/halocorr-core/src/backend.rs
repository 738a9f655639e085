//! Compute runtime abstraction.
//!
//! ## Object Hierarchy
//!
//! ```text
//! Platform ──owns──► Device ──1:1──► Context ──► Queue(s)
//!                                       │
//!                                       ├──► Program ──► Kernel
//!                                       └──► Buffer (source, destination, coefficients)
//! ```
//!
//! Handles release their runtime object when dropped. The engine controls
//! the drop order; backends only need to release one object per handle.

use crate::error::RuntimeResult;
use crate::types::{BufferAccess, DeviceClass, DeviceInfo, FrameShape, HaloExtents, PlatformInfo, QueueConfig};
use std::time::Duration;
use thiserror::Error;

/// Kernel compilation failure with the runtime's build log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("program build failed")]
pub struct BuildFailure {
    pub log: String,
}

/// Arguments of the correlation entry point, in kernel order:
/// `(src, dst, coeff, L0, R0, L1, R1)`.
pub struct KernelArgs<'a, B> {
    pub source: &'a B,
    pub destination: &'a B,
    pub coefficients: &'a B,
    pub halo: HaloExtents,
}

/// A vendor compute runtime.
///
/// Associated handle types must be shareable across the dispatcher's worker
/// threads; each device's queue, kernel and buffers are still only used by
/// the single worker that owns that device.
pub trait ComputeBackend: Send + Sync {
    type Platform: Send + Sync;
    type Device: Send + Sync;
    type Context: Send + Sync;
    type Queue: Send + Sync;
    type Program: Send + Sync;
    type Kernel: Send + Sync;
    type Buffer: Send + Sync;
    type Event: Send;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// All platforms the runtime exposes.
    fn platforms(&self) -> RuntimeResult<Vec<Self::Platform>>;

    fn platform_info(&self, platform: &Self::Platform) -> RuntimeResult<PlatformInfo>;

    /// Devices of `class` on `platform`. A platform without matching devices
    /// returns an empty list, not an error.
    fn devices(&self, platform: &Self::Platform, class: DeviceClass)
        -> RuntimeResult<Vec<Self::Device>>;

    fn device_info(&self, device: &Self::Device) -> RuntimeResult<DeviceInfo>;

    /// Create a context holding exactly one device.
    fn create_context(
        &self,
        platform: &Self::Platform,
        device: &Self::Device,
    ) -> RuntimeResult<Self::Context>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        config: QueueConfig,
    ) -> RuntimeResult<Self::Queue>;

    /// Block until every command enqueued on `queue` has completed.
    fn finish(&self, queue: &Self::Queue) -> RuntimeResult<()>;

    /// Compile `source` for one device.
    fn build_program(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        source: &str,
        options: &str,
    ) -> Result<Self::Program, BuildFailure>;

    /// Extract the named entry point from a built program.
    fn create_kernel(&self, program: &Self::Program, entry_point: &str)
        -> RuntimeResult<Self::Kernel>;

    /// Allocate an uninitialized buffer of `len` `f32` values.
    fn create_buffer(
        &self,
        context: &Self::Context,
        access: BufferAccess,
        len: usize,
    ) -> RuntimeResult<Self::Buffer>;

    /// Enqueue a host → device copy of `data` into `buffer`.
    ///
    /// # Safety
    /// The copy may still be reading `data` after this returns. The caller
    /// must keep `data` alive and unmodified until [`finish`](Self::finish)
    /// returns for `queue`.
    unsafe fn enqueue_write(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        data: &[f32],
        wait: &[&Self::Event],
    ) -> RuntimeResult<Self::Event>;

    /// Enqueue the correlation kernel over the whole frame.
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        args: KernelArgs<'_, Self::Buffer>,
        frame: FrameShape,
        wait: &[&Self::Event],
    ) -> RuntimeResult<Self::Event>;

    /// Enqueue a device → host copy of `buffer` into `out`.
    ///
    /// # Safety
    /// The copy may still be writing `out` after this returns. The caller
    /// must not read, move or free `out` until [`finish`](Self::finish)
    /// returns for `queue`.
    unsafe fn enqueue_read(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [f32],
        wait: &[&Self::Event],
    ) -> RuntimeResult<Self::Event>;

    /// Execution time of a completed command, when the queue was created
    /// with profiling enabled.
    fn event_duration(&self, event: &Self::Event) -> Option<Duration>;
}
