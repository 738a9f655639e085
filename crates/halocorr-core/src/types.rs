//! Core type definitions shared by the engine and the runtime backends.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class of compute device to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Discrete or integrated GPUs.
    #[default]
    Gpu,
    /// Host-class CPU devices.
    Cpu,
    /// Dedicated accelerators (FPGAs, DSPs, ...).
    Accelerator,
    /// Every device regardless of class.
    All,
}

impl DeviceClass {
    /// Get class name as string.
    pub fn name(self) -> &'static str {
        match self {
            DeviceClass::Gpu => "gpu",
            DeviceClass::Cpu => "cpu",
            DeviceClass::Accelerator => "accelerator",
            DeviceClass::All => "all",
        }
    }

    /// Check whether a device of class `other` satisfies this selector.
    pub fn matches(self, other: DeviceClass) -> bool {
        self == DeviceClass::All || self == other
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceClass::Gpu),
            "cpu" => Ok(DeviceClass::Cpu),
            "accelerator" | "acc" => Ok(DeviceClass::Accelerator),
            "all" => Ok(DeviceClass::All),
            other => Err(Error::config(format!(
                "unknown device class `{other}` (expected gpu, cpu, accelerator or all)"
            ))),
        }
    }
}

/// Command queue creation flags, fixed for the queue's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Allow the runtime to execute enqueued commands out of order.
    pub out_of_order: bool,
    /// Record start/end timestamps for every command.
    pub profiling: bool,
}

/// Dimensions of one 2-D image frame (row-major).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Rows (axis 0).
    pub height: usize,
    /// Columns (axis 1).
    pub width: usize,
}

impl FrameShape {
    pub fn new(height: usize, width: usize) -> Self {
        FrameShape { height, width }
    }

    /// Number of pixels in one frame.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    /// Check if the frame has no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one frame in bytes.
    pub fn bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.height, self.width)
    }
}

/// Asymmetric halo extents: left/right reach along axis 0 and axis 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HaloExtents {
    pub l0: u32,
    pub r0: u32,
    pub l1: u32,
    pub r1: u32,
}

impl HaloExtents {
    /// Largest reach on any side; kernels take the extents as signed 32-bit
    /// arguments.
    pub const MAX_REACH: u32 = i32::MAX as u32;

    pub fn new(l0: u32, r0: u32, l1: u32, r1: u32) -> Self {
        HaloExtents { l0, r0, l1, r1 }
    }

    /// Same reach on every side.
    pub fn uniform(reach: u32) -> Self {
        HaloExtents::new(reach, reach, reach, reach)
    }

    /// Coefficient rows: L0 + R0 + 1.
    pub fn rows(&self) -> usize {
        (self.l0 as usize).saturating_add(self.r0 as usize).saturating_add(1)
    }

    /// Coefficient columns: L1 + R1 + 1.
    pub fn cols(&self) -> usize {
        (self.l1 as usize).saturating_add(self.r1 as usize).saturating_add(1)
    }

    /// Number of coefficients in the window.
    pub fn footprint(&self) -> usize {
        self.rows().saturating_mul(self.cols())
    }

    /// Check every side against [`MAX_REACH`](Self::MAX_REACH).
    pub fn validate(&self) -> Result<()> {
        let widest = self.l0.max(self.r0).max(self.l1).max(self.r1);
        if widest > Self::MAX_REACH {
            return Err(Error::precondition(format!(
                "halo extents {} exceed the maximum reach of {}",
                self,
                Self::MAX_REACH
            )));
        }
        Ok(())
    }
}

impl fmt::Display for HaloExtents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.l0, self.r0, self.l1, self.r1)
    }
}

impl FromStr for HaloExtents {
    type Err = Error;

    /// Parse `L0,R0,L1,R1`.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<core::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(format!("invalid halo extents `{s}`: {e}")))?;
        match parts.as_slice() {
            [l0, r0, l1, r1] => {
                let extents = HaloExtents::new(*l0, *r0, *l1, *r1);
                extents.validate()?;
                Ok(extents)
            }
            _ => Err(Error::config(format!(
                "halo extents `{s}` must have four values L0,R0,L1,R1"
            ))),
        }
    }
}

/// Coefficient window of a halo cross-correlation.
///
/// Row-major `(L0+R0+1) × (L1+R1+1)` array; entry `[L0][L1]` is the centre.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloKernel {
    extents: HaloExtents,
    coefficients: Vec<f32>,
}

impl HaloKernel {
    /// Create a kernel, checking the coefficient count against the extents.
    pub fn new(extents: HaloExtents, coefficients: Vec<f32>) -> Result<Self> {
        extents.validate()?;
        if coefficients.len() != extents.footprint() {
            return Err(Error::precondition(format!(
                "halo kernel {} needs {} coefficients, got {}",
                extents,
                extents.footprint(),
                coefficients.len()
            )));
        }
        Ok(HaloKernel {
            extents,
            coefficients,
        })
    }

    /// All-zero window with a unit centre.
    pub fn identity(extents: HaloExtents) -> Self {
        let mut coefficients = vec![0.0; extents.footprint()];
        coefficients[extents.l0 as usize * extents.cols() + extents.l1 as usize] = 1.0;
        HaloKernel {
            extents,
            coefficients,
        }
    }

    pub fn extents(&self) -> HaloExtents {
        self.extents
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }

    /// Coefficient at window offset `(k0, k1)` relative to the centre.
    pub fn at(&self, k0: i64, k1: i64) -> f32 {
        let row = (k0 + self.extents.l0 as i64) as usize;
        let col = (k1 + self.extents.l1 as i64) as usize;
        self.coefficients[row * self.extents.cols() + col]
    }
}

/// Ordered batch of equally sized frames, stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    frame: FrameShape,
    data: Vec<f32>,
}

impl ImageBatch {
    /// Wrap `data` as a batch of `frame`-sized images.
    ///
    /// Rejects empty frames, empty batches and data that is not a whole
    /// number of frames.
    pub fn new(frame: FrameShape, data: Vec<f32>) -> Result<Self> {
        if frame.is_empty() {
            return Err(Error::precondition(format!("frame shape {frame} has no pixels")));
        }
        if data.is_empty() {
            return Err(Error::precondition("image batch is empty"));
        }
        if data.len() % frame.len() != 0 {
            return Err(Error::precondition(format!(
                "batch of {} values is not a whole number of {} frames",
                data.len(),
                frame
            )));
        }
        Ok(ImageBatch { frame, data })
    }

    /// Zero-filled batch of `count` frames.
    pub fn zeros(frame: FrameShape, count: usize) -> Result<Self> {
        ImageBatch::new(frame, vec![0.0; frame.len() * count])
    }

    pub fn frame(&self) -> FrameShape {
        self.frame
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.data.len() / self.frame.len()
    }

    /// Check if the batch has no images.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pixels of image `index`.
    pub fn image(&self, index: usize) -> &[f32] {
        let n = self.frame.len();
        &self.data[index * n..(index + 1) * n]
    }

    /// Mutable pixels of image `index`.
    pub fn image_mut(&mut self, index: usize) -> &mut [f32] {
        let n = self.frame.len();
        &mut self.data[index * n..(index + 1) * n]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Access mode of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Kind of runtime resource, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Context => "context",
            ResourceKind::Queue => "command queue",
            ResourceKind::Program => "program",
            ResourceKind::Kernel => "kernel",
            ResourceKind::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

/// Step of the per-image copy-in → execute → copy-out sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    CopyIn,
    Execute,
    CopyOut,
    Synchronize,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchStage::CopyIn => "copy-in",
            DispatchStage::Execute => "kernel execution",
            DispatchStage::CopyOut => "copy-out",
            DispatchStage::Synchronize => "queue synchronization",
        };
        f.write_str(name)
    }
}

/// Descriptive information about a platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, vendor: {}, version {}", self.name, self.vendor, self.version)
    }
}

/// Descriptive information about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    /// Global memory in bytes.
    pub global_mem_size: u64,
    /// Largest single allocation in bytes.
    pub max_alloc_size: u64,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, {} MB global, {} MB max buffer)",
            self.name,
            self.vendor,
            self.class,
            self.global_mem_size / 1_000_000,
            self.max_alloc_size / 1_000_000,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_class_parse() {
        assert_eq!("GPU".parse::<DeviceClass>().unwrap(), DeviceClass::Gpu);
        assert_eq!(" cpu ".parse::<DeviceClass>().unwrap(), DeviceClass::Cpu);
        assert_eq!("acc".parse::<DeviceClass>().unwrap(), DeviceClass::Accelerator);
        assert!("tpu".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn test_device_class_matches() {
        assert!(DeviceClass::All.matches(DeviceClass::Cpu));
        assert!(DeviceClass::Gpu.matches(DeviceClass::Gpu));
        assert!(!DeviceClass::Gpu.matches(DeviceClass::Cpu));
    }

    #[test]
    fn test_halo_extents() {
        let halo: HaloExtents = "1,2,0,3".parse().unwrap();
        assert_eq!(halo, HaloExtents::new(1, 2, 0, 3));
        assert_eq!(halo.rows(), 4);
        assert_eq!(halo.cols(), 4);
        assert_eq!(halo.footprint(), 16);
        assert!("1,2,3".parse::<HaloExtents>().is_err());
        assert!("a,b,c,d".parse::<HaloExtents>().is_err());
    }

    #[test]
    fn test_halo_extents_beyond_max_reach() {
        let err = "4294967295,0,0,0".parse::<HaloExtents>().unwrap_err();
        assert_eq!(err.exit_code(), 205);
        assert!("0,0,0,2147483648".parse::<HaloExtents>().is_err());
        assert!("2147483647,0,0,0".parse::<HaloExtents>().is_ok());

        // Widths are computed without wrapping.
        let widest = HaloExtents::new(u32::MAX, u32::MAX, 0, 0);
        assert_eq!(widest.rows(), 2 * u32::MAX as usize + 1);
        assert_eq!(widest.cols(), 1);
        assert!(widest.validate().is_err());
        assert_eq!(HaloExtents::uniform(u32::MAX).footprint(), usize::MAX);

        let err = HaloKernel::new(widest, vec![0.0; 9]).unwrap_err();
        assert_eq!(err.exit_code(), 205);
    }

    #[test]
    fn test_identity_kernel_centre() {
        let kernel = HaloKernel::identity(HaloExtents::new(1, 0, 2, 1));
        assert_eq!(kernel.at(0, 0), 1.0);
        assert_eq!(kernel.coefficients().iter().sum::<f32>(), 1.0);
        assert_eq!(kernel.coefficients()[kernel.extents().cols() + 2], 1.0);
    }

    #[test]
    fn test_halo_kernel_rejects_wrong_count() {
        assert!(HaloKernel::new(HaloExtents::uniform(1), vec![0.0; 8]).is_err());
        assert!(HaloKernel::new(HaloExtents::uniform(1), vec![0.0; 9]).is_ok());
    }

    #[test]
    fn test_image_batch_validation() {
        let frame = FrameShape::new(4, 4);
        assert!(ImageBatch::new(frame, vec![]).is_err());
        assert!(ImageBatch::new(frame, vec![0.0; 17]).is_err());
        assert!(ImageBatch::new(FrameShape::new(0, 4), vec![0.0; 4]).is_err());

        let mut batch = ImageBatch::new(frame, (0..48).map(|v| v as f32).collect()).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.image(2)[0], 32.0);
        batch.image_mut(1)[0] = -1.0;
        assert_eq!(batch.as_slice()[16], -1.0);
    }

    #[test]
    fn test_frame_bytes() {
        let frame = FrameShape::new(1024, 1024);
        assert_eq!(frame.bytes(), 4 * 1024 * 1024);
        assert_eq!(frame.to_string(), "1024×1024");
    }
}
