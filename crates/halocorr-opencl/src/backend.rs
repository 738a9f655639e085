//! [`ComputeBackend`] implementation over `opencl3`.

use crate::error::status;
use halocorr_core::{
    BufferAccess, BuildFailure, ComputeBackend, DeviceClass, DeviceInfo, FrameShape, KernelArgs,
    PlatformInfo, QueueConfig, RuntimeError, RuntimeResult,
};
use opencl3::command_queue::{
    CommandQueue, CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CL_QUEUE_PROFILING_ENABLE,
};
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::error_codes::{CL_DEVICE_NOT_FOUND, CL_INVALID_ARG_VALUE};
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{
    cl_command_queue_properties, cl_device_type, cl_event, cl_float, cl_int, CL_NON_BLOCKING,
};
use std::ptr;
use std::time::Duration;

/// `CL_PLATFORM_NOT_FOUND_KHR`, returned by the ICD loader when no platform is installed.
const PLATFORM_NOT_FOUND_KHR: cl_int = -1001;

macro_rules! cl_handle {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        pub struct $name($inner);

        // SAFETY: OpenCL 1.2+ guarantees thread safety for every API call
        // except clSetKernelArg, and the handle types here are opaque
        // reference-counted runtime objects. Kernels are only ever driven by
        // the single worker that owns their device.
        unsafe impl Send for $name {}
        // SAFETY: see above.
        unsafe impl Sync for $name {}

        impl $name {
            /// Underlying `opencl3` object.
            pub fn raw(&self) -> &$inner {
                &self.0
            }
        }
    };
}

cl_handle!(
    /// An OpenCL platform.
    ClPlatform(Platform)
);
cl_handle!(
    /// An OpenCL device.
    ClDevice(Device)
);
cl_handle!(
    /// A single-device OpenCL context.
    ClContext(Context)
);
cl_handle!(
    /// An OpenCL command queue.
    ClQueue(CommandQueue)
);
cl_handle!(
    /// A program built for one device.
    ClProgram(Program)
);
cl_handle!(
    /// The correlation entry point of a built program.
    ClKernel(Kernel)
);
cl_handle!(
    /// A device buffer of `f32` values.
    ClBuffer(Buffer<cl_float>)
);
cl_handle!(
    /// A command completion event.
    ClEvent(Event)
);

/// OpenCL compute runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClBackend;

impl OpenClBackend {
    pub fn new() -> Self {
        OpenClBackend
    }
}

fn device_type_bits(class: DeviceClass) -> cl_device_type {
    match class {
        DeviceClass::Gpu => CL_DEVICE_TYPE_GPU,
        DeviceClass::Cpu => CL_DEVICE_TYPE_CPU,
        DeviceClass::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
        DeviceClass::All => CL_DEVICE_TYPE_ALL,
    }
}

fn device_class(bits: cl_device_type) -> DeviceClass {
    if bits & CL_DEVICE_TYPE_GPU != 0 {
        DeviceClass::Gpu
    } else if bits & CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else {
        DeviceClass::Accelerator
    }
}

fn queue_properties(config: QueueConfig) -> cl_command_queue_properties {
    let mut properties = 0;
    if config.out_of_order {
        properties |= CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
    }
    if config.profiling {
        properties |= CL_QUEUE_PROFILING_ENABLE;
    }
    properties
}

fn memory_flags(access: BufferAccess) -> u64 {
    match access {
        BufferAccess::ReadOnly => CL_MEM_READ_ONLY,
        BufferAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        BufferAccess::ReadWrite => CL_MEM_READ_WRITE,
    }
}

/// Halo reach as the kernel's signed argument.
fn reach_arg(reach: u32) -> RuntimeResult<cl_int> {
    cl_int::try_from(reach).map_err(|_| RuntimeError::new("clSetKernelArg", CL_INVALID_ARG_VALUE))
}

fn wait_list(wait: &[&ClEvent]) -> Vec<cl_event> {
    wait.iter().map(|event| event.0.get()).collect()
}

impl ComputeBackend for OpenClBackend {
    type Platform = ClPlatform;
    type Device = ClDevice;
    type Context = ClContext;
    type Queue = ClQueue;
    type Program = ClProgram;
    type Kernel = ClKernel;
    type Buffer = ClBuffer;
    type Event = ClEvent;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn platforms(&self) -> RuntimeResult<Vec<ClPlatform>> {
        match get_platforms() {
            Ok(platforms) => Ok(platforms.into_iter().map(ClPlatform).collect()),
            // The ICD loader reports "no platforms" as an error status.
            Err(err) if err.0 == PLATFORM_NOT_FOUND_KHR => Ok(Vec::new()),
            Err(err) => Err(RuntimeError::new("clGetPlatformIDs", err.0)),
        }
    }

    fn platform_info(&self, platform: &ClPlatform) -> RuntimeResult<PlatformInfo> {
        Ok(PlatformInfo {
            name: platform.0.name().map_err(status("clGetPlatformInfo"))?,
            vendor: platform.0.vendor().map_err(status("clGetPlatformInfo"))?,
            version: platform.0.version().map_err(status("clGetPlatformInfo"))?,
        })
    }

    fn devices(&self, platform: &ClPlatform, class: DeviceClass) -> RuntimeResult<Vec<ClDevice>> {
        match platform.0.get_devices(device_type_bits(class)) {
            Ok(ids) => Ok(ids
                .into_iter()
                .map(|id| ClDevice(Device::new(id)))
                .collect()),
            Err(err) if err.0 == CL_DEVICE_NOT_FOUND => Ok(Vec::new()),
            Err(err) => Err(RuntimeError::new("clGetDeviceIDs", err.0)),
        }
    }

    fn device_info(&self, device: &ClDevice) -> RuntimeResult<DeviceInfo> {
        let info = status("clGetDeviceInfo");
        Ok(DeviceInfo {
            name: device.0.name().map_err(&info)?.trim().to_string(),
            vendor: device.0.vendor().map_err(&info)?.trim().to_string(),
            class: device_class(device.0.dev_type().map_err(&info)?),
            global_mem_size: device.0.global_mem_size().map_err(&info)?,
            max_alloc_size: device.0.max_mem_alloc_size().map_err(&info)?,
        })
    }

    fn create_context(&self, _platform: &ClPlatform, device: &ClDevice) -> RuntimeResult<ClContext> {
        Context::from_device(&device.0)
            .map(ClContext)
            .map_err(status("clCreateContext"))
    }

    fn create_queue(
        &self,
        context: &ClContext,
        _device: &ClDevice,
        config: QueueConfig,
    ) -> RuntimeResult<ClQueue> {
        // The context holds exactly one device, which is the queue's device.
        // create_default stays on the OpenCL 1.2 entry point.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context.0, queue_properties(config))
            .map_err(status("clCreateCommandQueue"))?;
        Ok(ClQueue(queue))
    }

    fn finish(&self, queue: &ClQueue) -> RuntimeResult<()> {
        queue.0.finish().map_err(status("clFinish"))
    }

    fn build_program(
        &self,
        context: &ClContext,
        _device: &ClDevice,
        source: &str,
        options: &str,
    ) -> Result<ClProgram, BuildFailure> {
        Program::create_and_build_from_source(&context.0, source, options)
            .map(ClProgram)
            .map_err(|log| BuildFailure { log })
    }

    fn create_kernel(&self, program: &ClProgram, entry_point: &str) -> RuntimeResult<ClKernel> {
        Kernel::create(&program.0, entry_point)
            .map(ClKernel)
            .map_err(status("clCreateKernel"))
    }

    fn create_buffer(
        &self,
        context: &ClContext,
        access: BufferAccess,
        len: usize,
    ) -> RuntimeResult<ClBuffer> {
        // SAFETY: no host pointer is supplied, so the runtime owns the storage.
        let buffer = unsafe {
            Buffer::<cl_float>::create(&context.0, memory_flags(access), len, ptr::null_mut())
        }
        .map_err(status("clCreateBuffer"))?;
        Ok(ClBuffer(buffer))
    }

    unsafe fn enqueue_write(
        &self,
        queue: &ClQueue,
        buffer: &mut ClBuffer,
        data: &[f32],
        wait: &[&ClEvent],
    ) -> RuntimeResult<ClEvent> {
        queue
            .0
            .enqueue_write_buffer(&mut buffer.0, CL_NON_BLOCKING, 0, data, &wait_list(wait))
            .map(ClEvent)
            .map_err(status("clEnqueueWriteBuffer"))
    }

    fn enqueue_kernel(
        &self,
        queue: &ClQueue,
        kernel: &ClKernel,
        args: KernelArgs<'_, ClBuffer>,
        frame: FrameShape,
        wait: &[&ClEvent],
    ) -> RuntimeResult<ClEvent> {
        let l0 = reach_arg(args.halo.l0)?;
        let r0 = reach_arg(args.halo.r0)?;
        let l1 = reach_arg(args.halo.l1)?;
        let r1 = reach_arg(args.halo.r1)?;

        // SAFETY: argument types and order match the `xcorr` signature
        // (three float buffers, four ints) and the buffers outlive the call.
        let event = unsafe {
            let mut exec = ExecuteKernel::new(&kernel.0);
            exec.set_arg(&args.source.0)
                .set_arg(&args.destination.0)
                .set_arg(&args.coefficients.0)
                .set_arg(&l0)
                .set_arg(&r0)
                .set_arg(&l1)
                .set_arg(&r1)
                .set_global_work_sizes(&[frame.width, frame.height]);
            for event in wait {
                exec.set_wait_event(&event.0);
            }
            exec.enqueue_nd_range(&queue.0)
        };
        event.map(ClEvent).map_err(status("clEnqueueNDRangeKernel"))
    }

    unsafe fn enqueue_read(
        &self,
        queue: &ClQueue,
        buffer: &ClBuffer,
        out: &mut [f32],
        wait: &[&ClEvent],
    ) -> RuntimeResult<ClEvent> {
        queue
            .0
            .enqueue_read_buffer(&buffer.0, CL_NON_BLOCKING, 0, out, &wait_list(wait))
            .map(ClEvent)
            .map_err(status("clEnqueueReadBuffer"))
    }

    fn event_duration(&self, event: &ClEvent) -> Option<Duration> {
        let start = event.0.profiling_command_start().ok()?;
        let end = event.0.profiling_command_end().ok()?;
        Some(Duration::from_nanos(end.saturating_sub(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_properties() {
        assert_eq!(queue_properties(QueueConfig::default()), 0);
        let both = queue_properties(QueueConfig {
            out_of_order: true,
            profiling: true,
        });
        assert_ne!(both & CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, 0);
        assert_ne!(both & CL_QUEUE_PROFILING_ENABLE, 0);
    }

    #[test]
    fn test_device_class_bits() {
        assert_eq!(device_class(CL_DEVICE_TYPE_GPU), DeviceClass::Gpu);
        assert_eq!(device_class(CL_DEVICE_TYPE_CPU), DeviceClass::Cpu);
        assert_eq!(device_class(CL_DEVICE_TYPE_ACCELERATOR), DeviceClass::Accelerator);
        assert_eq!(device_type_bits(DeviceClass::All), CL_DEVICE_TYPE_ALL);
    }

    #[test]
    fn test_reach_arg_rejects_truncation() {
        assert_eq!(reach_arg(3).unwrap(), 3);
        assert_eq!(reach_arg(i32::MAX as u32).unwrap(), i32::MAX);
        let err = reach_arg(i32::MAX as u32 + 1).unwrap_err();
        assert_eq!(err.call, "clSetKernelArg");
        assert_eq!(err.code, CL_INVALID_ARG_VALUE);
    }
}
