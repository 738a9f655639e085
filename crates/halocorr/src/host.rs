//! Host simulation backend.
//!
//! A [`ComputeBackend`] that runs the correlation on the calling thread,
//! with configurable platforms and devices. Each device can be given a
//! per-launch latency and deterministic faults (context, queue, build or
//! buffer creation; individual copy-in, kernel, copy-out and drain ordinals), so
//! the engine's scheduling and failure paths can be exercised without a
//! vendor runtime.
//!
//! The backend also keeps a ledger of released handles and of live device
//! memory, which tests use to check teardown order and buffer reuse.

use halocorr_core::{
    correlate_frame, BufferAccess, BuildFailure, ComputeBackend, DeviceClass, DeviceInfo,
    FrameShape, HaloKernel, KernelArgs, PlatformInfo, QueueConfig, RuntimeError, RuntimeResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

// Status values mirror the OpenCL codes so logs read the same on both backends.
const OUT_OF_HOST_MEMORY: i32 = -6;
const OUT_OF_RESOURCES: i32 = -5;
const ALLOCATION_FAILURE: i32 = -4;
const INVALID_VALUE: i32 = -30;
const INVALID_KERNEL_NAME: i32 = -46;
const INVALID_KERNEL_ARGS: i32 = -52;
const INVALID_BUFFER_SIZE: i32 = -61;

/// Simulated device description.
#[derive(Debug, Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub class: DeviceClass,
    pub global_mem_size: u64,
    pub max_alloc_size: u64,
    /// Time each kernel launch takes.
    pub latency: Duration,
    pub fail_context: bool,
    pub fail_queue: bool,
    pub fail_build: bool,
    pub fail_buffer: bool,
    /// Zero-based write ordinals (per device) that fail. Ordinal 0 is the
    /// coefficient upload.
    pub failing_writes: Vec<usize>,
    /// Zero-based kernel launch ordinals (per device) that fail.
    pub failing_kernels: Vec<usize>,
    /// Zero-based copy-out ordinals (per device) that fail.
    pub failing_reads: Vec<usize>,
    /// Zero-based queue drain ordinals (per device) that fail. Ordinal 0 is
    /// the drain after the coefficient upload.
    pub failing_finishes: Vec<usize>,
}

impl HostDeviceSpec {
    /// A healthy, zero-latency GPU-class device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: DeviceClass::Gpu,
            global_mem_size: 1 << 30,
            max_alloc_size: 256 << 20,
            latency: Duration::ZERO,
            fail_context: false,
            fail_queue: false,
            fail_build: false,
            fail_buffer: false,
            failing_writes: Vec::new(),
            failing_kernels: Vec::new(),
            failing_reads: Vec::new(),
            failing_finishes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_max_alloc(mut self, bytes: u64) -> Self {
        self.max_alloc_size = bytes;
        self
    }

    pub fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    pub fn failing_queue(mut self) -> Self {
        self.fail_queue = true;
        self
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn failing_buffer(mut self) -> Self {
        self.fail_buffer = true;
        self
    }

    pub fn failing_write(mut self, ordinal: usize) -> Self {
        self.failing_writes.push(ordinal);
        self
    }

    pub fn failing_kernel(mut self, ordinal: usize) -> Self {
        self.failing_kernels.push(ordinal);
        self
    }

    pub fn failing_read(mut self, ordinal: usize) -> Self {
        self.failing_reads.push(ordinal);
        self
    }

    pub fn failing_finish(mut self, ordinal: usize) -> Self {
        self.failing_finishes.push(ordinal);
        self
    }
}

/// Simulated platform description.
#[derive(Debug, Clone)]
pub struct HostPlatformSpec {
    pub info: PlatformInfo,
    pub devices: Vec<HostDeviceSpec>,
}

impl HostPlatformSpec {
    pub fn new(name: impl Into<String>, devices: Vec<HostDeviceSpec>) -> Self {
        Self {
            info: PlatformInfo {
                name: name.into(),
                vendor: "halocorr".to_string(),
                version: "host simulation 1.2".to_string(),
            },
            devices,
        }
    }
}

/// Kind of handle released, in teardown rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Released {
    Queue,
    Kernel,
    Program,
    Buffer,
    Context,
    Device,
    Platform,
}

#[derive(Debug, Default)]
struct Ledger {
    releases: Mutex<Vec<Released>>,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    contexts: AtomicUsize,
}

impl Ledger {
    fn release(&self, kind: Released) {
        self.releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(kind);
    }

    fn allocate(&self, bytes: usize) {
        let live = self.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::SeqCst);
    }
}

/// Appends to the ledger when the owning handle is dropped.
#[derive(Debug)]
struct ReleaseGuard {
    ledger: Arc<Ledger>,
    kind: Released,
}

impl ReleaseGuard {
    fn new(ledger: &Arc<Ledger>, kind: Released) -> Self {
        Self {
            ledger: Arc::clone(ledger),
            kind,
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.ledger.release(self.kind);
    }
}

#[derive(Debug)]
struct DeviceSim {
    ordinal: usize,
    spec: HostDeviceSpec,
    writes: AtomicUsize,
    launches: AtomicUsize,
    reads: AtomicUsize,
    finishes: AtomicUsize,
}

#[derive(Debug)]
struct PlatformSim {
    info: PlatformInfo,
    devices: Vec<Arc<DeviceSim>>,
}

/// Simulated platform handle.
#[derive(Debug)]
pub struct HostPlatform {
    sim: Arc<PlatformSim>,
    _guard: ReleaseGuard,
}

/// Simulated device handle.
#[derive(Debug)]
pub struct HostDevice {
    sim: Arc<DeviceSim>,
    _guard: ReleaseGuard,
}

impl HostDevice {
    /// Position of the device across all platforms, in enumeration order.
    pub fn ordinal(&self) -> usize {
        self.sim.ordinal
    }
}

#[derive(Debug)]
pub struct HostContext {
    device: Arc<DeviceSim>,
    _guard: ReleaseGuard,
}

#[derive(Debug)]
pub struct HostQueue {
    device: Arc<DeviceSim>,
    config: QueueConfig,
    _guard: ReleaseGuard,
}

#[derive(Debug)]
pub struct HostProgram {
    source: Arc<str>,
    _guard: ReleaseGuard,
}

#[derive(Debug)]
pub struct HostKernel {
    entry_point: String,
    _guard: ReleaseGuard,
}

/// Simulated device buffer.
#[derive(Debug)]
pub struct HostBuffer {
    data: Mutex<Vec<f32>>,
    ledger: Arc<Ledger>,
    _guard: ReleaseGuard,
}

impl HostBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<f32>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let bytes = self.len() * std::mem::size_of::<f32>();
        self.ledger.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Completed simulated command.
#[derive(Debug, Clone, Copy)]
pub struct HostEvent {
    elapsed: Duration,
    profiled: bool,
}

impl HostEvent {
    fn completed(started: Instant, queue: &HostQueue) -> Self {
        Self {
            elapsed: started.elapsed(),
            profiled: queue.config.profiling,
        }
    }
}

/// Compute runtime simulated on the host.
///
/// Clones share device counters and the release ledger, so a clone kept
/// outside an engine observes its teardown.
#[derive(Debug, Clone)]
pub struct HostBackend {
    platforms: Vec<Arc<PlatformSim>>,
    ledger: Arc<Ledger>,
}

impl HostBackend {
    pub fn new(platforms: Vec<HostPlatformSpec>) -> Self {
        let mut ordinal = 0;
        let platforms = platforms
            .into_iter()
            .map(|platform| {
                let devices = platform
                    .devices
                    .into_iter()
                    .map(|spec| {
                        let device = Arc::new(DeviceSim {
                            ordinal,
                            spec,
                            writes: AtomicUsize::new(0),
                            launches: AtomicUsize::new(0),
                            reads: AtomicUsize::new(0),
                            finishes: AtomicUsize::new(0),
                        });
                        ordinal += 1;
                        device
                    })
                    .collect();
                Arc::new(PlatformSim {
                    info: platform.info,
                    devices,
                })
            })
            .collect();

        Self {
            platforms,
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// One platform with `count` healthy GPU-class devices.
    pub fn with_devices(count: usize) -> Self {
        Self::with_specs(
            (0..count)
                .map(|i| HostDeviceSpec::new(format!("host-gpu{i}")))
                .collect(),
        )
    }

    /// One platform holding `devices`.
    pub fn with_specs(devices: Vec<HostDeviceSpec>) -> Self {
        Self::new(vec![HostPlatformSpec::new("halocorr host", devices)])
    }

    /// Handles released so far, in release order.
    pub fn releases(&self) -> Vec<Released> {
        self.ledger
            .releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes held by live buffers.
    pub fn live_buffer_bytes(&self) -> usize {
        self.ledger.live_bytes.load(Ordering::SeqCst)
    }

    /// High-water mark of [`live_buffer_bytes`](Self::live_buffer_bytes).
    pub fn peak_buffer_bytes(&self) -> usize {
        self.ledger.peak_bytes.load(Ordering::SeqCst)
    }

    /// Contexts created over the backend's lifetime.
    pub fn contexts_created(&self) -> usize {
        self.ledger.contexts.load(Ordering::SeqCst)
    }

    /// Kernel launches attempted on the device at `ordinal`.
    pub fn launches(&self, ordinal: usize) -> usize {
        self.platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .find(|d| d.ordinal == ordinal)
            .map_or(0, |d| d.launches.load(Ordering::SeqCst))
    }

    fn guard(&self, kind: Released) -> ReleaseGuard {
        ReleaseGuard::new(&self.ledger, kind)
    }
}

fn hits(ordinals: &[usize], counter: &AtomicUsize) -> bool {
    let n = counter.fetch_add(1, Ordering::SeqCst);
    ordinals.contains(&n)
}

impl ComputeBackend for HostBackend {
    type Platform = HostPlatform;
    type Device = HostDevice;
    type Context = HostContext;
    type Queue = HostQueue;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type Event = HostEvent;

    fn name(&self) -> &'static str {
        "host"
    }

    fn platforms(&self) -> RuntimeResult<Vec<HostPlatform>> {
        Ok(self
            .platforms
            .iter()
            .map(|sim| HostPlatform {
                sim: Arc::clone(sim),
                _guard: self.guard(Released::Platform),
            })
            .collect())
    }

    fn platform_info(&self, platform: &HostPlatform) -> RuntimeResult<PlatformInfo> {
        Ok(platform.sim.info.clone())
    }

    fn devices(&self, platform: &HostPlatform, class: DeviceClass) -> RuntimeResult<Vec<HostDevice>> {
        Ok(platform
            .sim
            .devices
            .iter()
            .filter(|d| class.matches(d.spec.class))
            .map(|sim| HostDevice {
                sim: Arc::clone(sim),
                _guard: self.guard(Released::Device),
            })
            .collect())
    }

    fn device_info(&self, device: &HostDevice) -> RuntimeResult<DeviceInfo> {
        let spec = &device.sim.spec;
        Ok(DeviceInfo {
            name: spec.name.clone(),
            vendor: "halocorr".to_string(),
            class: spec.class,
            global_mem_size: spec.global_mem_size,
            max_alloc_size: spec.max_alloc_size,
        })
    }

    fn create_context(&self, _platform: &HostPlatform, device: &HostDevice) -> RuntimeResult<HostContext> {
        if device.sim.spec.fail_context {
            return Err(RuntimeError::new("clCreateContext", OUT_OF_HOST_MEMORY));
        }
        self.ledger.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(HostContext {
            device: Arc::clone(&device.sim),
            _guard: self.guard(Released::Context),
        })
    }

    fn create_queue(
        &self,
        context: &HostContext,
        _device: &HostDevice,
        config: QueueConfig,
    ) -> RuntimeResult<HostQueue> {
        if context.device.spec.fail_queue {
            return Err(RuntimeError::new("clCreateCommandQueue", OUT_OF_RESOURCES));
        }
        Ok(HostQueue {
            device: Arc::clone(&context.device),
            config,
            _guard: self.guard(Released::Queue),
        })
    }

    fn finish(&self, queue: &HostQueue) -> RuntimeResult<()> {
        // Commands complete before enqueue returns; only injected faults fail.
        if hits(&queue.device.spec.failing_finishes, &queue.device.finishes) {
            return Err(RuntimeError::new("clFinish", OUT_OF_RESOURCES));
        }
        Ok(())
    }

    fn build_program(
        &self,
        context: &HostContext,
        _device: &HostDevice,
        source: &str,
        _options: &str,
    ) -> Result<HostProgram, BuildFailure> {
        let spec = &context.device.spec;
        if spec.fail_build {
            return Err(BuildFailure {
                log: format!("<kernel>:1:1: error: program rejected by {}", spec.name),
            });
        }
        if source.trim().is_empty() {
            return Err(BuildFailure {
                log: "<kernel>: error: empty program source".to_string(),
            });
        }
        Ok(HostProgram {
            source: Arc::from(source),
            _guard: self.guard(Released::Program),
        })
    }

    fn create_kernel(&self, program: &HostProgram, entry_point: &str) -> RuntimeResult<HostKernel> {
        if entry_point.is_empty() || !program.source.contains(entry_point) {
            return Err(RuntimeError::new("clCreateKernel", INVALID_KERNEL_NAME));
        }
        Ok(HostKernel {
            entry_point: entry_point.to_string(),
            _guard: self.guard(Released::Kernel),
        })
    }

    fn create_buffer(
        &self,
        context: &HostContext,
        _access: BufferAccess,
        len: usize,
    ) -> RuntimeResult<HostBuffer> {
        let spec = &context.device.spec;
        let bytes = len * std::mem::size_of::<f32>();
        if spec.fail_buffer {
            return Err(RuntimeError::new("clCreateBuffer", ALLOCATION_FAILURE));
        }
        if len == 0 || bytes as u64 > spec.max_alloc_size {
            return Err(RuntimeError::new("clCreateBuffer", INVALID_BUFFER_SIZE));
        }
        self.ledger.allocate(bytes);
        Ok(HostBuffer {
            data: Mutex::new(vec![0.0; len]),
            ledger: Arc::clone(&self.ledger),
            _guard: self.guard(Released::Buffer),
        })
    }

    unsafe fn enqueue_write(
        &self,
        queue: &HostQueue,
        buffer: &mut HostBuffer,
        data: &[f32],
        _wait: &[&HostEvent],
    ) -> RuntimeResult<HostEvent> {
        let started = Instant::now();
        if hits(&queue.device.spec.failing_writes, &queue.device.writes) {
            return Err(RuntimeError::new("clEnqueueWriteBuffer", OUT_OF_RESOURCES));
        }
        let mut storage = buffer.lock();
        let target = storage
            .get_mut(..data.len())
            .ok_or(RuntimeError::new("clEnqueueWriteBuffer", INVALID_VALUE))?;
        target.copy_from_slice(data);
        Ok(HostEvent::completed(started, queue))
    }

    fn enqueue_kernel(
        &self,
        queue: &HostQueue,
        kernel: &HostKernel,
        args: KernelArgs<'_, HostBuffer>,
        frame: FrameShape,
        _wait: &[&HostEvent],
    ) -> RuntimeResult<HostEvent> {
        let started = Instant::now();
        let device = &queue.device;
        if hits(&device.spec.failing_kernels, &device.launches) {
            return Err(RuntimeError::new("clEnqueueNDRangeKernel", OUT_OF_RESOURCES));
        }
        if !device.spec.latency.is_zero() {
            thread::sleep(device.spec.latency);
        }

        let invalid_args = || RuntimeError::new("clEnqueueNDRangeKernel", INVALID_KERNEL_ARGS);
        let coefficients = args.coefficients.lock().clone();
        let halo = HaloKernel::new(args.halo, coefficients).map_err(|_| invalid_args())?;
        let input = args.source.lock().clone();
        let mut output = args.destination.lock();
        if input.len() < frame.len() || output.len() < frame.len() {
            return Err(invalid_args());
        }

        trace!("{} on {} over {}", kernel.entry_point, device.spec.name, frame);
        correlate_frame(
            &input[..frame.len()],
            &mut output[..frame.len()],
            frame,
            &halo,
        );
        Ok(HostEvent::completed(started, queue))
    }

    unsafe fn enqueue_read(
        &self,
        queue: &HostQueue,
        buffer: &HostBuffer,
        out: &mut [f32],
        _wait: &[&HostEvent],
    ) -> RuntimeResult<HostEvent> {
        let started = Instant::now();
        if hits(&queue.device.spec.failing_reads, &queue.device.reads) {
            return Err(RuntimeError::new("clEnqueueReadBuffer", OUT_OF_RESOURCES));
        }
        let storage = buffer.lock();
        let source = storage
            .get(..out.len())
            .ok_or(RuntimeError::new("clEnqueueReadBuffer", INVALID_VALUE))?;
        out.copy_from_slice(source);
        Ok(HostEvent::completed(started, queue))
    }

    fn event_duration(&self, event: &HostEvent) -> Option<Duration> {
        event.profiled.then_some(event.elapsed)
    }
}
