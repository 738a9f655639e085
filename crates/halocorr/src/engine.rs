//! Engine façade: phase construction, dispatch and teardown.

use crate::buffers::{BufferManager, BufferStats};
use crate::config::EngineConfig;
use crate::dispatch::{CancelToken, DispatchReport, Dispatcher, Lane};
use crate::enumerate::{DeviceId, DeviceReport, Topology};
use crate::program::ProgramSet;
use crate::queues::QueuePool;
use halocorr_core::{
    ComputeBackend, Error, FrameShape, HaloKernel, ImageBatch, Result, XCORR_KERNEL_SOURCE,
};
use tracing::{info, warn};

/// Builder for [`Engine`].
pub struct EngineBuilder<B: ComputeBackend> {
    backend: B,
    config: EngineConfig,
    source: Option<String>,
    frame: Option<FrameShape>,
    halo: Option<HaloKernel>,
}

impl<B: ComputeBackend> EngineBuilder<B> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Kernel source text. Defaults to the embedded `xcorr` kernel.
    pub fn kernel_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Shape of every image the engine will process.
    pub fn frame(mut self, frame: FrameShape) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Coefficient window, uploaded once to every device.
    pub fn halo(mut self, halo: HaloKernel) -> Self {
        self.halo = Some(halo);
        self
    }

    /// Bring up every phase: enumerate, queues, programs, buffers.
    ///
    /// If a phase fails, everything the earlier phases created is released
    /// in teardown order before the error is returned.
    pub fn build(self) -> Result<Engine<B>> {
        let EngineBuilder {
            backend,
            config,
            source,
            frame,
            halo,
        } = self;

        config.validate()?;
        let frame = frame.ok_or_else(|| Error::config("frame shape is not set"))?;
        let halo = halo.ok_or_else(|| Error::config("halo kernel is not set"))?;
        if frame.is_empty() {
            return Err(Error::precondition(format!("frame shape {frame} has no pixels")));
        }
        halo.extents().validate()?;
        let source = source.unwrap_or_else(|| XCORR_KERNEL_SOURCE.to_string());

        info!(
            "halocorr engine: backend={}, class={}, frame={}, halo={}",
            backend.name(),
            config.device_class,
            frame,
            halo.extents()
        );

        let topology = Topology::discover(&backend, config.device_class, config.device_policy)?;
        let queues = QueuePool::create(
            &backend,
            &topology,
            config.queue_count(topology.len()),
            config.queue,
        )?;

        // From here on a failed phase drops the half-built engine, which
        // drains the queues before releasing anything they could reference.
        let mut engine = Engine {
            queues,
            programs: ProgramSet::new(&config.entry_point),
            buffers: BufferManager::new(),
            topology,
            backend,
            config,
            frame,
            halo,
            cancel: CancelToken::new(),
            released: false,
        };
        engine.programs.compile(
            &engine.backend,
            &engine.topology,
            &source,
            &engine.config.build_options,
            engine.config.device_policy,
        )?;
        engine.buffers.provision(
            &engine.backend,
            &engine.topology,
            &engine.queues,
            &engine.programs,
            engine.frame,
            &engine.halo,
            engine.config.device_policy,
        )?;

        info!(
            "{} of {} device(s) ready for dispatch",
            engine.active_devices().len(),
            engine.topology.len()
        );
        Ok(engine)
    }
}

/// Multi-device correlation engine.
///
/// Owns every runtime object from enumeration to teardown. Dispatch can be
/// repeated over any number of batches of the configured frame shape;
/// buffers are reused between them.
pub struct Engine<B: ComputeBackend> {
    queues: QueuePool<B>,
    programs: ProgramSet<B>,
    buffers: BufferManager<B>,
    topology: Topology<B>,
    backend: B,
    config: EngineConfig,
    frame: FrameShape,
    halo: HaloKernel,
    cancel: CancelToken,
    released: bool,
}

impl<B: ComputeBackend> Engine<B> {
    pub fn builder(backend: B) -> EngineBuilder<B> {
        EngineBuilder {
            backend,
            config: EngineConfig::default(),
            source: None,
            frame: None,
            halo: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn frame(&self) -> FrameShape {
        self.frame
    }

    pub fn halo(&self) -> &HaloKernel {
        &self.halo
    }

    pub fn topology(&self) -> &Topology<B> {
        &self.topology
    }

    pub fn device_reports(&self) -> Vec<DeviceReport> {
        self.topology.reports()
    }

    /// Devices that get a worker during dispatch.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.buffers.devices()
    }

    /// Build log of a device excluded at compile time.
    pub fn build_log(&self, device: DeviceId) -> Option<&str> {
        self.programs.build_log(device)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffers.stats()
    }

    /// Token that stops the current or next dispatch at its next claim.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Correlate every image of `input`.
    ///
    /// Returns the output batch (failed and skipped slots are zero) with the
    /// dispatch report.
    pub fn run(&mut self, input: &ImageBatch) -> Result<(ImageBatch, DispatchReport)> {
        let mut output = ImageBatch::zeros(self.frame, input.len())?;
        let report = self.run_into(input, &mut output)?;
        Ok((output, report))
    }

    /// Correlate every image of `input` into the matching slot of `output`.
    pub fn run_into(&mut self, input: &ImageBatch, output: &mut ImageBatch) -> Result<DispatchReport> {
        if self.released {
            return Err(Error::precondition("engine has been torn down"));
        }
        if input.frame() != self.frame {
            return Err(Error::precondition(format!(
                "batch frame {} does not match engine frame {}",
                input.frame(),
                self.frame
            )));
        }

        let topology = &self.topology;
        let queues = &self.queues;
        let programs = &self.programs;
        let mut lanes = Vec::new();
        for (device, buffers) in self.buffers.iter_mut() {
            let queue = queues
                .primary(device)
                .ok_or_else(|| Error::precondition(format!("{device} has buffers but no queue")))?;
            lanes.push(Lane {
                device,
                label: topology.device(device).label(),
                queue,
                kernel: programs.kernel(topology, device)?,
                buffers,
            });
        }

        Dispatcher {
            backend: &self.backend,
            lanes,
            halo: self.halo.extents(),
            policy: self.config.image_policy,
            profiling: self.config.queue.profiling,
            cancel: &self.cancel,
        }
        .run(input, output)
    }

    /// Release every runtime object: queues (drained first), kernels,
    /// programs, buffers, contexts, then devices and platforms.
    ///
    /// Returns the first queue drain error. Dropping the engine does the same
    /// and logs the error instead.
    pub fn teardown(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let drained = self.queues.release(&self.backend);
        self.programs.release();
        self.buffers.release();
        self.topology.release_contexts();
        self.topology.release_registries();
        info!("engine torn down");
        drained
    }
}

impl<B: ComputeBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("teardown: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicePolicy;
    use crate::host::{HostBackend, HostDeviceSpec, Released};
    use halocorr_core::{correlate_batch, DeviceClass, HaloExtents};

    fn batch(frame: FrameShape, count: usize) -> ImageBatch {
        let data = (0..frame.len() * count).map(|v| (v % 17) as f32 - 8.0).collect();
        ImageBatch::new(frame, data).unwrap()
    }

    #[test]
    fn test_missing_builder_fields() {
        let err = Engine::builder(HostBackend::with_devices(1))
            .halo(HaloKernel::identity(HaloExtents::uniform(1)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_run_matches_reference() {
        let frame = FrameShape::new(6, 5);
        let halo = HaloKernel::new(
            HaloExtents::new(1, 0, 2, 1),
            (0..8).map(|v| v as f32 * 0.25).collect(),
        )
        .unwrap();
        let mut engine = Engine::builder(HostBackend::with_devices(2))
            .frame(frame)
            .halo(halo.clone())
            .build()
            .unwrap();

        let input = batch(frame, 5);
        let (output, report) = engine.run(&input).unwrap();
        assert!(report.is_complete());

        let mut expected = vec![0.0; input.as_slice().len()];
        correlate_batch(input.as_slice(), &mut expected, frame, &halo);
        assert_eq!(output.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_frame_mismatch_is_precondition() {
        let mut engine = Engine::builder(HostBackend::with_devices(1))
            .frame(FrameShape::new(4, 4))
            .halo(HaloKernel::identity(HaloExtents::uniform(1)))
            .build()
            .unwrap();
        let err = engine.run(&batch(FrameShape::new(4, 5), 1)).err().unwrap();
        assert_eq!(err.exit_code(), 205);
    }

    #[test]
    fn test_failed_build_phase_releases_queues() {
        let backend = HostBackend::with_devices(2);
        let observer = backend.clone();
        let config = EngineConfig {
            device_policy: DevicePolicy::Strict,
            entry_point: "missing".into(),
            ..EngineConfig::default()
        };
        let err = Engine::builder(backend)
            .config(config)
            .frame(FrameShape::new(2, 2))
            .halo(HaloKernel::identity(HaloExtents::uniform(0)))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 202);

        // The program that lacks the entry point goes after the queues.
        let releases = observer.releases();
        assert!(releases.windows(2).all(|w| w[0] <= w[1]), "{releases:?}");
        assert_eq!(
            &releases[..3],
            &[Released::Queue, Released::Queue, Released::Program]
        );
    }

    #[test]
    fn test_teardown_twice_is_harmless() {
        let mut engine = Engine::builder(HostBackend::with_specs(vec![
            HostDeviceSpec::new("a").with_class(DeviceClass::Cpu)
        ]))
        .config(EngineConfig {
            device_class: DeviceClass::Cpu,
            ..EngineConfig::default()
        })
        .frame(FrameShape::new(3, 3))
        .halo(HaloKernel::identity(HaloExtents::uniform(1)))
        .build()
        .unwrap();

        engine.release().unwrap();
        engine.release().unwrap();
        let releases = engine.backend().releases();
        assert_eq!(releases.first(), Some(&Released::Queue));
        assert_eq!(releases.last(), Some(&Released::Platform));
        assert!(engine.run(&batch(FrameShape::new(3, 3), 1)).is_err());
    }
}
