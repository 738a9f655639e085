//! Per-device buffer provisioning.
//!
//! Each usable device gets one [`DeviceBufferSet`], allocated before
//! dispatch and reused for every image that device processes:
//!
//! ```text
//! ┌──────────────────────────── device N ────────────────────────────┐
//! │  source       frame (height × width f32)   rewritten per image   │
//! │  destination  frame (height × width f32)   read back per image   │
//! │  coefficients (L0+R0+1) × (L1+R1+1) f32    uploaded once         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Device memory therefore grows with the device count, never with the
//! batch size.

use crate::config::DevicePolicy;
use crate::enumerate::{DeviceEntry, DeviceId, Topology};
use crate::program::ProgramSet;
use crate::queues::QueuePool;
use halocorr_core::{
    BufferAccess, ComputeBackend, Error, FrameShape, HaloKernel, ResourceKind, Result,
    RuntimeError,
};
use std::fmt;
use tracing::{debug, info, warn};

/// Source, destination and coefficient buffers of one device.
pub struct DeviceBufferSet<B: ComputeBackend> {
    pub source: B::Buffer,
    pub destination: B::Buffer,
    pub coefficients: B::Buffer,
    bytes: usize,
}

impl<B: ComputeBackend> DeviceBufferSet<B> {
    /// Allocate the three buffers on `device` and upload the coefficients
    /// through `queue`, blocking until the upload completes.
    pub fn allocate(
        backend: &B,
        context: &B::Context,
        queue: &B::Queue,
        device: &DeviceEntry<B>,
        frame: FrameShape,
        halo: &HaloKernel,
    ) -> Result<Self> {
        Self::assemble(backend, context, queue, device, frame, halo).map_err(|(err, _)| err)
    }

    /// Like [`allocate`](Self::allocate), but a failure hands back the
    /// buffers already created instead of dropping them.
    fn assemble(
        backend: &B,
        context: &B::Context,
        queue: &B::Queue,
        device: &DeviceEntry<B>,
        frame: FrameShape,
        halo: &HaloKernel,
    ) -> std::result::Result<Self, (Error, Vec<B::Buffer>)> {
        let label = device.label();
        let max_alloc = device.info.max_alloc_size;
        if max_alloc > 0 && frame.bytes() as u64 > max_alloc {
            let err = Error::precondition(format!(
                "{} frame needs {} bytes but {} allows at most {} per buffer",
                frame,
                frame.bytes(),
                label,
                max_alloc
            ));
            return Err((err, Vec::new()));
        }

        let buffer_error =
            |source: RuntimeError| Error::resource(ResourceKind::Buffer, label.as_str(), source);
        let source = match backend.create_buffer(context, BufferAccess::ReadOnly, frame.len()) {
            Ok(buffer) => buffer,
            Err(e) => return Err((buffer_error(e), Vec::new())),
        };
        let destination =
            match backend.create_buffer(context, BufferAccess::WriteOnly, frame.len()) {
                Ok(buffer) => buffer,
                Err(e) => return Err((buffer_error(e), vec![source])),
            };
        let mut coefficients =
            match backend.create_buffer(context, BufferAccess::ReadOnly, halo.coefficients().len()) {
                Ok(buffer) => buffer,
                Err(e) => return Err((buffer_error(e), vec![source, destination])),
            };

        // SAFETY: the queue is drained before `halo` goes out of scope.
        let uploaded =
            unsafe { backend.enqueue_write(queue, &mut coefficients, halo.coefficients(), &[]) };
        let drained = backend.finish(queue);
        if let Err(e) = uploaded.and(drained) {
            return Err((buffer_error(e), vec![source, destination, coefficients]));
        }

        let bytes = (2 * frame.len() + halo.coefficients().len()) * std::mem::size_of::<f32>();
        debug!("{}: {} bytes of buffers", label, bytes);
        Ok(DeviceBufferSet {
            source,
            destination,
            coefficients,
            bytes,
        })
    }

    /// Device memory held by the set.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Buffer footprint summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub sets: usize,
    pub bytes_per_set: usize,
    pub total_bytes: usize,
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} buffer set(s), {:.2}MB each, {:.2}MB total",
            self.sets,
            self.bytes_per_set as f64 / 1e6,
            self.total_bytes as f64 / 1e6,
        )
    }
}

/// Buffer sets for every device that has a queue and a kernel.
pub struct BufferManager<B: ComputeBackend> {
    sets: Vec<Option<DeviceBufferSet<B>>>,
    /// Buffers of sets that failed part way, held until release.
    stranded: Vec<B::Buffer>,
}

impl<B: ComputeBackend> BufferManager<B> {
    /// Empty manager; fill it with [`provision`](Self::provision).
    pub fn new() -> Self {
        BufferManager {
            sets: Vec::new(),
            stranded: Vec::new(),
        }
    }

    /// Allocate one set per dispatch-capable device.
    ///
    /// Devices without a queue or without a compiled kernel get no set.
    /// Allocation failures follow `policy`; if no device ends up with a set
    /// the result is [`Error::NoUsableDevices`].
    pub fn allocate(
        backend: &B,
        topology: &Topology<B>,
        queues: &QueuePool<B>,
        programs: &ProgramSet<B>,
        frame: FrameShape,
        halo: &HaloKernel,
        policy: DevicePolicy,
    ) -> Result<Self> {
        let mut manager = Self::new();
        manager.provision(backend, topology, queues, programs, frame, halo, policy)?;
        Ok(manager)
    }

    /// Allocate into this manager.
    ///
    /// On error every buffer created so far stays owned by the manager, so
    /// the caller decides when it is released relative to the queues.
    #[allow(clippy::too_many_arguments)]
    pub fn provision(
        &mut self,
        backend: &B,
        topology: &Topology<B>,
        queues: &QueuePool<B>,
        programs: &ProgramSet<B>,
        frame: FrameShape,
        halo: &HaloKernel,
        policy: DevicePolicy,
    ) -> Result<()> {
        self.sets.reserve(topology.len());
        for device in topology.devices() {
            let queue = match queues.primary(device.id) {
                Some(queue) if programs.is_ready(device.id) => queue,
                _ => {
                    self.sets.push(None);
                    continue;
                }
            };
            match DeviceBufferSet::assemble(
                backend,
                topology.context(device.id),
                queue,
                device,
                frame,
                halo,
            ) {
                Ok(set) => self.sets.push(Some(set)),
                Err((err, partial)) => {
                    self.stranded.extend(partial);
                    self.sets.push(None);
                    if policy == DevicePolicy::Strict {
                        return Err(err);
                    }
                    warn!("excluding {}: {}", device.label(), err);
                }
            }
        }

        let stats = self.stats();
        if stats.sets == 0 {
            return Err(Error::NoUsableDevices {
                excluded: topology.len(),
            });
        }
        info!("{}", stats);
        Ok(())
    }

    /// Buffer set of `device`, if it has one.
    pub fn get(&self, device: DeviceId) -> Option<&DeviceBufferSet<B>> {
        self.sets.get(device.0).and_then(Option::as_ref)
    }

    /// Devices holding a buffer set, i.e. the devices that will get a worker.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, set)| set.is_some())
            .map(|(i, _)| DeviceId(i))
            .collect()
    }

    /// Mutable access to every allocated set.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut DeviceBufferSet<B>)> {
        self.sets
            .iter_mut()
            .enumerate()
            .filter_map(|(i, set)| set.as_mut().map(|set| (DeviceId(i), set)))
    }

    pub fn stats(&self) -> BufferStats {
        let allocated: Vec<usize> = self.sets.iter().flatten().map(|s| s.bytes()).collect();
        BufferStats {
            sets: allocated.len(),
            bytes_per_set: allocated.first().copied().unwrap_or(0),
            total_bytes: allocated.iter().sum(),
        }
    }

    pub(crate) fn release(&mut self) {
        self.sets.clear();
        self.stranded.clear();
    }
}

impl<B: ComputeBackend> Default for BufferManager<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostBackend, HostDeviceSpec, Released};
    use halocorr_core::{DeviceClass, HaloExtents, QueueConfig, XCORR_KERNEL_SOURCE};

    struct Phases {
        topology: Topology<HostBackend>,
        queues: QueuePool<HostBackend>,
        programs: ProgramSet<HostBackend>,
    }

    fn phases(backend: &HostBackend, queues: usize) -> Phases {
        let policy = DevicePolicy::ExcludeFailed;
        let topology = Topology::discover(backend, DeviceClass::Gpu, policy).unwrap();
        let queues = QueuePool::create(backend, &topology, queues, QueueConfig::default()).unwrap();
        let programs =
            ProgramSet::build(backend, &topology, XCORR_KERNEL_SOURCE, "xcorr", "", policy)
                .unwrap();
        Phases {
            topology,
            queues,
            programs,
        }
    }

    #[test]
    fn test_footprint_independent_of_batch() {
        let backend = HostBackend::with_devices(3);
        let p = phases(&backend, 3);
        let frame = FrameShape::new(8, 16);
        let halo = HaloKernel::identity(HaloExtents::new(1, 2, 1, 0));
        let buffers = BufferManager::allocate(
            &backend,
            &p.topology,
            &p.queues,
            &p.programs,
            frame,
            &halo,
            DevicePolicy::Strict,
        )
        .unwrap();

        let stats = buffers.stats();
        assert_eq!(stats.sets, 3);
        assert_eq!(stats.bytes_per_set, (2 * 128 + 4 * 2) * 4);
        assert_eq!(stats.total_bytes, backend.live_buffer_bytes());
    }

    #[test]
    fn test_idle_and_failed_devices_get_no_set() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("a"),
            HostDeviceSpec::new("b").failing_buffer(),
            HostDeviceSpec::new("c"),
            HostDeviceSpec::new("idle"),
        ]);
        let p = phases(&backend, 3);
        let frame = FrameShape::new(4, 4);
        let halo = HaloKernel::identity(HaloExtents::uniform(1));

        let buffers = BufferManager::allocate(
            &backend,
            &p.topology,
            &p.queues,
            &p.programs,
            frame,
            &halo,
            DevicePolicy::ExcludeFailed,
        )
        .unwrap();
        assert_eq!(buffers.devices(), vec![DeviceId(0), DeviceId(2)]);
        assert!(buffers.get(DeviceId(1)).is_none());
        assert!(buffers.get(DeviceId(3)).is_none());

        let err = BufferManager::allocate(
            &backend,
            &p.topology,
            &p.queues,
            &p.programs,
            frame,
            &halo,
            DevicePolicy::Strict,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            Error::ResourceCreation {
                resource: ResourceKind::Buffer,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_upload_keeps_buffers_until_release() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("a"),
            HostDeviceSpec::new("b").failing_write(0),
        ]);
        let p = phases(&backend, 2);
        let frame = FrameShape::new(4, 4);
        let halo = HaloKernel::identity(HaloExtents::uniform(1));
        let mut buffers = BufferManager::new();

        let err = buffers
            .provision(
                &backend,
                &p.topology,
                &p.queues,
                &p.programs,
                frame,
                &halo,
                DevicePolicy::Strict,
            )
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 202);
        // Device a's set and device b's three stranded buffers are still live.
        assert_eq!(backend.live_buffer_bytes(), 2 * (2 * 16 + 9) * 4);
        assert!(backend.releases().is_empty());

        buffers.release();
        assert_eq!(backend.live_buffer_bytes(), 0);
        assert_eq!(backend.releases(), vec![Released::Buffer; 6]);
    }

    #[test]
    fn test_frame_larger_than_max_alloc() {
        let backend = HostBackend::with_specs(vec![HostDeviceSpec::new("tiny").with_max_alloc(32)]);
        let p = phases(&backend, 1);
        let err = BufferManager::allocate(
            &backend,
            &p.topology,
            &p.queues,
            &p.programs,
            FrameShape::new(4, 4),
            &HaloKernel::identity(HaloExtents::uniform(0)),
            DevicePolicy::ExcludeFailed,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::NoUsableDevices { excluded: 1 }));
        assert_eq!(backend.live_buffer_bytes(), 0);
    }
}
