//! Per-device program compilation and kernel extraction.

use crate::config::DevicePolicy;
use crate::enumerate::{DeviceId, Topology};
use halocorr_core::{ComputeBackend, Error, ResourceKind, Result};
use tracing::{debug, info, warn};

/// Compilation outcome for one device.
pub enum ProgramSlot<B: ComputeBackend> {
    /// Built program and its extracted entry point.
    Ready { kernel: B::Kernel, program: B::Program },
    /// Build or kernel extraction failed; the device is excluded. A program
    /// that built but lacks the entry point is held until teardown.
    Failed {
        log: String,
        program: Option<B::Program>,
    },
}

impl<B: ComputeBackend> ProgramSlot<B> {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProgramSlot::Ready { .. })
    }
}

/// One program slot per device, index-aligned with the topology.
pub struct ProgramSet<B: ComputeBackend> {
    entry_point: String,
    slots: Vec<ProgramSlot<B>>,
}

impl<B: ComputeBackend> ProgramSet<B> {
    /// Empty set for `entry_point`; fill it with [`compile`](Self::compile).
    pub fn new(entry_point: &str) -> Self {
        ProgramSet {
            entry_point: entry_point.to_string(),
            slots: Vec::new(),
        }
    }

    /// Compile `source` for every device and extract `entry_point`.
    ///
    /// Under [`DevicePolicy::Strict`] the first failure is returned. Under
    /// [`DevicePolicy::ExcludeFailed`] failures are recorded with their build
    /// log and only [`Error::NoUsableDevices`] is returned, when no device
    /// compiled.
    pub fn build(
        backend: &B,
        topology: &Topology<B>,
        source: &str,
        entry_point: &str,
        options: &str,
        policy: DevicePolicy,
    ) -> Result<Self> {
        let mut set = Self::new(entry_point);
        set.compile(backend, topology, source, options, policy)?;
        Ok(set)
    }

    /// Compile into this set, one slot per device.
    ///
    /// On error the slots built so far stay in the set, so the owner can
    /// release them after draining its queues.
    pub fn compile(
        &mut self,
        backend: &B,
        topology: &Topology<B>,
        source: &str,
        options: &str,
        policy: DevicePolicy,
    ) -> Result<()> {
        self.slots.reserve(topology.len());
        for device in topology.devices() {
            match Self::load(backend, topology, device.id, source, &self.entry_point, options) {
                Ok((program, kernel)) => {
                    debug!("built `{}` for {}", self.entry_point, device.label());
                    self.slots.push(ProgramSlot::Ready { kernel, program });
                }
                Err((err, program)) => {
                    let log = match &err {
                        Error::Build { log, .. } => log.clone(),
                        other => other.to_string(),
                    };
                    self.slots.push(ProgramSlot::Failed { log, program });
                    if policy == DevicePolicy::Strict {
                        return Err(err);
                    }
                    warn!("excluding {}: {}", device.label(), err);
                    if let Error::Build { log, .. } = &err {
                        warn!("build log for {}:\n{}", device.label(), log);
                    }
                }
            }
        }

        let ready = self.ready_count();
        if ready == 0 {
            return Err(Error::NoUsableDevices {
                excluded: self.slots.len(),
            });
        }
        info!(
            "kernel `{}` ready on {}/{} device(s)",
            self.entry_point,
            ready,
            self.slots.len()
        );
        Ok(())
    }

    fn load(
        backend: &B,
        topology: &Topology<B>,
        id: DeviceId,
        source: &str,
        entry_point: &str,
        options: &str,
    ) -> std::result::Result<(B::Program, B::Kernel), (Error, Option<B::Program>)> {
        let device = topology.device(id);
        let program = backend
            .build_program(topology.context(id), &device.handle, source, options)
            .map_err(|failure| {
                let err = Error::Build {
                    device: device.label(),
                    log: failure.log,
                };
                (err, None)
            })?;
        match backend.create_kernel(&program, entry_point) {
            Ok(kernel) => Ok((program, kernel)),
            Err(source) => Err((
                Error::resource(ResourceKind::Kernel, device.label(), source),
                Some(program),
            )),
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn slot(&self, device: DeviceId) -> Option<&ProgramSlot<B>> {
        self.slots.get(device.0)
    }

    /// Check whether `device` has an execution-ready kernel.
    pub fn is_ready(&self, device: DeviceId) -> bool {
        self.slot(device).is_some_and(ProgramSlot::is_ready)
    }

    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_ready()).count()
    }

    /// Kernel handle of `device`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProgram`] if the device's program never compiled.
    pub fn kernel(&self, topology: &Topology<B>, device: DeviceId) -> Result<&B::Kernel> {
        match self.slot(device) {
            Some(ProgramSlot::Ready { kernel, .. }) => Ok(kernel),
            _ => Err(Error::InvalidProgram {
                device: topology.device(device).label(),
                entry_point: self.entry_point.clone(),
            }),
        }
    }

    /// Build log of a failed device.
    pub fn build_log(&self, device: DeviceId) -> Option<&str> {
        match self.slot(device) {
            Some(ProgramSlot::Failed { log, .. }) => Some(log),
            _ => None,
        }
    }

    /// Release every kernel, then every program.
    pub(crate) fn release(&mut self) {
        let programs: Vec<B::Program> = self
            .slots
            .drain(..)
            .filter_map(|slot| match slot {
                ProgramSlot::Ready { program, kernel } => {
                    drop(kernel);
                    Some(program)
                }
                ProgramSlot::Failed { program, .. } => program,
            })
            .collect();
        drop(programs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostBackend, HostDeviceSpec, Released};
    use halocorr_core::{DeviceClass, XCORR_KERNEL_SOURCE};

    fn build(
        backend: &HostBackend,
        topology: &Topology<HostBackend>,
        entry: &str,
        policy: DevicePolicy,
    ) -> Result<ProgramSet<HostBackend>> {
        ProgramSet::build(backend, topology, XCORR_KERNEL_SOURCE, entry, "", policy)
    }

    fn specs() -> Vec<HostDeviceSpec> {
        vec![
            HostDeviceSpec::new("a"),
            HostDeviceSpec::new("b").failing_build(),
            HostDeviceSpec::new("c"),
        ]
    }

    #[test]
    fn test_exclude_failed_build() {
        let backend = HostBackend::with_specs(specs());
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();
        let programs = build(&backend, &topology, "xcorr", DevicePolicy::ExcludeFailed).unwrap();

        assert_eq!(programs.ready_count(), 2);
        assert!(!programs.is_ready(DeviceId(1)));
        assert!(programs.build_log(DeviceId(1)).unwrap().contains("rejected by b"));
        assert!(programs.kernel(&topology, DeviceId(0)).is_ok());

        let err = programs.kernel(&topology, DeviceId(1)).err().unwrap();
        assert!(matches!(err, Error::InvalidProgram { .. }));
        assert_eq!(err.exit_code(), 203);
    }

    #[test]
    fn test_strict_build_failure_carries_log() {
        let backend = HostBackend::with_specs(specs());
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();
        let err = build(&backend, &topology, "xcorr", DevicePolicy::Strict)
            .err()
            .unwrap();
        assert!(err.build_log().unwrap().contains("error"));
    }

    #[test]
    fn test_missing_entry_point() {
        let backend = HostBackend::with_devices(2);
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();

        let err = build(&backend, &topology, "no_such_kernel", DevicePolicy::Strict)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::ResourceCreation {
                resource: ResourceKind::Kernel,
                ..
            }
        ));

        let err = build(&backend, &topology, "no_such_kernel", DevicePolicy::ExcludeFailed)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoUsableDevices { excluded: 2 }));
    }

    #[test]
    fn test_strict_failure_keeps_partial_slots() {
        let backend = HostBackend::with_specs(specs());
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();
        let mut programs = ProgramSet::new("xcorr");

        let err = programs
            .compile(&backend, &topology, XCORR_KERNEL_SOURCE, "", DevicePolicy::Strict)
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 203);
        assert!(programs.is_ready(DeviceId(0)));
        assert!(programs.slot(DeviceId(2)).is_none());
        // Nothing is released until the owner asks.
        assert!(backend.releases().is_empty());

        programs.release();
        assert_eq!(backend.releases(), vec![Released::Kernel, Released::Program]);
    }

    #[test]
    fn test_missing_entry_point_holds_program() {
        let backend = HostBackend::with_devices(1);
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();
        let mut programs = ProgramSet::new("no_such_kernel");

        assert!(programs
            .compile(&backend, &topology, XCORR_KERNEL_SOURCE, "", DevicePolicy::Strict)
            .is_err());
        assert!(backend.releases().is_empty());
        programs.release();
        assert_eq!(backend.releases(), vec![Released::Program]);
    }

    #[test]
    fn test_release_order() {
        let backend = HostBackend::with_devices(2);
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();
        let mut programs = build(&backend, &topology, "xcorr", DevicePolicy::Strict).unwrap();
        programs.release();
        assert_eq!(
            backend.releases(),
            vec![
                Released::Kernel,
                Released::Kernel,
                Released::Program,
                Released::Program
            ]
        );
        assert_eq!(programs.ready_count(), 0);
    }
}
