//! Platform and device discovery.
//!
//! [`Topology::discover`] walks every platform, collects the devices of the
//! requested class and creates one single-device context per device. The
//! result is a set of index-aligned arenas: `devices[i]` and `contexts[i]`
//! describe the same device, addressed by [`DeviceId`] `i`.

use crate::config::DevicePolicy;
use halocorr_core::{
    ComputeBackend, DeviceClass, DeviceInfo, Error, PlatformInfo, ResourceKind, Result,
};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Index of a platform in [`Topology::platforms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PlatformId(pub usize);

/// Index of a usable device in [`Topology::devices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// An enumerated platform. Platforms without matching devices are kept.
pub struct PlatformEntry<B: ComputeBackend> {
    pub handle: B::Platform,
    pub info: PlatformInfo,
    pub devices: Vec<DeviceId>,
}

/// A device that passed context creation.
pub struct DeviceEntry<B: ComputeBackend> {
    pub id: DeviceId,
    pub platform: PlatformId,
    pub handle: B::Device,
    pub info: DeviceInfo,
}

impl<B: ComputeBackend> DeviceEntry<B> {
    /// Short label for logs and errors: `dev0 (name)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.id, self.info.name)
    }
}

/// A device excluded during discovery.
#[derive(Debug)]
pub struct RejectedDevice {
    pub platform: PlatformId,
    pub name: String,
    pub error: Error,
}

/// Printable summary of one usable device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub platform: String,
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    pub global_mem_size: u64,
    pub max_alloc_size: u64,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}] on {} ({} MB global, {} MB max buffer)",
            self.id,
            self.name,
            self.class,
            self.platform,
            self.global_mem_size / 1_000_000,
            self.max_alloc_size / 1_000_000,
        )
    }
}

/// Platforms, devices and their contexts.
///
/// Field order is release order: contexts drop before devices, devices
/// before platforms.
pub struct Topology<B: ComputeBackend> {
    contexts: Vec<B::Context>,
    devices: Vec<DeviceEntry<B>>,
    platforms: Vec<PlatformEntry<B>>,
    rejected: Vec<RejectedDevice>,
    class: DeviceClass,
}

impl<B: ComputeBackend> Topology<B> {
    /// Enumerate platforms and devices of `class` and create one context per
    /// device.
    ///
    /// # Errors
    ///
    /// - [`Error::NoPlatforms`] when the runtime reports no platforms.
    /// - [`Error::NoDevices`] when no platform has a device of `class`; no
    ///   context has been created in that case.
    /// - [`Error::ResourceCreation`] for a failed context under
    ///   [`DevicePolicy::Strict`].
    /// - [`Error::NoUsableDevices`] when every context failed.
    pub fn discover(backend: &B, class: DeviceClass, policy: DevicePolicy) -> Result<Self> {
        let handles = backend.platforms().map_err(Error::Enumeration)?;
        if handles.is_empty() {
            return Err(Error::NoPlatforms);
        }
        info!("{} backend: {} platform(s)", backend.name(), handles.len());

        // Discover everything before creating any context.
        let mut platforms = Vec::with_capacity(handles.len());
        let mut candidates = Vec::new();
        for (index, handle) in handles.into_iter().enumerate() {
            let platform = PlatformId(index);
            let info = backend.platform_info(&handle).map_err(Error::Enumeration)?;
            let devices = backend.devices(&handle, class).map_err(Error::Enumeration)?;
            info!(
                "platform {}: {} ({} {} device(s))",
                index,
                info,
                devices.len(),
                class
            );
            for device in devices {
                let device_info = backend.device_info(&device).map_err(Error::Enumeration)?;
                candidates.push((platform, device, device_info));
            }
            platforms.push(PlatformEntry {
                handle,
                info,
                devices: Vec::new(),
            });
        }

        if candidates.is_empty() {
            return Err(Error::NoDevices {
                class,
                platforms: platforms.len(),
            });
        }

        let mut topology = Topology {
            contexts: Vec::with_capacity(candidates.len()),
            devices: Vec::with_capacity(candidates.len()),
            platforms,
            rejected: Vec::new(),
            class,
        };

        for (platform, handle, info) in candidates {
            let context = backend.create_context(&topology.platforms[platform.0].handle, &handle);
            match context {
                Ok(context) => {
                    let id = DeviceId(topology.devices.len());
                    info!("{}: {}", id, info);
                    topology.platforms[platform.0].devices.push(id);
                    topology.contexts.push(context);
                    topology.devices.push(DeviceEntry {
                        id,
                        platform,
                        handle,
                        info,
                    });
                }
                Err(source) => {
                    let error = Error::resource(ResourceKind::Context, info.name.clone(), source);
                    if policy == DevicePolicy::Strict {
                        topology.release_contexts();
                        return Err(error);
                    }
                    warn!("excluding device {}: {}", info.name, error);
                    topology.rejected.push(RejectedDevice {
                        platform,
                        name: info.name,
                        error,
                    });
                }
            }
        }

        if topology.devices.is_empty() {
            return Err(Error::NoUsableDevices {
                excluded: topology.rejected.len(),
            });
        }
        Ok(topology)
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn platforms(&self) -> &[PlatformEntry<B>] {
        &self.platforms
    }

    pub fn devices(&self) -> &[DeviceEntry<B>] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> &DeviceEntry<B> {
        &self.devices[id.0]
    }

    /// Context of device `id`.
    pub fn context(&self, id: DeviceId) -> &B::Context {
        &self.contexts[id.0]
    }

    /// Devices dropped because their context could not be created.
    pub fn rejected(&self) -> &[RejectedDevice] {
        &self.rejected
    }

    /// Number of devices with a context.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Describe every device with a context.
    pub fn reports(&self) -> Vec<DeviceReport> {
        self.devices
            .iter()
            .map(|device| DeviceReport {
                id: device.id,
                platform: self.platforms[device.platform.0].info.name.clone(),
                name: device.info.name.clone(),
                vendor: device.info.vendor.clone(),
                class: device.info.class,
                global_mem_size: device.info.global_mem_size,
                max_alloc_size: device.info.max_alloc_size,
            })
            .collect()
    }

    /// Release every context.
    pub(crate) fn release_contexts(&mut self) {
        self.contexts.clear();
    }

    /// Release device and platform handles. Contexts must already be gone.
    pub(crate) fn release_registries(&mut self) {
        debug_assert!(self.contexts.is_empty());
        self.devices.clear();
        self.platforms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostBackend, HostDeviceSpec, HostPlatformSpec, Released};

    #[test]
    fn test_one_context_per_device() {
        let backend = HostBackend::new(vec![
            HostPlatformSpec::new("p0", vec![HostDeviceSpec::new("a"), HostDeviceSpec::new("b")]),
            HostPlatformSpec::new("p1", vec![]),
            HostPlatformSpec::new("p2", vec![HostDeviceSpec::new("c")]),
        ]);
        let topology = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap();

        assert_eq!(topology.len(), 3);
        assert_eq!(backend.contexts_created(), 3);
        // The empty platform is still recorded.
        assert_eq!(topology.platforms().len(), 3);
        assert!(topology.platforms()[1].devices.is_empty());
        assert_eq!(topology.platforms()[2].devices, vec![DeviceId(2)]);
        assert_eq!(topology.device(DeviceId(2)).info.name, "c");
        assert_eq!(topology.device(DeviceId(0)).label(), "dev0 (a)");
    }

    #[test]
    fn test_no_platforms() {
        let backend = HostBackend::new(vec![]);
        let err = Topology::discover(&backend, DeviceClass::All, DevicePolicy::Strict)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoPlatforms));
    }

    #[test]
    fn test_no_devices_creates_no_context() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("cpu").with_class(DeviceClass::Cpu)
        ]);
        let err = Topology::discover(&backend, DeviceClass::Accelerator, DevicePolicy::Strict)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::NoDevices {
                class: DeviceClass::Accelerator,
                platforms: 1
            }
        ));
        assert_eq!(backend.contexts_created(), 0);
        assert_eq!(backend.releases(), vec![Released::Platform]);
    }

    #[test]
    fn test_context_failure_policy() {
        let specs = || {
            vec![
                HostDeviceSpec::new("good"),
                HostDeviceSpec::new("bad").failing_context(),
            ]
        };

        let backend = HostBackend::with_specs(specs());
        let err = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::ResourceCreation {
                resource: ResourceKind::Context,
                ..
            }
        ));

        let backend = HostBackend::with_specs(specs());
        let topology =
            Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::ExcludeFailed).unwrap();
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.rejected().len(), 1);
        assert_eq!(topology.rejected()[0].name, "bad");
        assert_eq!(topology.reports()[0].name, "good");
    }

    #[test]
    fn test_strict_context_failure_releases_contexts_first() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("a"),
            HostDeviceSpec::new("b"),
            HostDeviceSpec::new("bad").failing_context(),
            HostDeviceSpec::new("d"),
        ]);
        assert!(Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::Strict).is_err());

        let releases = backend.releases();
        assert!(releases.windows(2).all(|w| w[0] <= w[1]), "{releases:?}");
        assert_eq!(
            releases,
            vec![
                Released::Context,
                Released::Context,
                Released::Device,
                Released::Device,
                Released::Device,
                Released::Device,
                Released::Platform,
            ]
        );
    }

    #[test]
    fn test_all_contexts_failing() {
        let backend = HostBackend::with_specs(vec![HostDeviceSpec::new("bad").failing_context()]);
        let err = Topology::discover(&backend, DeviceClass::Gpu, DevicePolicy::ExcludeFailed)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoUsableDevices { excluded: 1 }));
    }
}
