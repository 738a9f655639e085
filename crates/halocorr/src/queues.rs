//! Command queue pool.

use crate::enumerate::{DeviceId, Topology};
use halocorr_core::{ComputeBackend, Error, QueueConfig, ResourceKind, Result};
use tracing::{debug, info, warn};

/// Index of a queue in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub usize);

pub struct QueueEntry<B: ComputeBackend> {
    pub id: QueueId,
    pub device: DeviceId,
    pub handle: B::Queue,
}

/// Command queues bound round-robin to the topology's devices.
pub struct QueuePool<B: ComputeBackend> {
    queues: Vec<QueueEntry<B>>,
    config: QueueConfig,
}

impl<B: ComputeBackend> QueuePool<B> {
    /// Create `count` queues; queue `n` is bound to device `n % devices`.
    ///
    /// If any creation fails, the queues created so far are drained and
    /// released before the error is returned.
    pub fn create(
        backend: &B,
        topology: &Topology<B>,
        count: usize,
        config: QueueConfig,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::config("at least one command queue is required"));
        }
        let devices = topology.len();
        let mut pool = QueuePool {
            queues: Vec::with_capacity(count),
            config,
        };

        for n in 0..count {
            let device = DeviceId(n % devices);
            let entry = topology.device(device);
            match backend.create_queue(topology.context(device), &entry.handle, config) {
                Ok(handle) => {
                    debug!("queue {} on {}", n, entry.label());
                    pool.queues.push(QueueEntry {
                        id: QueueId(n),
                        device,
                        handle,
                    });
                }
                Err(source) => {
                    let error = Error::resource(ResourceKind::Queue, entry.label(), source);
                    if let Err(drain) = pool.release(backend) {
                        warn!("draining partial queue pool: {}", drain);
                    }
                    return Err(error);
                }
            }
        }

        info!(
            "{} command queue(s) over {} device(s) (out-of-order: {}, profiling: {})",
            count,
            devices.min(count),
            config.out_of_order,
            config.profiling
        );
        for idle in count..devices {
            warn!("{} has no command queue and stays idle", topology.device(DeviceId(idle)).label());
        }
        Ok(pool)
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, id: QueueId) -> Option<&QueueEntry<B>> {
        self.queues.get(id.0)
    }

    /// Queues bound to `device`, in creation order.
    pub fn for_device(&self, device: DeviceId) -> impl Iterator<Item = &QueueEntry<B>> {
        self.queues.iter().filter(move |q| q.device == device)
    }

    /// First queue bound to `device`, used by that device's worker.
    pub fn primary(&self, device: DeviceId) -> Option<&B::Queue> {
        self.for_device(device).next().map(|q| &q.handle)
    }

    /// Block until every queue has finished its enqueued work.
    pub fn drain(&self, backend: &B) -> Result<()> {
        let mut first = None;
        for queue in &self.queues {
            if let Err(source) = backend.finish(&queue.handle) {
                first.get_or_insert(Error::Drain {
                    queue: queue.id.0,
                    source,
                });
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Drain and release every queue. Safe to call more than once.
    ///
    /// A queue whose drain fails is still released; the first drain error
    /// is returned.
    pub fn release(&mut self, backend: &B) -> Result<()> {
        let mut first = None;
        for queue in self.queues.drain(..) {
            if let Err(source) = backend.finish(&queue.handle) {
                let err = Error::Drain {
                    queue: queue.id.0,
                    source,
                };
                warn!("{}", err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicePolicy;
    use crate::host::{HostBackend, HostDeviceSpec, Released};
    use halocorr_core::DeviceClass;

    fn topology(backend: &HostBackend) -> Topology<HostBackend> {
        Topology::discover(backend, DeviceClass::Gpu, DevicePolicy::Strict).unwrap()
    }

    #[test]
    fn test_round_robin_binding() {
        let backend = HostBackend::with_devices(3);
        let topology = topology(&backend);
        let pool = QueuePool::create(&backend, &topology, 7, QueueConfig::default()).unwrap();

        assert_eq!(pool.len(), 7);
        assert_eq!(pool.for_device(DeviceId(0)).count(), 3);
        assert_eq!(pool.for_device(DeviceId(1)).count(), 2);
        assert_eq!(pool.for_device(DeviceId(2)).count(), 2);
        assert_eq!(pool.get(QueueId(4)).unwrap().device, DeviceId(1));
        assert!(pool.drain(&backend).is_ok());
    }

    #[test]
    fn test_fewer_queues_than_devices() {
        let backend = HostBackend::with_devices(3);
        let topology = topology(&backend);
        let pool = QueuePool::create(&backend, &topology, 2, QueueConfig::default()).unwrap();
        assert!(pool.primary(DeviceId(1)).is_some());
        assert!(pool.primary(DeviceId(2)).is_none());
    }

    #[test]
    fn test_zero_queues_is_config_error() {
        let backend = HostBackend::with_devices(1);
        let topology = topology(&backend);
        let err = QueuePool::create(&backend, &topology, 0, QueueConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_creation_failure_releases_partial_pool() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("ok"),
            HostDeviceSpec::new("broken").failing_queue(),
        ]);
        let topology = topology(&backend);
        let err = QueuePool::create(&backend, &topology, 2, QueueConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::ResourceCreation {
                resource: ResourceKind::Queue,
                ..
            }
        ));
        assert_eq!(backend.releases(), vec![Released::Queue]);
    }

    #[test]
    fn test_creation_failure_with_stuck_queue_still_releases() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("stuck").failing_finish(0),
            HostDeviceSpec::new("broken").failing_queue(),
        ]);
        let topology = topology(&backend);
        let err = QueuePool::create(&backend, &topology, 2, QueueConfig::default())
            .err()
            .unwrap();
        // The queue error wins over the drain error of the partial pool.
        assert!(matches!(
            err,
            Error::ResourceCreation {
                resource: ResourceKind::Queue,
                ..
            }
        ));
        assert_eq!(backend.releases(), vec![Released::Queue]);
    }

    #[test]
    fn test_release_reports_first_drain_error() {
        let backend = HostBackend::with_specs(vec![
            HostDeviceSpec::new("a"),
            HostDeviceSpec::new("b").failing_finish(0),
            HostDeviceSpec::new("c").failing_finish(0),
        ]);
        let topology = topology(&backend);
        let mut pool = QueuePool::create(&backend, &topology, 3, QueueConfig::default()).unwrap();

        let err = pool.release(&backend).err().unwrap();
        assert!(matches!(err, Error::Drain { queue: 1, .. }));
        assert_eq!(err.exit_code(), 202);
        assert!(pool.is_empty());
        assert_eq!(backend.releases(), vec![Released::Queue; 3]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let backend = HostBackend::with_devices(2);
        let topology = topology(&backend);
        let mut pool = QueuePool::create(&backend, &topology, 2, QueueConfig::default()).unwrap();
        pool.release(&backend).unwrap();
        pool.release(&backend).unwrap();
        assert!(pool.is_empty());
        assert_eq!(backend.releases(), vec![Released::Queue, Released::Queue]);
    }
}
