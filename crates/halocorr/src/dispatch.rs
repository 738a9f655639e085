//! Dynamic work distribution.
//!
//! One host thread per usable device pulls image indices from a shared
//! [`WorkCursor`] until it runs dry. For each claimed image the worker
//! enqueues, on its own device queue:
//!
//! ```text
//! write(src ← image) ──► kernel(src, dst, coeff, L0, R0, L1, R1) ──► read(dst → slot)
//!        event ─────────────────► wait    event ──────────────────────► wait
//! ```
//!
//! and then drains the queue before touching the buffers again. Faster
//! devices simply claim more indices; nothing is partitioned up front.
//!
//! Each image owns one output slot, so results land in input order no matter
//! which device finishes first.

use crate::buffers::DeviceBufferSet;
use crate::config::ImagePolicy;
use crate::enumerate::DeviceId;
use halocorr_core::{
    ComputeBackend, DispatchStage, Error, FrameShape, HaloExtents, ImageBatch, KernelArgs, Result,
    RuntimeError,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared claim counter over `[0, len)`.
#[derive(Debug)]
pub struct WorkCursor {
    next: AtomicUsize,
    len: usize,
}

impl WorkCursor {
    pub fn new(len: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
        }
    }

    /// Claim the next unprocessed index, or `None` once every index is taken.
    ///
    /// Each index in `[0, len)` is returned to exactly one caller.
    pub fn claim(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        (index < self.len).then_some(index)
    }

    /// Number of indices handed out so far.
    pub fn claimed(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Cooperative cancellation flag, checked by every worker before each claim.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop handing out work. Images already claimed still complete.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag so the next dispatch runs.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A per-image failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
    pub index: usize,
    pub device: DeviceId,
    pub stage: DispatchStage,
    pub error: RuntimeError,
}

/// Per-device dispatch counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub device: DeviceId,
    pub name: String,
    pub processed: usize,
    pub failed: usize,
    /// Summed kernel execution time, when queues were created with profiling.
    pub kernel_time: Option<Duration>,
}

/// Outcome of one batch dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Images in the batch.
    pub images: usize,
    pub per_device: Vec<DeviceStats>,
    /// Failed images, in the order the failures happened.
    pub failures: Vec<ImageFailure>,
    /// Images never claimed (cancellation or abort).
    pub skipped: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl DispatchReport {
    /// Images that completed copy-in, execution and copy-out.
    pub fn processed(&self) -> usize {
        self.per_device.iter().map(|d| d.processed).sum()
    }

    /// Check that every image was processed.
    pub fn is_complete(&self) -> bool {
        self.processed() == self.images
    }

    /// Indices of failed images, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.failures.iter().map(|f| f.index).collect();
        indices.sort_unstable();
        indices
    }

    /// Processed images per second of wall time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        }
    }

    /// Process exit code: 0 on a complete run, otherwise the number of
    /// failed or skipped images clamped to `1..=199`.
    pub fn exit_code(&self) -> u8 {
        match self.failures.len() + self.skipped {
            0 => 0,
            n => n.min(199) as u8,
        }
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} images in {:.3}s ({:.1} images/s), {} failed, {} skipped",
            self.processed(),
            self.images,
            self.elapsed.as_secs_f64(),
            self.throughput(),
            self.failures.len(),
            self.skipped,
        )
    }
}

type StageResult<T> = std::result::Result<T, (DispatchStage, RuntimeError)>;

/// One device's share of the dispatch: its queue, kernel and buffers.
pub(crate) struct Lane<'a, B: ComputeBackend> {
    pub device: DeviceId,
    pub label: String,
    pub queue: &'a B::Queue,
    pub kernel: &'a B::Kernel,
    pub buffers: &'a mut DeviceBufferSet<B>,
}

impl<'a, B: ComputeBackend> Lane<'a, B> {
    /// Copy in, correlate and copy back one image.
    ///
    /// The queue is drained before returning, on success and on failure, so
    /// no command can still be reading `input` or writing `output`.
    fn process(
        &mut self,
        backend: &B,
        halo: HaloExtents,
        frame: FrameShape,
        profiling: bool,
        input: &[f32],
        output: &mut [f32],
    ) -> StageResult<Option<Duration>> {
        let enqueued = self.enqueue(backend, halo, frame, input, output);
        let drained = backend.finish(self.queue);
        let kernel = enqueued?;
        drained.map_err(|e| (DispatchStage::Synchronize, e))?;
        Ok(if profiling {
            backend.event_duration(&kernel)
        } else {
            None
        })
    }

    fn enqueue(
        &mut self,
        backend: &B,
        halo: HaloExtents,
        frame: FrameShape,
        input: &[f32],
        output: &mut [f32],
    ) -> StageResult<B::Event> {
        let buffers = &mut *self.buffers;

        // SAFETY: `process` drains the queue before `input` is released.
        let written = unsafe { backend.enqueue_write(self.queue, &mut buffers.source, input, &[]) }
            .map_err(|e| (DispatchStage::CopyIn, e))?;

        let args = KernelArgs {
            source: &buffers.source,
            destination: &buffers.destination,
            coefficients: &buffers.coefficients,
            halo,
        };
        let executed = backend
            .enqueue_kernel(self.queue, self.kernel, args, frame, &[&written])
            .map_err(|e| (DispatchStage::Execute, e))?;

        // SAFETY: `process` drains the queue before `output` is released.
        unsafe { backend.enqueue_read(self.queue, &buffers.destination, output, &[&executed]) }
            .map_err(|e| (DispatchStage::CopyOut, e))?;
        Ok(executed)
    }
}

/// State shared by every worker of one dispatch.
struct Shared<'a> {
    cursor: WorkCursor,
    cancel: &'a CancelToken,
    abort: AtomicBool,
    failures: Mutex<Vec<ImageFailure>>,
    input: &'a ImageBatch,
    slots: Vec<Mutex<&'a mut [f32]>>,
    halo: HaloExtents,
    policy: ImagePolicy,
    profiling: bool,
}

impl Shared<'_> {
    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.load(Ordering::Acquire)
    }

    fn record(&self, failure: ImageFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}

fn work<B: ComputeBackend>(mut lane: Lane<'_, B>, backend: &B, shared: &Shared<'_>) -> DeviceStats {
    let frame = shared.input.frame();
    let mut stats = DeviceStats {
        device: lane.device,
        name: lane.label.clone(),
        processed: 0,
        failed: 0,
        kernel_time: None,
    };

    while !shared.stopped() {
        let Some(index) = shared.cursor.claim() else {
            break;
        };
        let mut slot = shared.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match lane.process(
            backend,
            shared.halo,
            frame,
            shared.profiling,
            shared.input.image(index),
            &mut slot[..],
        ) {
            Ok(kernel_time) => {
                stats.processed += 1;
                if let Some(t) = kernel_time {
                    *stats.kernel_time.get_or_insert(Duration::ZERO) += t;
                }
                debug!("image {} done on {}", index, lane.label);
            }
            Err((stage, error)) => {
                slot.fill(0.0);
                stats.failed += 1;
                warn!("{} failed for image {} on {}: {}", stage, index, lane.label, error);
                shared.record(ImageFailure {
                    index,
                    device: lane.device,
                    stage,
                    error,
                });
                if shared.policy == ImagePolicy::Abort {
                    shared.abort.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }
    stats
}

/// Runs one batch over a set of lanes.
pub(crate) struct Dispatcher<'a, B: ComputeBackend> {
    pub backend: &'a B,
    pub lanes: Vec<Lane<'a, B>>,
    pub halo: HaloExtents,
    pub policy: ImagePolicy,
    pub profiling: bool,
    pub cancel: &'a CancelToken,
}

impl<'a, B: ComputeBackend> Dispatcher<'a, B> {
    /// Process every image of `input` into the matching slot of `output`.
    ///
    /// Returns once every worker has stopped. Under [`ImagePolicy::Abort`]
    /// the first image failure is returned as [`Error::Dispatch`].
    pub fn run(self, input: &ImageBatch, output: &mut ImageBatch) -> Result<DispatchReport> {
        let frame = input.frame();
        if output.frame() != frame || output.len() != input.len() {
            return Err(Error::precondition(format!(
                "output batch ({} × {}) does not match input ({} × {})",
                output.len(),
                output.frame(),
                input.len(),
                frame
            )));
        }

        let labels: Vec<(DeviceId, String)> =
            self.lanes.iter().map(|l| (l.device, l.label.clone())).collect();
        let images = input.len();
        let shared = Shared {
            cursor: WorkCursor::new(images),
            cancel: self.cancel,
            abort: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
            input,
            slots: output
                .as_mut_slice()
                .chunks_mut(frame.len())
                .map(Mutex::new)
                .collect(),
            halo: self.halo,
            policy: self.policy,
            profiling: self.profiling,
        };

        info!("dispatching {} {} image(s) over {} worker(s)", images, frame, self.lanes.len());
        let started = Instant::now();
        let backend = self.backend;
        let per_device = thread::scope(|scope| -> Result<Vec<DeviceStats>> {
            let shared = &shared;
            let mut workers = Vec::with_capacity(self.lanes.len());
            for lane in self.lanes {
                let worker = thread::Builder::new()
                    .name(format!("halocorr-{}", lane.device))
                    .spawn_scoped(scope, move || work(lane, backend, shared))?;
                workers.push(worker);
            }
            Ok(workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect())
        })?;
        let elapsed = started.elapsed();

        let failures = shared
            .failures
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let finished: usize = per_device.iter().map(|d| d.processed + d.failed).sum();

        if self.policy == ImagePolicy::Abort {
            if let Some(first) = failures.first() {
                let device = labels
                    .iter()
                    .find(|(id, _)| *id == first.device)
                    .map_or_else(|| first.device.to_string(), |(_, label)| label.clone());
                return Err(Error::Dispatch {
                    index: first.index,
                    device,
                    stage: first.stage,
                    source: first.error.clone(),
                });
            }
        }

        let report = DispatchReport {
            images,
            per_device,
            failures,
            skipped: images - finished,
            cancelled: self.cancel.is_cancelled(),
            elapsed,
        };
        info!("{}", report);
        for device in &report.per_device {
            match device.kernel_time {
                Some(t) => info!(
                    "  {}: {} processed, {} failed, {:.3}s kernel time",
                    device.name,
                    device.processed,
                    device.failed,
                    t.as_secs_f64()
                ),
                None => info!(
                    "  {}: {} processed, {} failed",
                    device.name, device.processed, device.failed
                ),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_cursor_hands_out_each_index_once() {
        let cursor = WorkCursor::new(1000);
        let claimed: Vec<Vec<usize>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut mine = Vec::new();
                        while let Some(i) = cursor.claim() {
                            mine.push(i);
                        }
                        mine
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let all: Vec<usize> = claimed.into_iter().flatten().collect();
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
        assert_eq!(cursor.claimed(), 1000);
        assert!(cursor.claim().is_none());
    }

    #[test]
    fn test_empty_cursor() {
        let cursor = WorkCursor::new(0);
        assert!(cursor.is_empty());
        assert!(cursor.claim().is_none());
        assert_eq!(cursor.claimed(), 0);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    fn report(failures: usize, skipped: usize) -> DispatchReport {
        let failure = ImageFailure {
            index: 0,
            device: DeviceId(0),
            stage: DispatchStage::Execute,
            error: RuntimeError::new("clEnqueueNDRangeKernel", -5),
        };
        DispatchReport {
            images: 500,
            per_device: vec![DeviceStats {
                device: DeviceId(0),
                name: "dev0".into(),
                processed: 500 - failures - skipped,
                failed: failures,
                kernel_time: None,
            }],
            failures: vec![failure; failures],
            skipped,
            cancelled: skipped > 0,
            elapsed: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_report_exit_code() {
        assert_eq!(report(0, 0).exit_code(), 0);
        assert_eq!(report(3, 0).exit_code(), 3);
        assert_eq!(report(1, 4).exit_code(), 5);
        assert_eq!(report(250, 0).exit_code(), 199);
        assert!(report(0, 0).is_complete());
        assert!(!report(0, 1).is_complete());
    }

    #[test]
    fn test_report_throughput() {
        let report = report(0, 0);
        assert_eq!(report.processed(), 500);
        assert!((report.throughput() - 250.0).abs() < 1e-9);
        assert!(report.to_string().starts_with("500/500 images"));
    }
}
