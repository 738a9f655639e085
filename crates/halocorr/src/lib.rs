//! # halocorr
//!
//! Multi-device dispatch of a 2-D halo cross-correlation over a batch of
//! images.
//!
//! ## Phases
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ Enumerate  │──►│   Queues   │──►│  Programs  │──►│  Buffers   │
//! │ platforms, │   │ round-robin│   │ build per  │   │ src / dst /│
//! │ devices,   │   │ over       │   │ device,    │   │ coeff per  │
//! │ contexts   │   │ devices    │   │ extract    │   │ device     │
//! └────────────┘   └────────────┘   └────────────┘   └─────┬──────┘
//!                                                          ▼
//!                  ┌────────────┐   ┌──────────────────────────────┐
//!                  │  Teardown  │◄──│ Dispatch: one worker/device, │
//!                  │  (reverse) │   │ shared atomic work cursor    │
//!                  └────────────┘   └──────────────────────────────┘
//! ```
//!
//! Devices that fail to come up are excluded (or abort the run, with
//! [`DevicePolicy::Strict`]). Images that fail during dispatch are recorded
//! in the [`DispatchReport`] and their output slots zeroed.
//!
//! ## Example
//!
//! ```
//! use halocorr::{Engine, HostBackend};
//! use halocorr_core::{FrameShape, HaloExtents, HaloKernel, ImageBatch};
//!
//! let frame = FrameShape::new(4, 4);
//! let mut engine = Engine::builder(HostBackend::with_devices(2))
//!     .frame(frame)
//!     .halo(HaloKernel::identity(HaloExtents::uniform(1)))
//!     .build()?;
//!
//! let input = ImageBatch::new(frame, (0..64).map(|v| v as f32).collect())?;
//! let (output, report) = engine.run(&input)?;
//! assert_eq!(output, input);
//! assert!(report.is_complete());
//! engine.teardown()?;
//! # Ok::<(), halocorr_core::Error>(())
//! ```

pub mod buffers;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod enumerate;
pub mod host;
pub mod io;
pub mod program;
pub mod queues;

pub use buffers::{BufferStats, DeviceBufferSet};
pub use config::{ConfigError, DevicePolicy, EngineConfig, ImagePolicy};
pub use dispatch::{CancelToken, DeviceStats, DispatchReport, ImageFailure, WorkCursor};
pub use engine::{Engine, EngineBuilder};
pub use enumerate::{DeviceId, DeviceReport, PlatformId, Topology};
pub use host::{HostBackend, HostDeviceSpec, HostPlatformSpec, Released};
pub use queues::{QueueId, QueuePool};

#[cfg(feature = "opencl")]
pub use halocorr_opencl::OpenClBackend;
