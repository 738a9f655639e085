//! halocorr: multi-device halo cross-correlation
//!
//! Correlates a batch of raw `f32` images with a small coefficient window on
//! every compute device of the requested class.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: 64 images of 1024×1024, 3×3 window, every GPU
//! halocorr --images images_in.dat --kernel-coeffs image_kernel.dat --output images_out.dat
//!
//! # All device classes, two queues, profiling on
//! halocorr --device all --queues 2 --profiling
//!
//! # List devices and exit
//! halocorr --device all --list-devices
//!
//! # Simulated devices, no OpenCL required
//! halocorr --backend host --host-devices 4 --height 64 --width 64 --num-images 16
//! ```
//!
//! Exit status is 0 on success, the number of failed images (1-199) after a
//! partial run, or 201-207 for a fatal error of the matching class.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use halocorr::{io, Engine, EngineConfig, HostBackend, Topology};
use halocorr_core::{
    ComputeBackend, DeviceClass, FrameShape, HaloExtents, Result, XCORR_KERNEL_SOURCE,
};

/// Compute runtime to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ComputeBackendChoice {
    /// OpenCL platforms installed on the host
    #[value(name = "opencl")]
    OpenCl,
    /// Simulated devices running on host threads
    Host,
}

#[derive(Parser, Debug)]
#[command(name = "halocorr")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Multi-device halo cross-correlation", long_about = None)]
struct Args {
    /// Input image batch (raw little-endian f32)
    #[arg(long, default_value = "images_in.dat")]
    images: PathBuf,

    /// Halo coefficient window (raw little-endian f32)
    #[arg(long, default_value = "image_kernel.dat")]
    kernel_coeffs: PathBuf,

    /// Output image batch
    #[arg(short, long, default_value = "images_out.dat")]
    output: PathBuf,

    /// Number of images in the batch
    #[arg(short = 'n', long, default_value = "64")]
    num_images: usize,

    /// Frame height (rows, axis 0)
    #[arg(long, default_value = "1024")]
    height: usize,

    /// Frame width (columns, axis 1)
    #[arg(long, default_value = "1024")]
    width: usize,

    /// Halo extents L0,R0,L1,R1
    #[arg(long, default_value = "1,1,1,1")]
    halo: HaloExtents,

    /// Device class (gpu, cpu, accelerator, all)
    #[arg(short, long)]
    device: Option<DeviceClass>,

    /// Total command queues (default: one per device)
    #[arg(short, long)]
    queues: Option<usize>,

    /// Create out-of-order command queues
    #[arg(long)]
    out_of_order: bool,

    /// Record kernel execution times
    #[arg(long)]
    profiling: bool,

    /// Kernel source file (default: embedded xcorr kernel)
    #[arg(long)]
    kernel_source: Option<PathBuf>,

    /// Compute runtime
    #[arg(long, value_enum, default_value = "opencl")]
    backend: ComputeBackendChoice,

    /// Simulated devices for the host backend
    #[arg(long, default_value = "2")]
    host_devices: usize,

    /// Fail on the first device or image error
    #[arg(long)]
    strict: bool,

    /// Print the devices of the selected class and exit
    #[arg(long)]
    list_devices: bool,

    /// Configuration file (JSON); command-line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Merge the configuration file with command-line overrides.
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(class) = self.device {
            config.device_class = class;
        }
        if self.queues.is_some() {
            config.queues = self.queues;
        }
        config.queue.out_of_order |= self.out_of_order;
        config.queue.profiling |= self.profiling;
        if self.strict {
            config = config.strict();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();

    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("[{}] {}", err.category(), err);
            if let Some(log) = err.build_log() {
                error!("build log:\n{}", log);
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(args: &Args) -> Result<u8> {
    let config = args.engine_config()?;
    match args.backend {
        ComputeBackendChoice::Host => {
            execute(HostBackend::with_devices(args.host_devices), args, config)
        }
        #[cfg(feature = "opencl")]
        ComputeBackendChoice::OpenCl => execute(halocorr::OpenClBackend::new(), args, config),
        #[cfg(not(feature = "opencl"))]
        ComputeBackendChoice::OpenCl => Err(halocorr_core::Error::config(
            "this build has no OpenCL support; rebuild with `--features opencl` or use `--backend host`",
        )),
    }
}

fn execute<B: ComputeBackend>(backend: B, args: &Args, config: EngineConfig) -> Result<u8> {
    if args.list_devices {
        let topology = Topology::discover(&backend, config.device_class, config.device_policy)?;
        for report in topology.reports() {
            println!("{report}");
        }
        for rejected in topology.rejected() {
            println!("excluded: {} ({})", rejected.name, rejected.error);
        }
        return Ok(0);
    }

    // Inputs are validated before any device work starts.
    let frame = FrameShape::new(args.height, args.width);
    let images = io::load_batch(&args.images, frame, args.num_images)?;
    let halo = io::load_halo(&args.kernel_coeffs, args.halo)?;
    let source = match &args.kernel_source {
        Some(path) => std::fs::read_to_string(path)?,
        None => XCORR_KERNEL_SOURCE.to_string(),
    };

    info!("╔══════════════════════════════════════════╗");
    info!("║  HALOCORR MULTI-DEVICE CROSS-CORRELATION ║");
    info!("╚══════════════════════════════════════════╝");
    info!("  Images:  {} × {}", images.len(), frame);
    info!("  Halo:    {}", halo.extents());
    info!("  Backend: {}", backend.name());
    info!("  Devices: {}", config.device_class);

    let mut engine = Engine::builder(backend)
        .config(config)
        .kernel_source(source)
        .frame(frame)
        .halo(halo)
        .build()?;
    for report in engine.device_reports() {
        info!("  {}", report);
    }

    let (output, report) = engine.run(&images)?;

    // Results are saved even when a queue fails to drain at teardown.
    io::write_f32_file(&args.output, output.as_slice())?;
    info!("wrote {} to {}", report, args.output.display());
    for failure in &report.failures {
        error!(
            "image {} failed at {} on {}: {}",
            failure.index, failure.stage, failure.device, failure.error
        );
    }
    engine.teardown()?;
    Ok(report.exit_code())
}
