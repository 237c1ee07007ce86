//! dmabuf-capture binary: stream a V4L2 device and report frame statistics.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};

use dmabuf_capture::config::{DEFAULT_BUFFER_COUNT, DEFAULT_DEVICE, DEFAULT_TIMEOUT_SECS};
use dmabuf_capture::{
    CameraError, CancelToken, CaptureConfig, FourCC, Frame, PixelEncoding, Result, V4L2Capture,
    VideoFormat,
};

/// Zero-copy V4L2 capture with DMA-BUF export
#[derive(Parser, Debug)]
#[command(name = "dmabuf-capture")]
#[command(version)]
#[command(about = "Zero-copy V4L2 capture with DMA-BUF export")]
struct Cli {
    /// Capture device node
    #[arg(short, long, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Number of driver buffers to request
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_COUNT)]
    buffers: u32,

    /// Seconds to wait for a frame before giving up (0 waits forever)
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Resolution to request, e.g. 1280x720
    #[arg(short, long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Pixel format to request, e.g. NV12 (needs --resolution)
    #[arg(short, long, value_parser = parse_fourcc, requires = "resolution")]
    format: Option<FourCC>,

    /// Stop after this many frames (0 runs until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,

    /// Give up after this many resets (unlimited when omitted)
    #[arg(long)]
    max_resets: Option<u32>,

    /// Enable verbose logging (use RUST_LOG=trace for per-frame output)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize env_logger based on verbosity flags
fn init_logging(verbose: bool, quiet: bool) {
    let env = env_logger::Env::default();
    let env = if quiet {
        env.default_filter_or("error")
    } else if verbose {
        env.default_filter_or("debug")
    } else {
        env.default_filter_or("info")
    };

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

/// Parse a `WIDTHxHEIGHT` resolution.
fn parse_resolution(s: &str) -> std::result::Result<(u32, u32), String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let width: u32 = width
        .parse()
        .map_err(|_| format!("invalid width in resolution: {s}"))?;
    let height: u32 = height
        .parse()
        .map_err(|_| format!("invalid height in resolution: {s}"))?;
    if width == 0 || height == 0 {
        return Err(format!("resolution dimensions must be positive: {s}"));
    }
    Ok((width, height))
}

/// Parse a four-character pixel format code.
fn parse_fourcc(s: &str) -> std::result::Result<FourCC, String> {
    let code: [u8; 4] = s
        .as_bytes()
        .try_into()
        .map_err(|_| format!("pixel format must be exactly 4 characters: {s}"))?;
    Ok(FourCC::new(&code))
}

fn run(cli: Cli) -> Result<()> {
    let cancel = CancelToken::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, cancel.flag())?;
    }
    log::debug!("Installed SIGINT/SIGTERM handlers");

    let handle = thread::Builder::new()
        .name("capture".to_owned())
        .spawn(move || capture_thread(&cli, &cancel))?;

    handle.join().unwrap_or_else(|_| {
        Err(CameraError::Io(std::io::Error::other(
            "capture thread panicked",
        )))
    })
}

fn capture_thread(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    let mut config = CaptureConfig::default()
        .with_device(&cli.device)
        .with_buffers(cli.buffers)
        .with_timeout_secs(cli.timeout);
    if let Some((width, height)) = cli.resolution {
        let encoding = PixelEncoding::from_fourcc(cli.format.unwrap_or(FourCC::YUYV));
        config = config.with_format(VideoFormat::new(width, height, encoding));
    }

    let mut capture = V4L2Capture::v4l2(config).with_cancel_token(cancel.clone());
    capture.init()?;
    if let Some(capability) = capture.capability() {
        log::info!(
            "Capturing from {} ({}, {})",
            capability.card,
            capability.driver,
            capability.mode
        );
    }

    let mut report = FrameReport::new(cli.frames, cancel.clone());
    let mut result = capture.start(move |frame: &Frame<'_>| report.record(frame));
    let mut resets = 0;
    loop {
        match result {
            Ok(stats) => {
                log::info!("Capture stopped: {stats}");
                return Ok(());
            }
            Err(err) if cancel.is_cancelled() => return Err(err),
            Err(err) => {
                if cli.max_resets.is_some_and(|max| resets >= max) {
                    log::error!("Giving up after {resets} resets");
                    return Err(err);
                }
                log::warn!("Capture failed ({err}), resetting");
                resets += 1;
                result = capture.reset();
            }
        }
    }
}

/// Per-second frame summary for the log.
struct FrameReport {
    limit: u64,
    cancel: CancelToken,
    total: u64,
    window_start: Instant,
    window_frames: u32,
    window_bytes: usize,
}

impl FrameReport {
    fn new(limit: u64, cancel: CancelToken) -> Self {
        Self {
            limit,
            cancel,
            total: 0,
            window_start: Instant::now(),
            window_frames: 0,
            window_bytes: 0,
        }
    }

    fn record(&mut self, frame: &Frame<'_>) {
        self.total += 1;
        self.window_frames += 1;
        self.window_bytes += frame.bytes_used();

        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            log::info!(
                "{:.1} fps, {} KiB/frame, last seq {} (buffer {}, fd {})",
                f64::from(self.window_frames) / elapsed.as_secs_f64(),
                self.window_bytes / 1024 / usize::try_from(self.window_frames.max(1)).unwrap_or(1),
                frame.sequence(),
                frame.index(),
                frame.descriptor().as_raw_fd()
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
            self.window_bytes = 0;
        }

        if self.limit != 0 && self.total >= self.limit {
            log::info!("Captured {} frames", self.total);
            self.cancel.cancel();
        }
    }
}
