use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ftcam_capture::{Acquisition, CallbackError, FrameCallback, FramePipeline};
use ftcam_hw::tracker::{self, ViveTracker, SENSOR_DEFAULTS};
use ftcam_hw::{
    quirks, Camera, ControlChannel, ControlInfo, ControlKind, DecodeMode, DecodedFrame,
    TrackerError, TrackerOptions,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, ModeSetting, PostFilter};

#[derive(Parser)]
#[command(name = "ftcam", about = "VIVE Facial Tracker camera tool")]
struct Cli {
    /// V4L2 device (overrides FTCAM_DEVICE)
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,
    /// Do not detect or activate a facial tracker
    #[arg(long, global = true)]
    no_tracker: bool,
    /// Program registers with the legacy comparison byte split
    #[arg(long, global = true)]
    legacy_encoding: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    List,
    /// Show the negotiated format and camera controls
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read or write a camera control by name
    Control {
        name: String,
        value: Option<i64>,
        /// Reject out-of-range values instead of clamping them
        #[arg(long)]
        no_clip: bool,
    },
    /// Detect the tracker and switch its stream on, leaving it running
    Enable,
    /// Switch the tracker's stream off
    Disable,
    /// Dump the tracker's sensor registers
    Registers,
    /// Run the acquisition loop and print per-second frame statistics
    Stream {
        /// Stop after this many delivered frames
        #[arg(short = 'n', long)]
        frames: Option<u64>,
        #[arg(long, value_enum)]
        mode: Option<ModeSetting>,
    },
    /// Capture one frame through the full pipeline and write it as an image
    Snapshot {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "rgb")]
        show: Show,
        /// Frames to discard while exposure settles
        #[arg(long, default_value_t = 5)]
        skip: u64,
        #[arg(long, value_enum)]
        mode: Option<ModeSetting>,
    },
}

/// Which view of the decoded frame to write.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Show {
    /// Raw [Y, Cb, Cr] written as if it were RGB
    Yuv,
    Y,
    U,
    V,
    Rgb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(device) = cli.device {
        config.device = device;
    }
    if cli.no_tracker {
        config.tracker_enabled = false;
    }
    if cli.legacy_encoding {
        config.legacy_register_encoding = true;
    }

    match cli.command {
        Commands::List => list_devices(),
        Commands::Info { json } => show_info(&config, json),
        Commands::Control {
            name,
            value,
            no_clip,
        } => control(&config, &name, value, no_clip),
        Commands::Enable => enable(&config).await,
        Commands::Disable => disable(&config).await,
        Commands::Registers => registers(&config).await,
        Commands::Stream { frames, mode } => {
            if let Some(mode) = mode {
                config.capture_mode = mode;
            }
            stream(&config, frames).await
        }
        Commands::Snapshot {
            output,
            show,
            skip,
            mode,
        } => {
            if let Some(mode) = mode {
                config.capture_mode = mode;
            }
            snapshot(&config, &output, show, skip).await
        }
    }
}

/// Run register traffic off the async runtime; handshakes block and sleep.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task failed")?
}

fn tracker_error(e: TrackerError, device: &Path) -> anyhow::Error {
    if e.is_not_detected() {
        anyhow!("{} is not a VIVE Facial Tracker ({e})", device.display())
    } else {
        anyhow::Error::new(e).context(format!("tracker on {}", device.display()))
    }
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found.");
        return Ok(());
    }
    for dev in devices {
        let tracker = quirks::is_tracker_camera(&dev.name, quirks::get_usb_ids(&dev.path));
        println!(
            "{}  {}  [{} @ {}]{}",
            dev.path.display(),
            dev.name,
            dev.driver,
            dev.bus,
            tracker
                .map(|q| format!("  <- {}", q.device.name))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn open_camera(config: &Config) -> Result<Camera> {
    Camera::open(&config.device)
        .with_context(|| format!("failed to open {}", config.device.display()))
}

#[derive(Serialize)]
struct CameraReport<'a> {
    device: &'a Path,
    card: &'a str,
    driver: &'a str,
    bus: &'a str,
    format: &'a str,
    width: u32,
    height: u32,
    fps: f64,
    tracker: Option<&'static str>,
    controls: Vec<ControlInfo>,
}

fn describe_kind(kind: &ControlKind) -> String {
    match kind {
        ControlKind::Integer {
            min,
            max,
            step,
            default,
            ..
        } => format!("integer {min}..={max} step {step} (default {default})"),
        ControlKind::Boolean { default } => format!("boolean (default {default})"),
        ControlKind::Select { choices, default } => {
            let labels: Vec<String> = choices.iter().map(|(i, l)| format!("{i}={l}")).collect();
            format!("select [{}] (default {default})", labels.join(", "))
        }
    }
}

fn show_info(config: &Config, json: bool) -> Result<()> {
    let camera = open_camera(config)?;
    let report = CameraReport {
        device: camera.path(),
        card: camera.card(),
        driver: camera.driver(),
        bus: camera.bus(),
        format: &camera.format().description,
        width: camera.width(),
        height: camera.height(),
        fps: camera.fps(),
        tracker: camera.tracker_model().map(|q| q.device.name.as_str()),
        controls: camera.controls().iter().map(|c| c.info()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Device:   {}", report.device.display());
    println!("Card:     {} ({} @ {})", report.card, report.driver, report.bus);
    println!("Format:   {}", report.format);
    println!(
        "Size:     {}x{} @ {:.1} fps",
        report.width, report.height, report.fps
    );
    if let Some(model) = report.tracker {
        println!("Tracker:  {model}");
    }
    println!("Controls:");
    for c in &report.controls {
        let value = c
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".into());
        let access = if c.writeable { "" } else { " [read-only]" };
        println!("  {:<32} = {:<6} {}{}", c.name, value, describe_kind(&c.kind), access);
    }
    Ok(())
}

fn control(config: &Config, name: &str, value: Option<i64>, no_clip: bool) -> Result<()> {
    let camera = open_camera(config)?;
    let Some(control) = camera.control(name) else {
        bail!("no control named {name:?}; see `ftcam info`");
    };

    match value {
        None => println!("{} = {}", control.name(), control.value()?),
        Some(value) => {
            let mut control = control.clone();
            control.set_clipping(!no_clip);
            let written = control.set_value(value)?;
            if written != value {
                println!("{} = {written} (requested {value})", control.name());
            } else {
                println!("{} = {written}", control.name());
            }
        }
    }
    Ok(())
}

async fn enable(config: &Config) -> Result<()> {
    let device = config.device.clone();
    let options = config.tracker_options();
    blocking(move || {
        let channel = ControlChannel::open(&device)?;
        let tracker =
            ViveTracker::attach(channel, options).map_err(|e| tracker_error(e, &device))?;
        tracker.release();
        println!("{}: tracker stream enabled", device.display());
        Ok(())
    })
    .await
}

async fn disable(config: &Config) -> Result<()> {
    let device = config.device.clone();
    let options = config.tracker_options();
    blocking(move || {
        let channel = ControlChannel::open(&device)?;
        tracker::disable_stream(channel, options).map_err(|e| tracker_error(e, &device))?;
        println!("{}: tracker stream disabled", device.display());
        Ok(())
    })
    .await
}

async fn registers(config: &Config) -> Result<()> {
    let device = config.device.clone();
    let options = config.tracker_options();
    let values = blocking(move || {
        let channel = ControlChannel::open(&device)?;
        let mut tracker = ViveTracker::new(channel, options);
        tracker.detect().map_err(|e| tracker_error(e, &device))?;
        let values = tracker.read_sensor_registers();
        // Reading must not change the stream state.
        tracker.release();
        values.map_err(|e| tracker_error(e, &device))
    })
    .await?;

    println!("addr  value  default");
    for ((address, value), (_, default)) in values.iter().zip(SENSOR_DEFAULTS) {
        let marker = if *value == default { "" } else { "  *" };
        println!("0x{address:02x}  0x{value:02x}   0x{default:02x}{marker}");
    }
    Ok(())
}

/// An open camera with its tracker, if one was found and activated.
struct Session {
    camera: Camera,
    tracker: Option<ViveTracker<ControlChannel>>,
}

impl Session {
    async fn open(config: &Config) -> Result<Self> {
        let camera = open_camera(config)?;
        tracing::info!(
            device = %config.device.display(),
            width = camera.width(),
            height = camera.height(),
            fps = camera.fps(),
            "camera opened"
        );

        let tracker = match camera.tracker_model() {
            Some(model) if config.tracker_enabled => {
                tracing::info!(model = %model.device.name, "tracker candidate");
                let device = config.device.clone();
                let options = config.tracker_options();
                blocking(move || attach_tracker(&device, options)).await?
            }
            Some(_) => {
                tracing::info!("tracker disabled by configuration");
                None
            }
            None => None,
        };

        Ok(Self { camera, tracker })
    }

    fn pipeline(&self, config: &Config, callback: FrameCallback) -> FramePipeline {
        let mut pipeline =
            FramePipeline::new(self.camera.geometry(), DecodeMode::Full).with_callback(callback);
        if let Some(tracker) = &self.tracker {
            if config.post_filter == PostFilter::Median {
                pipeline = pipeline.with_post_processor(Box::new(tracker.post_processor()));
            }
        }
        pipeline
    }

    fn start(&self, config: &Config, callback: FrameCallback) -> Result<Acquisition> {
        let source = self.camera.frame_source(config.buffers)?;
        let pipeline = self.pipeline(config, callback);
        let acq = Acquisition::start(
            config.capture_mode.resolve(),
            source,
            pipeline,
            config.acquisition_options(),
        )?;
        Ok(acq)
    }

    async fn close(self) {
        let Session { camera, tracker } = self;
        if let Some(tracker) = tracker {
            if let Err(e) = tokio::task::spawn_blocking(move || tracker.dispose()).await {
                tracing::warn!(error = %e, "tracker dispose did not complete");
            }
        }
        camera.close();
    }
}

fn attach_tracker(
    device: &Path,
    options: TrackerOptions,
) -> Result<Option<ViveTracker<ControlChannel>>> {
    let channel = ControlChannel::open(device)?;
    match ViveTracker::attach(channel, options) {
        Ok(tracker) => Ok(Some(tracker)),
        Err(e) if e.is_not_detected() => {
            tracing::info!(error = %e, "no tracker on this device");
            Ok(None)
        }
        Err(e) => Err(e).context("tracker activation failed"),
    }
}

async fn stream(config: &Config, limit: Option<u64>) -> Result<()> {
    let session = Session::open(config).await?;

    let luma = Arc::new(AtomicU32::new(0));
    let callback: FrameCallback = {
        let luma = Arc::clone(&luma);
        let mut calls = 0u64;
        Box::new(move |frame: &DecodedFrame| {
            calls += 1;
            if limit.is_some_and(|limit| calls > limit) {
                return Err(CallbackError::Stop);
            }
            luma.store(frame.mean_luma().to_bits(), Ordering::Relaxed);
            Ok(())
        })
    };

    let acq = match session.start(config, callback) {
        Ok(acq) => acq,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };
    println!(
        "streaming {}x{} from {} ({:?}); Ctrl-C to stop",
        session.camera.width(),
        session.camera.height(),
        config.device.display(),
        acq.mode()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut prev = acq.stats();
    let mut ticks = 0u32;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                ticks += 1;
                if ticks % 4 == 0 {
                    let now = acq.stats();
                    let delta = now.since(&prev);
                    prev = now;
                    println!(
                        "{:>4} fps  dropped {:>3}  skipped {:>3}  mean luma {:>5.1}",
                        delta.delivered,
                        delta.dropped,
                        delta.skipped,
                        f32::from_bits(luma.load(Ordering::Relaxed))
                    );
                }
                if acq.is_finished() {
                    break;
                }
            }
        }
    }

    let result = acq.stop().await;
    session.close().await;
    result?;
    Ok(())
}

async fn snapshot(config: &Config, output: &Path, show: Show, skip: u64) -> Result<()> {
    let session = Session::open(config).await?;

    let captured: Arc<Mutex<Option<DecodedFrame>>> = Arc::default();
    let callback: FrameCallback = {
        let captured = Arc::clone(&captured);
        let mut seen = 0u64;
        Box::new(move |frame: &DecodedFrame| {
            seen += 1;
            if seen <= skip {
                return Ok(());
            }
            *captured.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
            Err(CallbackError::Stop)
        })
    };

    let result = match session.start(config, callback) {
        Ok(acq) => match tokio::time::timeout(Duration::from_secs(10), acq.wait()).await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(_) => Err(anyhow!("timed out waiting for a frame")),
        },
        Err(e) => Err(e),
    };
    session.close().await;
    result?;

    let frame = captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .context("no frame captured")?;
    write_image(&frame, show, output)?;
    println!(
        "wrote {} ({}x{}, {:?}, mean luma {:.1})",
        output.display(),
        frame.width(),
        frame.height(),
        show,
        frame.mean_luma()
    );
    Ok(())
}

fn write_image(frame: &DecodedFrame, show: Show, path: &Path) -> Result<()> {
    let (width, height) = (frame.width(), frame.height());
    match show {
        Show::Rgb => save_rgb(width, height, frame.to_rgb(), path),
        Show::Yuv => save_rgb(width, height, frame.data().to_vec(), path),
        Show::Y | Show::U | Show::V => {
            let index = match show {
                Show::Y => 0,
                Show::U => 1,
                _ => 2,
            };
            let plane = frame.channel(index).context("missing channel")?;
            let img = image::GrayImage::from_raw(width, height, plane)
                .context("plane does not match frame size")?;
            img.save(path)
                .with_context(|| format!("failed to write {}", path.display()))
        }
    }
}

fn save_rgb(width: u32, height: u32, data: Vec<u8>, path: &Path) -> Result<()> {
    let img = image::RgbImage::from_raw(width, height, data)
        .context("buffer does not match frame size")?;
    img.save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftcam_hw::{FrameGeometry, PixelDecoder, PixelEncoding, RawFrame};

    fn decoded() -> DecodedFrame {
        let geometry = FrameGeometry::new(2, 1);
        let decoder = PixelDecoder::new(geometry, DecodeMode::Full);
        let mut frame = decoder.output_frame();
        let raw = RawFrame {
            data: vec![76, 85, 150, 255],
            encoding: PixelEncoding::Yuyv,
            width: 2,
            height: 1,
            sequence: 0,
        };
        decoder.decode(&raw, &mut frame).unwrap();
        frame
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from(["ftcam", "stream", "-n", "30", "--mode", "threaded", "-d", "/dev/video4"])
            .unwrap();
        assert_eq!(cli.device, Some(PathBuf::from("/dev/video4")));
        match cli.command {
            Commands::Stream { frames, mode } => {
                assert_eq!(frames, Some(30));
                assert_eq!(mode, Some(ModeSetting::Threaded));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_control_write() {
        let cli = Cli::try_parse_from(["ftcam", "control", "Gain", "12", "--no-clip"]).unwrap();
        match cli.command {
            Commands::Control { name, value, no_clip } => {
                assert_eq!(name, "Gain");
                assert_eq!(value, Some(12));
                assert!(no_clip);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_cli_snapshot_defaults() {
        let cli = Cli::try_parse_from(["ftcam", "snapshot", "-o", "out.png"]).unwrap();
        match cli.command {
            Commands::Snapshot { show, skip, .. } => {
                assert!(matches!(show, Show::Rgb));
                assert_eq!(skip, 5);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_describe_kind() {
        let kind = ControlKind::Select {
            choices: vec![(0, "Off".into()), (1, "On".into())],
            default: 0,
        };
        assert_eq!(describe_kind(&kind), "select [0=Off, 1=On] (default 0)");
    }

    #[test]
    fn test_write_planes() {
        let dir = std::env::temp_dir().join(format!("ftcam-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let frame = decoded();

        for (show, name) in [(Show::Y, "y.png"), (Show::Rgb, "rgb.png"), (Show::Yuv, "yuv.png")] {
            let path = dir.join(name);
            write_image(&frame, show, &path).unwrap();
            let img = image::open(&path).unwrap();
            assert_eq!((img.width(), img.height()), (2, 1));
        }

        let luma = image::open(dir.join("y.png")).unwrap().to_luma8();
        assert_eq!(luma.as_raw(), &vec![76, 150]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
