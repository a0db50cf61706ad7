//! V4L2 camera access and capture-format negotiation via the `v4l` crate.

use crate::controls::{self, ControlDescriptor};
use crate::frame::{FrameGeometry, PixelEncoding};
use crate::quirks::{self, QuirkFile};
use crate::source::V4lFrameSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::video::Capture;
use v4l::{Device, FourCC, Fraction};

/// Sizes slower than this are never selected.
pub const MIN_FPS: f64 = 30.0;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("cannot open {path}: {reason}")]
    DeviceOpen { path: PathBuf, reason: String },
    #[error("device busy: {0}")]
    DeviceBusy(PathBuf),
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),
    #[error("frame size negotiation failed: {0}")]
    SizeNegotiation(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("control {name}: {reason}")]
    Control { name: String, reason: String },
    #[error("control {name}: value {value} outside {min}..={max}")]
    ControlRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("device closed")]
    Closed,
    #[error("stream state: {0}")]
    StreamState(String),
}

/// One pixel format reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    pub encoding: PixelEncoding,
    pub description: String,
    /// Reported for the video-capture buffer type.
    pub capture: bool,
}

/// One frame size of a format, with the slowest rate the device offers for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSizeDescriptor {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub min_fps: f64,
}

impl FrameSizeDescriptor {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }
}

/// First format that is YUYV and capture-capable.
///
/// Candidates are not ranked; the device's enumeration order decides.
pub fn select_format(formats: &[FormatDescriptor]) -> Result<&FormatDescriptor, CameraError> {
    formats
        .iter()
        .find(|f| f.encoding == PixelEncoding::Yuyv && f.capture)
        .ok_or_else(|| {
            let seen: Vec<String> = formats.iter().map(|f| f.encoding.to_string()).collect();
            CameraError::FormatNegotiation(format!(
                "no YUYV capture format among [{}]",
                seen.join(", ")
            ))
        })
}

/// First YUYV size whose minimum frame rate is at least [`MIN_FPS`].
pub fn select_frame_size(sizes: &[FrameSizeDescriptor]) -> Result<&FrameSizeDescriptor, CameraError> {
    sizes
        .iter()
        .find(|s| s.encoding == PixelEncoding::Yuyv && s.min_fps >= MIN_FPS)
        .ok_or_else(|| {
            CameraError::SizeNegotiation(format!(
                "none of {} YUYV sizes reaches {MIN_FPS} fps",
                sizes
                    .iter()
                    .filter(|s| s.encoding == PixelEncoding::Yuyv)
                    .count()
            ))
        })
}

fn fraction_fps(f: &Fraction) -> f64 {
    if f.numerator == 0 {
        0.0
    } else {
        f64::from(f.denominator) / f64::from(f.numerator)
    }
}

/// Slowest frame rate among the reported intervals.
///
/// Stepwise ranges count with their longest interval.
fn min_fps(intervals: &[FrameIntervalEnum]) -> f64 {
    intervals
        .iter()
        .map(|i| match i {
            FrameIntervalEnum::Discrete(f) => fraction_fps(f),
            FrameIntervalEnum::Stepwise(s) => fraction_fps(&s.max),
        })
        .fold(None, |acc: Option<f64>, fps| {
            Some(acc.map_or(fps, |a| a.min(fps)))
        })
        .unwrap_or(0.0)
}

fn enumerate_formats(device: &Device) -> Result<Vec<FormatDescriptor>, CameraError> {
    let formats = device
        .enum_formats()
        .map_err(|e| CameraError::FormatNegotiation(format!("failed to enumerate formats: {e}")))?;

    Ok(formats
        .into_iter()
        .map(|f| FormatDescriptor {
            encoding: PixelEncoding::from_fourcc(f.fourcc.repr),
            description: f.description,
            capture: f.typ == v4l::buffer::Type::VideoCapture as u32,
        })
        .collect())
}

fn enumerate_frame_sizes(
    device: &Device,
    encoding: PixelEncoding,
) -> Result<Vec<FrameSizeDescriptor>, CameraError> {
    let fourcc = FourCC::new(&encoding.fourcc());
    let sizes = device
        .enum_framesizes(fourcc)
        .map_err(|e| CameraError::SizeNegotiation(format!("failed to enumerate sizes: {e}")))?;

    let mut out = Vec::with_capacity(sizes.len());
    for size in sizes {
        let (width, height) = match size.size {
            FrameSizeEnum::Discrete(d) => (d.width, d.height),
            FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
        };
        let intervals: Vec<FrameIntervalEnum> = match device.enum_frameintervals(fourcc, width, height) {
            Ok(list) => list.into_iter().map(|i| i.interval).collect(),
            Err(e) => {
                tracing::debug!(width, height, error = %e, "no frame intervals");
                Vec::new()
            }
        };
        out.push(FrameSizeDescriptor {
            encoding,
            width,
            height,
            min_fps: min_fps(&intervals),
        });
    }
    Ok(out)
}

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open camera with its capture format committed.
///
/// Controls hold weak references to the device and stop working once the
/// camera is closed or dropped.
pub struct Camera {
    device: Arc<Device>,
    path: PathBuf,
    card: String,
    driver: String,
    bus: String,
    format: FormatDescriptor,
    frame_size: FrameSizeDescriptor,
    controls: Vec<ControlDescriptor>,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g. "/dev/video2") and commit the
    /// negotiated format and frame size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |reason: String| CameraError::DeviceOpen {
            path: path.clone(),
            reason,
        };

        if !path.exists() {
            return Err(open_err("no such device".into()));
        }

        let device = Device::with_path(&path).map_err(|e| {
            if e.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) {
                CameraError::DeviceBusy(path.clone())
            } else {
                open_err(e.to_string())
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| open_err(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(open_err("not a video capture device".into()));
        }

        tracing::info!(
            device = %path.display(),
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let formats = enumerate_formats(&device)?;
        let format = select_format(&formats)?.clone();
        let sizes = enumerate_frame_sizes(&device, format.encoding)?;
        let frame_size = select_frame_size(&sizes)?.clone();

        commit_format(&device, &frame_size)?;

        tracing::info!(
            format = %format.description,
            width = frame_size.width,
            height = frame_size.height,
            fps = frame_size.min_fps,
            "negotiated format"
        );

        let device = Arc::new(device);
        let controls = match controls::enumerate(&device) {
            Ok(controls) => controls,
            Err(e) => {
                tracing::warn!(error = %e, "control enumeration failed");
                Vec::new()
            }
        };

        Ok(Self {
            device,
            path,
            card: caps.card,
            driver: caps.driver,
            bus: caps.bus,
            format,
            frame_size,
            controls,
        })
    }

    /// Open `/dev/video{index}`.
    pub fn open_index(index: usize) -> Result<Self, CameraError> {
        Self::open(format!("/dev/video{index}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn bus(&self) -> &str {
        &self.bus
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn frame_size(&self) -> &FrameSizeDescriptor {
        &self.frame_size
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.frame_size.geometry()
    }

    pub fn width(&self) -> u32 {
        self.frame_size.width
    }

    pub fn height(&self) -> u32 {
        self.frame_size.height
    }

    pub fn fps(&self) -> f64 {
        self.frame_size.min_fps
    }

    pub fn controls(&self) -> &[ControlDescriptor] {
        &self.controls
    }

    /// Find a control by name, ignoring case.
    pub fn control(&self, name: &str) -> Option<&ControlDescriptor> {
        self.controls
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Known tracker model this camera looks like, if any.
    pub fn tracker_model(&self) -> Option<&'static QuirkFile> {
        quirks::is_tracker_camera(&self.card, quirks::get_usb_ids(&self.path))
    }

    /// Memory-mapped frame source with `buffers` kernel buffers.
    pub fn frame_source(&self, buffers: u32) -> Result<V4lFrameSource, CameraError> {
        V4lFrameSource::new(&self.device, self.frame_size.encoding, self.geometry(), buffers)
    }

    /// Release the device. Controls obtained from this camera stop working.
    pub fn close(self) {
        tracing::debug!(device = %self.path.display(), "closing camera");
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = PathBuf::from(format!("/dev/video{i}"));
            if !path.exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card,
                driver: caps.driver,
                bus: caps.bus,
            });
        }

        devices
    }
}

fn commit_format(device: &Device, size: &FrameSizeDescriptor) -> Result<(), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiation(format!("failed to get format: {e}")))?;

    fmt.fourcc = FourCC::new(&size.encoding.fourcc());
    fmt.width = size.width;
    fmt.height = size.height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiation(format!("failed to set format: {e}")))?;

    if PixelEncoding::from_fourcc(negotiated.fourcc.repr) != size.encoding {
        return Err(CameraError::FormatNegotiation(format!(
            "driver chose {} instead of {}",
            PixelEncoding::from_fourcc(negotiated.fourcc.repr),
            size.encoding
        )));
    }
    if negotiated.width != size.width || negotiated.height != size.height {
        return Err(CameraError::SizeNegotiation(format!(
            "driver chose {}x{} instead of {}x{}",
            negotiated.width, negotiated.height, size.width, size.height
        )));
    }

    // Stream parameters stay at the driver's default rate; `min_fps` is
    // reported only.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(code: &[u8; 4], capture: bool) -> FormatDescriptor {
        FormatDescriptor {
            encoding: PixelEncoding::from_fourcc(*code),
            description: String::from_utf8_lossy(code).into_owned(),
            capture,
        }
    }

    fn size(code: &[u8; 4], width: u32, height: u32, min_fps: f64) -> FrameSizeDescriptor {
        FrameSizeDescriptor {
            encoding: PixelEncoding::from_fourcc(*code),
            width,
            height,
            min_fps,
        }
    }

    #[test]
    fn test_select_first_yuyv_capture_format() {
        let formats = vec![
            fmt(b"MJPG", true),
            fmt(b"YUYV", false),
            fmt(b"YUYV", true),
            fmt(b"GREY", true),
        ];
        let chosen = select_format(&formats).unwrap();
        assert!(std::ptr::eq(chosen, &formats[2]));
    }

    #[test]
    fn test_select_format_none() {
        let formats = vec![fmt(b"MJPG", true), fmt(b"YUYV", false)];
        assert!(matches!(
            select_format(&formats),
            Err(CameraError::FormatNegotiation(_))
        ));
        assert!(matches!(select_format(&[]), Err(CameraError::FormatNegotiation(_))));
    }

    #[test]
    fn test_select_first_fast_enough_size() {
        let sizes = vec![
            size(b"YUYV", 1280, 720, 10.0),
            size(b"MJPG", 800, 600, 60.0),
            size(b"YUYV", 400, 400, 60.0),
            size(b"YUYV", 640, 480, 90.0),
        ];
        let chosen = select_frame_size(&sizes).unwrap();
        assert_eq!((chosen.width, chosen.height), (400, 400));
    }

    #[test]
    fn test_select_size_accepts_exactly_thirty() {
        let sizes = vec![size(b"YUYV", 640, 480, 30.0)];
        assert_eq!(select_frame_size(&sizes).unwrap().width, 640);
    }

    #[test]
    fn test_select_size_none() {
        let sizes = vec![size(b"YUYV", 1280, 720, 29.97), size(b"MJPG", 640, 480, 60.0)];
        assert!(matches!(
            select_frame_size(&sizes),
            Err(CameraError::SizeNegotiation(_))
        ));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let sizes = vec![size(b"YUYV", 320, 240, 60.0), size(b"YUYV", 640, 480, 60.0)];
        for _ in 0..10 {
            assert_eq!(select_frame_size(&sizes).unwrap().width, 320);
        }
    }

    #[test]
    fn test_min_fps_discrete() {
        let intervals = vec![
            FrameIntervalEnum::Discrete(Fraction::new(1, 60)),
            FrameIntervalEnum::Discrete(Fraction::new(1, 30)),
        ];
        assert_eq!(min_fps(&intervals), 30.0);
    }

    #[test]
    fn test_fraction_fps() {
        assert_eq!(fraction_fps(&Fraction::new(1, 15)), 15.0);
        assert_eq!(fraction_fps(&Fraction::new(1001, 30000)), 30000.0 / 1001.0);
    }

    #[test]
    fn test_min_fps_empty_or_degenerate() {
        assert_eq!(min_fps(&[]), 0.0);
        assert_eq!(
            min_fps(&[FrameIntervalEnum::Discrete(Fraction::new(0, 30))]),
            0.0
        );
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist").err().unwrap();
        assert!(matches!(err, CameraError::DeviceOpen { .. }));
    }
}
