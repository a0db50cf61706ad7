//! ftcam-hw: hardware layer for UVC facial tracker cameras.
//!
//! Provides V4L2 capture with YUYV decoding, standard camera controls,
//! and the extension-unit register protocol that programs and switches
//! on the VIVE Facial Tracker's sensors.

pub mod camera;
pub mod controls;
pub mod filter;
pub mod frame;
pub mod quirks;
pub mod register;
pub mod source;
pub mod tracker;
pub mod xu;

#[cfg(test)]
mod testing;

pub use camera::{Camera, CameraError, FormatDescriptor, FrameSizeDescriptor};
pub use controls::{ControlDescriptor, ControlInfo, ControlKind};
pub use filter::{FramePostProcessor, MedianBlur};
pub use frame::{DecodeMode, DecodedFrame, FrameError, FrameGeometry, PixelDecoder, PixelEncoding, RawFrame};
pub use register::{ProtocolError, RegisterEncoding, RegisterProtocol};
pub use source::{AsyncFrameSource, FrameSource, V4lFrameSource};
pub use tracker::{TrackerError, TrackerOptions, TrackerState, ViveTracker};
pub use xu::{ControlChannel, ControlTransport, XuError};
