//! ftcam-capture: frame acquisition for facial tracker cameras.
//!
//! Pulls raw frames from an `ftcam-hw` source, decodes them, applies an
//! optional post-filter and hands them to a consumer callback.

pub mod acquisition;
pub mod pipeline;
pub mod slot;
pub mod stats;

pub use acquisition::{Acquisition, AcquisitionError, AcquisitionOptions, CaptureMode};
pub use pipeline::{CallbackError, FrameCallback, FrameOutcome, FramePipeline};
pub use slot::LatestSlot;
pub use stats::{AcquisitionStats, StatsSnapshot};
