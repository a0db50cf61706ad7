use clap::ValueEnum;
use ftcam_capture::{AcquisitionOptions, CaptureMode};
use ftcam_hw::{RegisterEncoding, TrackerOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Capture strategy as configured; `auto` picks per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeSetting {
    Auto,
    Cooperative,
    Threaded,
}

impl ModeSetting {
    pub fn resolve(self) -> CaptureMode {
        match self {
            Self::Auto => CaptureMode::for_platform(),
            Self::Cooperative => CaptureMode::Cooperative,
            Self::Threaded => CaptureMode::ThreadedPoll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PostFilter {
    Median,
    None,
}

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video2).
    pub device: PathBuf,
    pub capture_mode: ModeSetting,
    /// Number of mmap capture buffers.
    pub buffers: u32,
    /// Consumer backoff in threaded mode.
    pub poll_interval: Duration,
    /// Register handshake timeout.
    pub handshake_timeout: Duration,
    /// Pause after each stream toggle.
    pub settle_delay: Duration,
    /// Whether to detect and activate a facial tracker.
    pub tracker_enabled: bool,
    /// Filter applied to frames while a tracker is active.
    pub post_filter: PostFilter,
    /// Program registers with the historic comparison-based byte split.
    pub legacy_register_encoding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from `FTCAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            device: var("FTCAM_DEVICE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev/video2")),
            capture_mode: env_enum(&var, "FTCAM_CAPTURE_MODE", ModeSetting::Auto),
            buffers: env_parse(&var, "FTCAM_BUFFERS", 4u32).max(1),
            poll_interval: Duration::from_millis(env_parse(&var, "FTCAM_POLL_INTERVAL_MS", 1)),
            handshake_timeout: Duration::from_millis(env_parse(
                &var,
                "FTCAM_HANDSHAKE_TIMEOUT_MS",
                500,
            )),
            settle_delay: Duration::from_millis(env_parse(&var, "FTCAM_SETTLE_MS", 250)),
            tracker_enabled: env_flag(&var, "FTCAM_TRACKER_ENABLED", true),
            post_filter: env_enum(&var, "FTCAM_POST_FILTER", PostFilter::Median),
            legacy_register_encoding: env_flag(&var, "FTCAM_LEGACY_REGISTER_ENCODING", false),
        }
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            handshake_timeout: self.handshake_timeout,
            settle_delay: self.settle_delay,
            encoding: if self.legacy_register_encoding {
                RegisterEncoding::LegacyComparison
            } else {
                RegisterEncoding::Shift
            },
            ..TrackerOptions::default()
        }
    }

    pub fn acquisition_options(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            poll_interval: self.poll_interval,
            ..AcquisitionOptions::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v.trim() != "0").unwrap_or(default)
}

fn env_enum<T: ValueEnum>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(value) = var(key) else {
        return default;
    };
    match T::from_str(value.trim(), true) {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(key, value = %value, "unrecognised value; using default");
            default
        }
    }
}
