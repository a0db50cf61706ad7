//! Acquisition counters shared between the capture loop and observers.

use crate::pipeline::FrameOutcome;
use std::sync::atomic::{AtomicU64, Ordering};

/// Frame counters shared between the capture side and observers.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    captured: AtomicU64,
    delivered: AtomicU64,
    ignored: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames read from the source.
    pub captured: u64,
    /// Frames handed to the callback successfully.
    pub delivered: u64,
    /// Frames short-circuited: no callback or empty payload.
    pub ignored: u64,
    /// Frames rejected by decode or the callback.
    pub skipped: u64,
    /// Frames overwritten in the slot before the consumer saw them.
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Counter increase from `earlier` to `self`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.saturating_sub(earlier.captured),
            delivered: self.delivered.saturating_sub(earlier.delivered),
            ignored: self.ignored.saturating_sub(earlier.ignored),
            skipped: self.skipped.saturating_sub(earlier.skipped),
            dropped: self.dropped.saturating_sub(earlier.dropped),
        }
    }
}

impl AcquisitionStats {
    pub(crate) fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Delivered => &self.delivered,
            FrameOutcome::Ignored => &self.ignored,
            FrameOutcome::Skipped | FrameOutcome::Stop => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let stats = AcquisitionStats::default();
        stats.record_captured();
        stats.record_captured();
        stats.record_captured();
        stats.record(FrameOutcome::Delivered);
        stats.record(FrameOutcome::Ignored);
        stats.record(FrameOutcome::Stop);
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(
            snap,
            StatsSnapshot {
                captured: 3,
                delivered: 1,
                ignored: 1,
                skipped: 1,
                dropped: 1,
            }
        );
    }

    #[test]
    fn test_since() {
        let earlier = StatsSnapshot {
            captured: 10,
            delivered: 8,
            dropped: 2,
            ..Default::default()
        };
        let later = StatsSnapshot {
            captured: 40,
            delivered: 30,
            dropped: 10,
            ..Default::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.captured, 30);
        assert_eq!(delta.delivered, 22);
        assert_eq!(delta.dropped, 8);
    }
}
