//! Decode, post-filter and deliver one raw frame.

use ftcam_hw::{DecodeMode, DecodedFrame, FrameError, FrameGeometry, FramePostProcessor, PixelDecoder, RawFrame};
use thiserror::Error;

/// Returned by a frame callback that does not want the current frame.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Drop this frame and keep going.
    #[error("frame rejected: {0}")]
    Skip(String),
    /// Stop the acquisition loop.
    #[error("consumer requested stop")]
    Stop,
}

/// Consumer of decoded frames. The frame buffer is reused; copy out what
/// must outlive the call.
pub type FrameCallback = Box<dyn FnMut(&DecodedFrame) -> Result<(), CallbackError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered,
    /// No callback, or an empty payload.
    Ignored,
    /// Decode or callback rejected the frame.
    Skipped,
    /// The loop should stop.
    Stop,
}

pub struct FramePipeline {
    decoder: PixelDecoder,
    frame: DecodedFrame,
    post: Option<Box<dyn FramePostProcessor>>,
    callback: Option<FrameCallback>,
}

impl FramePipeline {
    pub fn new(geometry: FrameGeometry, mode: DecodeMode) -> Self {
        let decoder = PixelDecoder::new(geometry, mode);
        let frame = decoder.output_frame();
        Self {
            decoder,
            frame,
            post: None,
            callback: None,
        }
    }

    pub fn with_post_processor(mut self, post: Box<dyn FramePostProcessor>) -> Self {
        tracing::debug!(filter = post.name(), "post-processor installed");
        self.post = Some(post);
        self
    }

    pub fn with_callback(mut self, callback: FrameCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.decoder.geometry()
    }

    pub fn has_post_processor(&self) -> bool {
        self.post.is_some()
    }

    pub fn process(&mut self, raw: &RawFrame) -> FrameOutcome {
        let Some(callback) = self.callback.as_mut() else {
            return FrameOutcome::Ignored;
        };
        if raw.is_empty() {
            return FrameOutcome::Ignored;
        }

        match self.decoder.decode(raw, &mut self.frame) {
            Ok(()) => {}
            Err(e @ FrameError::UnsupportedPixelFormat(_)) => {
                tracing::error!(error = %e, seq = raw.sequence, "stopping on unsupported frame");
                return FrameOutcome::Stop;
            }
            Err(e) => {
                tracing::warn!(error = %e, seq = raw.sequence, "skipping frame");
                return FrameOutcome::Skipped;
            }
        }

        if let Some(post) = self.post.as_mut() {
            post.process(&mut self.frame);
        }

        match callback(&self.frame) {
            Ok(()) => FrameOutcome::Delivered,
            Err(CallbackError::Stop) => {
                tracing::info!(seq = raw.sequence, "consumer requested stop");
                FrameOutcome::Stop
            }
            Err(e) => {
                tracing::warn!(error = %e, seq = raw.sequence, "skipping frame");
                FrameOutcome::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftcam_hw::PixelEncoding;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn yuyv_frame(sequence: u32) -> RawFrame {
        RawFrame {
            data: vec![10, 100, 20, 200, 30, 101, 40, 201],
            encoding: PixelEncoding::Yuyv,
            width: 2,
            height: 2,
            sequence,
        }
    }

    fn counting(count: &Arc<AtomicUsize>) -> FrameCallback {
        let count = Arc::clone(count);
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    struct Invert;

    impl FramePostProcessor for Invert {
        fn process(&mut self, frame: &mut DecodedFrame) {
            frame.data_mut().iter_mut().for_each(|b| *b = 255 - *b);
        }

        fn name(&self) -> &'static str {
            "invert"
        }
    }

    #[test]
    fn test_delivers_decoded_frame() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut pipeline = FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full)
            .with_callback(Box::new(move |frame| {
                sink.lock().unwrap().push(frame.channel(0).unwrap());
                Ok(())
            }));

        assert_eq!(pipeline.process(&yuyv_frame(1)), FrameOutcome::Delivered);
        assert_eq!(seen.lock().unwrap()[0], vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_post_processor_runs_before_callback() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut pipeline = FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full)
            .with_post_processor(Box::new(Invert))
            .with_callback(Box::new(move |frame| {
                *sink.lock().unwrap() = frame.pixel(0, 0);
                Ok(())
            }));

        pipeline.process(&yuyv_frame(1));
        assert_eq!(*seen.lock().unwrap(), Some([245, 155, 55]));
    }

    #[test]
    fn test_no_callback_short_circuits() {
        let mut pipeline = FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full);
        assert_eq!(pipeline.process(&yuyv_frame(1)), FrameOutcome::Ignored);
    }

    #[test]
    fn test_empty_payload_short_circuits() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut pipeline =
            FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full).with_callback(counting(&count));
        let mut raw = yuyv_frame(1);
        raw.data.clear();
        assert_eq!(pipeline.process(&raw), FrameOutcome::Ignored);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_short_buffer_is_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut pipeline =
            FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full).with_callback(counting(&count));
        let mut raw = yuyv_frame(1);
        raw.data.truncate(6);
        assert_eq!(pipeline.process(&raw), FrameOutcome::Skipped);
        assert_eq!(pipeline.process(&yuyv_frame(2)), FrameOutcome::Delivered);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsupported_encoding_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut pipeline =
            FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full).with_callback(counting(&count));
        let mut raw = yuyv_frame(1);
        raw.encoding = PixelEncoding::from_fourcc(*b"MJPG");
        assert_eq!(pipeline.process(&raw), FrameOutcome::Stop);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_outcomes() {
        let mut calls = 0;
        let mut pipeline = FramePipeline::new(FrameGeometry::new(2, 2), DecodeMode::Full).with_callback(
            Box::new(move |_| {
                calls += 1;
                match calls {
                    1 => Err(CallbackError::Skip("blurry".into())),
                    2 => Ok(()),
                    _ => Err(CallbackError::Stop),
                }
            }),
        );
        assert_eq!(pipeline.process(&yuyv_frame(1)), FrameOutcome::Skipped);
        assert_eq!(pipeline.process(&yuyv_frame(2)), FrameOutcome::Delivered);
        assert_eq!(pipeline.process(&yuyv_frame(3)), FrameOutcome::Stop);
    }
}
