//! Raw frame sources.
//!
//! [`FrameSource`] is the blocking interface used by a dedicated capture
//! thread; [`AsyncFrameSource`] is driven from a tokio task on the
//! device's readiness. [`V4lFrameSource`] implements both over a V4L2
//! memory-mapped stream; a given source should be driven through one of
//! them only.

use crate::camera::CameraError;
use crate::frame::{FrameGeometry, PixelEncoding, RawFrame};
use std::future::Future;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use v4l::buffer::Type as BufType;
use v4l::device::Handle;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::Device;

/// Default wait for one blocking read before the caller gets a chance to
/// check for cancellation.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Blocking frame source.
pub trait FrameSource: Send {
    /// Wait for the next frame.
    ///
    /// `Ok(None)` means no frame arrived within the source's read timeout.
    /// [`CameraError::Closed`] means the source is exhausted or gone.
    fn read_frame(&mut self) -> Result<Option<RawFrame>, CameraError>;
}

/// Frame source driven by an async runtime.
pub trait AsyncFrameSource: Send {
    /// Next frame, or `Ok(None)` at the end of the stream.
    fn next_frame(&mut self) -> impl Future<Output = Result<Option<RawFrame>, CameraError>> + Send;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read_frame(&mut self) -> Result<Option<RawFrame>, CameraError> {
        (**self).read_frame()
    }
}

struct HandleFd(Arc<Handle>);

impl AsRawFd for HandleFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd()
    }
}

/// Memory-mapped V4L2 capture stream.
///
/// Frames are pulled with [`CaptureStream::next`], which hands the previous
/// buffer back to the driver before dequeuing. Every call after the first is
/// gated on the device being readable, so `next` never times out with a
/// buffer already handed back.
pub struct V4lFrameSource {
    stream: MmapStream<'static>,
    streaming: bool,
    handle: Arc<Handle>,
    encoding: PixelEncoding,
    geometry: FrameGeometry,
    read_timeout: Duration,
    async_fd: Option<AsyncFd<HandleFd>>,
}

impl V4lFrameSource {
    pub(crate) fn new(
        device: &Device,
        encoding: PixelEncoding,
        geometry: FrameGeometry,
        buffers: u32,
    ) -> Result<Self, CameraError> {
        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, buffers)
            .map_err(|e| CameraError::Capture(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(STARTUP_TIMEOUT);

        tracing::debug!(buffers, %encoding, width = geometry.width, height = geometry.height, "created mmap stream");

        Ok(Self {
            stream,
            streaming: false,
            handle: device.handle(),
            encoding,
            geometry,
            read_timeout: DEFAULT_READ_TIMEOUT,
            async_fd: None,
        })
    }

    /// Change how long a blocking read waits before returning `Ok(None)`.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn encoding(&self) -> PixelEncoding {
        self.encoding
    }

    fn register_async(&mut self) -> Result<(), CameraError> {
        if self.async_fd.is_some() {
            return Ok(());
        }
        let fd = AsyncFd::with_interest(HandleFd(Arc::clone(&self.handle)), Interest::READABLE)
            .map_err(|e| CameraError::StreamState(format!("cannot watch device: {e}")))?;
        self.async_fd = Some(fd);
        Ok(())
    }

    /// Whether a filled buffer is ready within `timeout`.
    fn wait_readable(&self, timeout: Duration) -> Result<bool, CameraError> {
        match self.handle.poll(libc::POLLIN, poll_timeout_ms(timeout)) {
            Ok(ready) => Ok(ready > 0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(capture_error(e)),
        }
    }

    /// Hand the previous buffer back, take the next one and copy it out.
    /// The first call also queues every buffer and switches streaming on.
    fn next_buffer(&mut self) -> Result<RawFrame, CameraError> {
        if !self.streaming {
            tracing::debug!("stream on");
        }
        self.streaming = true;

        let (buf, meta) = self.stream.next().map_err(capture_error)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(RawFrame {
            data: buf[..used].to_vec(),
            encoding: self.encoding,
            width: self.geometry.width,
            height: self.geometry.height,
            sequence: meta.sequence,
        })
    }
}

/// Upper bound for the first frame after stream on, before any readiness
/// can be observed.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);

fn poll_timeout_ms(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

fn capture_error(e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(libc::ENODEV) {
        CameraError::Closed
    } else if e.kind() == io::ErrorKind::TimedOut {
        CameraError::Capture(format!("no frame within {}ms of stream on", STARTUP_TIMEOUT.as_millis()))
    } else {
        CameraError::Capture(format!("failed to dequeue buffer: {e}"))
    }
}

impl FrameSource for V4lFrameSource {
    fn read_frame(&mut self) -> Result<Option<RawFrame>, CameraError> {
        if self.async_fd.is_some() {
            return Err(CameraError::StreamState(
                "source is registered for asynchronous reads".into(),
            ));
        }
        if self.streaming && !self.wait_readable(self.read_timeout)? {
            return Ok(None);
        }
        self.next_buffer().map(Some)
    }
}

impl AsyncFrameSource for V4lFrameSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CameraError> {
        self.register_async()?;

        // The device reports no readiness before stream on; the first frame
        // is waited for inside `next`.
        if !self.streaming {
            return self.next_buffer().map(Some);
        }

        loop {
            let ready = {
                let Some(async_fd) = self.async_fd.as_ref() else {
                    return Err(CameraError::StreamState("device not registered".into()));
                };
                let mut guard = async_fd
                    .readable()
                    .await
                    .map_err(|e| CameraError::Capture(format!("readiness wait failed: {e}")))?;
                let ready = self.wait_readable(Duration::ZERO)?;
                if !ready {
                    guard.clear_ready();
                }
                ready
            };
            if ready {
                return self.next_buffer().map(Some);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_ms() {
        assert_eq!(poll_timeout_ms(Duration::ZERO), 0);
        assert_eq!(poll_timeout_ms(DEFAULT_READ_TIMEOUT), 200);
        assert_eq!(poll_timeout_ms(Duration::from_secs(u64::MAX)), i32::MAX);
    }

    #[test]
    fn test_unplugged_device_closes_source() {
        let err = capture_error(io::Error::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, CameraError::Closed));
    }

    #[test]
    fn test_startup_timeout_is_capture_error() {
        let err = capture_error(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"));
        match err {
            CameraError::Capture(msg) => assert!(msg.contains("2000ms"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_errors_are_capture_errors() {
        let err = capture_error(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, CameraError::Capture(_)));
    }
}
