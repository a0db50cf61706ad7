//! Raw UVC extension-unit queries via `UVCIOC_CTRL_QUERY`.
//!
//! Every query targets the tracker's vendor extension unit. Failures are
//! reported once and never retried here; retry and timeout policy belongs
//! to the register protocol above.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension unit id of the tracker's vendor controls.
pub const XU_UNIT_ID: u8 = 4;

/// UVC request codes (`UVC_SET_CUR`, `UVC_GET_*` in `<linux/usb/video.h>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UvcQuery {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl UvcQuery {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Mirror of `struct uvc_xu_control_query` from `<linux/uvcvideo.h>`.
///
/// Layout (64-bit Linux):
///   unit:u8 selector:u8 query:u8 _pad0:u8 size:u16 _pad1:u16 data:*mut u8
/// Total: 1+1+1+1+2+2+8 = 16 bytes, checked below.
#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    _pad0: u8,
    size: u16,
    _pad1: u16,
    data: *mut u8,
}

#[cfg(target_pointer_width = "64")]
const _SIZE_ASSERT: () = assert!(
    std::mem::size_of::<UvcXuControlQuery>() == 16,
    "UvcXuControlQuery must be 16 bytes to match the kernel ABI"
);

mod ioctl {
    use super::UvcXuControlQuery;

    // _IOWR('u', 0x21, struct uvc_xu_control_query)
    nix::ioctl_readwrite!(uvcioc_ctrl_query, b'u', 0x21, UvcXuControlQuery);
}

#[derive(Debug, Error)]
pub enum XuError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("extension unit query {query:?} on selector {selector:#04x} failed: {source}")]
    ControlQueryIo {
        selector: u8,
        query: UvcQuery,
        source: nix::errno::Errno,
    },
    #[error("payload of {0} bytes exceeds the 16-bit query size field")]
    PayloadTooLarge(usize),
}

/// Anything that can carry an extension-unit query to the device.
///
/// `data.len()` is the wire size of the query. For `GET_*` queries the
/// device writes its answer into `data`.
pub trait ControlTransport {
    fn query(&mut self, selector: u8, query: UvcQuery, data: &mut [u8]) -> Result<(), XuError>;

    /// Wire length of `selector` (`GET_LEN`, 2 bytes little-endian).
    fn get_len(&mut self, selector: u8) -> Result<u16, XuError> {
        let mut len = [0u8; 2];
        self.query(selector, UvcQuery::GetLen, &mut len)?;
        Ok(u16::from_le_bytes(len))
    }

    /// Read the current value of `selector` into `data`.
    fn get_cur(&mut self, selector: u8, data: &mut [u8]) -> Result<(), XuError> {
        self.query(selector, UvcQuery::GetCur, data)
    }

    /// Write `data` as the current value of `selector`.
    fn set_cur(&mut self, selector: u8, data: &mut [u8]) -> Result<(), XuError> {
        self.query(selector, UvcQuery::SetCur, data)
    }
}

impl<T: ControlTransport + ?Sized> ControlTransport for &mut T {
    fn query(&mut self, selector: u8, query: UvcQuery, data: &mut [u8]) -> Result<(), XuError> {
        (**self).query(selector, query, data)
    }
}

/// Extension-unit control channel on an open `/dev/videoN` node.
pub struct ControlChannel {
    file: File,
    device_path: PathBuf,
}

impl ControlChannel {
    /// Open the device with read+write access, as UVC ioctls require.
    ///
    /// This is a separate file descriptor from any capture stream on the
    /// same node; the driver serialises them.
    pub fn open(device_path: impl AsRef<Path>) -> Result<Self, XuError> {
        let device_path = device_path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .map_err(|source| XuError::Open {
                path: device_path.clone(),
                source,
            })?;
        tracing::debug!(device = %device_path.display(), "opened extension unit channel");
        Ok(Self { file, device_path })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

impl ControlTransport for ControlChannel {
    fn query(&mut self, selector: u8, query: UvcQuery, data: &mut [u8]) -> Result<(), XuError> {
        let size = u16::try_from(data.len()).map_err(|_| XuError::PayloadTooLarge(data.len()))?;

        let mut request = UvcXuControlQuery {
            unit: XU_UNIT_ID,
            selector,
            query: query.code(),
            _pad0: 0,
            size,
            _pad1: 0,
            data: data.as_mut_ptr(),
        };

        // SAFETY:
        // - fd is valid for the lifetime of `self.file`
        // - `request` is repr(C) and matches the kernel ABI
        // - `data` is valid for `size` bytes for the duration of this call
        unsafe { ioctl::uvcioc_ctrl_query(self.file.as_raw_fd(), &mut request) }
            .map(|_| ())
            .map_err(|source| XuError::ControlQueryIo {
                selector,
                query,
                source,
            })
    }
}
