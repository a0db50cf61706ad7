//! Known tracker models.
//!
//! Maps USB VID:PID and V4L2 card names to facial tracker models. Quirk
//! files are embedded at compile time from `contrib/hw/*.toml`.

use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

/// HTC VIVE Facial Tracker.
const QUIRK_0BB4_0321: &str = include_str!("../../../contrib/hw/0bb4-0321.toml");

static QUIRK_DB: OnceLock<Vec<QuirkFile>> = OnceLock::new();

/// Top-level quirk file structure (one per `contrib/hw/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct QuirkFile {
    pub device: DeviceInfo,
}

/// Tracker identification fields from the `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
    /// Substring of the V4L2 card name reported by the driver.
    pub card: String,
}

fn quirk_db() -> &'static Vec<QuirkFile> {
    QUIRK_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [QUIRK_0BB4_0321] {
            match toml::from_str::<QuirkFile>(src) {
                Ok(q) => db.push(q),
                Err(e) => tracing::warn!(error = %e, "bad quirk TOML"),
            }
        }
        db
    })
}

/// Look up a tracker model by USB vendor:product ID.
pub fn lookup_quirk(vid: u16, pid: u16) -> Option<&'static QuirkFile> {
    quirk_db()
        .iter()
        .find(|q| q.device.vendor_id == vid && q.device.product_id == pid)
}

pub fn list_quirks() -> &'static [QuirkFile] {
    quirk_db()
}

/// Whether a camera is a candidate tracker, by card name or USB IDs.
///
/// Candidates still have to pass extension-unit detection.
pub fn is_tracker_camera(card: &str, usb_ids: Option<(u16, u16)>) -> Option<&'static QuirkFile> {
    if let Some((vid, pid)) = usb_ids {
        if let Some(q) = lookup_quirk(vid, pid) {
            return Some(q);
        }
    }
    quirk_db()
        .iter()
        .find(|q| !q.device.card.is_empty() && card.contains(&q.device.card))
}

/// Read USB VID:PID from sysfs for a `/dev/videoN` device.
///
/// Returns `None` if the device is not USB or sysfs is unavailable.
pub fn get_usb_ids(device_path: &Path) -> Option<(u16, u16)> {
    // /dev/video2 -> "video2"
    let dev_name = device_path.file_name()?.to_str()?;
    // /sys/class/video4linux/video2/device links to the USB interface dir
    let device_link = format!("/sys/class/video4linux/{dev_name}/device");
    let interface_dir = std::fs::canonicalize(&device_link).ok()?;
    let usb_device_dir = interface_dir.parent()?;

    let vid_str = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid_str = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;

    let vid = u16::from_str_radix(vid_str.trim(), 16).ok()?;
    let pid = u16::from_str_radix(pid_str.trim(), 16).ok()?;
    Some((vid, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_quirk_parses() {
        let quirks = list_quirks();
        assert_eq!(quirks.len(), 1);
        assert_eq!(quirks[0].device.vendor_id, 0x0bb4);
        assert_eq!(quirks[0].device.product_id, 0x0321);
        assert_eq!(quirks[0].device.card, "HTC Multimedia Camera");
    }

    #[test]
    fn test_lookup_by_usb_ids() {
        assert!(lookup_quirk(0x0bb4, 0x0321).is_some());
        assert!(lookup_quirk(0x046d, 0x0825).is_none());
    }

    #[test]
    fn test_tracker_by_card_name() {
        let q = is_tracker_camera("HTC Multimedia Camera: HTC Multim", None).unwrap();
        assert_eq!(q.device.name, "VIVE Facial Tracker");
    }

    #[test]
    fn test_tracker_by_usb_ids_with_generic_card() {
        assert!(is_tracker_camera("USB Camera", Some((0x0bb4, 0x0321))).is_some());
    }

    #[test]
    fn test_other_camera_is_not_tracker() {
        assert!(is_tracker_camera("Integrated Camera", Some((0x04f2, 0xb6d9))).is_none());
        assert!(is_tracker_camera("", None).is_none());
    }

    #[test]
    fn test_usb_ids_for_missing_node() {
        assert_eq!(get_usb_ids(Path::new("/dev/video-does-not-exist")), None);
    }
}
