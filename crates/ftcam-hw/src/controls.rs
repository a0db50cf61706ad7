//! Standard V4L2 controls exposed for binding by a front end.
//!
//! Controls are enumerated once when the camera opens. Each descriptor
//! keeps a weak handle to the device, so reads and writes fail with
//! [`CameraError::Closed`] once the camera is gone.

use crate::camera::CameraError;
use serde::Serialize;
use std::sync::{Arc, Weak};
use v4l::control::{self, Control, Description, MenuItem, Value};
use v4l::Device;

/// Value range and presentation of a control.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlKind {
    Integer {
        min: i64,
        max: i64,
        step: u64,
        default: i64,
        /// Clamp out-of-range writes instead of rejecting them.
        clipping: bool,
    },
    Boolean {
        default: bool,
    },
    Select {
        /// `(index, label)` pairs as reported by the driver.
        choices: Vec<(u32, String)>,
        default: i64,
    },
}

impl ControlKind {
    /// Map a driver description. Only types v4l can read back as a single
    /// value are kept; buttons, strings, compound and class entries are
    /// skipped.
    fn from_description(desc: &Description) -> Option<Self> {
        match desc.typ {
            control::Type::Integer | control::Type::Integer64 => Some(Self::Integer {
                min: desc.minimum,
                max: desc.maximum,
                step: desc.step,
                default: desc.default,
                clipping: true,
            }),
            control::Type::Boolean => Some(Self::Boolean {
                default: desc.default != 0,
            }),
            control::Type::Menu => {
                let choices = desc
                    .items
                    .iter()
                    .flatten()
                    .map(|(index, item)| {
                        let label = match item {
                            MenuItem::Name(name) => name.clone(),
                            MenuItem::Value(v) => v.to_string(),
                        };
                        (*index, label)
                    })
                    .collect();
                Some(Self::Select {
                    choices,
                    default: desc.default,
                })
            }
            _ => None,
        }
    }

    pub fn default_value(&self) -> i64 {
        match self {
            Self::Integer { default, .. } | Self::Select { default, .. } => *default,
            Self::Boolean { default } => i64::from(*default),
        }
    }

    /// Validate `value` for a write, clamping integer values when clipping
    /// is enabled.
    pub fn check(&self, name: &str, value: i64) -> Result<i64, CameraError> {
        let range = |min: i64, max: i64| CameraError::ControlRange {
            name: name.to_string(),
            value,
            min,
            max,
        };
        match self {
            Self::Integer { min, max, clipping, .. } => {
                if (*min..=*max).contains(&value) {
                    Ok(value)
                } else if *clipping {
                    Ok(value.clamp(*min, *max))
                } else {
                    Err(range(*min, *max))
                }
            }
            Self::Boolean { .. } => match value {
                0 | 1 => Ok(value),
                _ => Err(range(0, 1)),
            },
            Self::Select { choices, .. } => {
                if choices.iter().any(|(i, _)| i64::from(*i) == value) {
                    Ok(value)
                } else {
                    let min = choices.iter().map(|(i, _)| i64::from(*i)).min().unwrap_or(0);
                    let max = choices.iter().map(|(i, _)| i64::from(*i)).max().unwrap_or(0);
                    Err(range(min, max))
                }
            }
        }
    }
}

/// Writes are refused for controls the driver marks as not settable.
pub fn is_writeable(flags: control::Flags) -> bool {
    !flags.intersects(
        control::Flags::READ_ONLY
            | control::Flags::DISABLED
            | control::Flags::GRABBED
            | control::Flags::INACTIVE,
    )
}

/// A live camera control.
#[derive(Debug, Clone)]
pub struct ControlDescriptor {
    id: u32,
    name: String,
    kind: ControlKind,
    flags: control::Flags,
    device: Weak<Device>,
}

/// Serializable snapshot of a control and its current value.
#[derive(Debug, Clone, Serialize)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub kind: ControlKind,
    pub writeable: bool,
    pub value: Option<i64>,
}

impl ControlDescriptor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ControlKind {
        &self.kind
    }

    /// Re-queried from the driver on every call; auto modes can lock
    /// other controls at runtime.
    pub fn is_writeable(&self) -> bool {
        let Some(device) = self.device.upgrade() else {
            return false;
        };
        match device.query_controls() {
            Ok(descs) => descs
                .iter()
                .find(|d| d.id == self.id)
                .map_or(false, |d| is_writeable(d.flags)),
            Err(_) => is_writeable(self.flags),
        }
    }

    /// Toggle clamping for integer controls. No effect on other kinds.
    pub fn set_clipping(&mut self, enabled: bool) {
        if let ControlKind::Integer { clipping, .. } = &mut self.kind {
            *clipping = enabled;
        }
    }

    fn device(&self) -> Result<Arc<Device>, CameraError> {
        self.device.upgrade().ok_or(CameraError::Closed)
    }

    fn control_err(&self, reason: impl Into<String>) -> CameraError {
        CameraError::Control {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> Result<i64, CameraError> {
        let device = self.device()?;
        let control = device
            .control(self.id)
            .map_err(|e| self.control_err(e.to_string()))?;
        match control.value {
            Value::Integer(v) => Ok(v),
            Value::Boolean(b) => Ok(i64::from(b)),
            other => Err(self.control_err(format!("unexpected value {other:?}"))),
        }
    }

    /// Write a value, returning what was actually written after clipping.
    pub fn set_value(&self, value: i64) -> Result<i64, CameraError> {
        let value = self.kind.check(&self.name, value)?;
        let device = self.device()?;
        if !self.is_writeable() {
            return Err(self.control_err("not writeable"));
        }

        let value = match self.kind {
            ControlKind::Boolean { .. } => Value::Boolean(value != 0),
            _ => Value::Integer(value),
        };
        tracing::debug!(control = %self.name, value = ?value, "set control");
        device
            .set_control(Control { id: self.id, value })
            .map_err(|e| self.control_err(e.to_string()))?;
        self.value()
    }

    pub fn reset(&self) -> Result<i64, CameraError> {
        self.set_value(self.kind.default_value())
    }

    pub fn info(&self) -> ControlInfo {
        ControlInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            writeable: self.is_writeable(),
            value: self.value().ok(),
        }
    }
}

/// Enumerate the bindable controls of an open device.
pub fn enumerate(device: &Arc<Device>) -> Result<Vec<ControlDescriptor>, CameraError> {
    let descs = device.query_controls().map_err(|e| CameraError::Control {
        name: "*".into(),
        reason: format!("failed to query controls: {e}"),
    })?;

    let weak = Arc::downgrade(device);
    let controls: Vec<ControlDescriptor> = descs
        .iter()
        .filter_map(|desc| {
            let kind = ControlKind::from_description(desc)?;
            Some(ControlDescriptor {
                id: desc.id,
                name: desc.name.clone(),
                kind,
                flags: desc.flags,
                device: weak.clone(),
            })
        })
        .collect();

    tracing::debug!(count = controls.len(), "enumerated controls");
    Ok(controls)
}
