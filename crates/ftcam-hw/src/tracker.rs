//! VIVE Facial Tracker detection, activation and deactivation.
//!
//! The tracker streams nothing until its sensors are programmed and the
//! data stream is switched on through the extension unit. Activation is
//! all-or-nothing: any failure switches the stream back off before the
//! error is returned.

use crate::filter::MedianBlur;
use crate::register::{
    ProtocolError, RegisterEncoding, RegisterProtocol, Task, BUFFER_LEN, DEFAULT_POLL_INTERVAL,
    DEFAULT_TIMEOUT,
};
use crate::xu::ControlTransport;
use std::time::Duration;
use thiserror::Error;
use tracing::Span;

/// GET_LEN of the command selector on a genuine tracker.
pub const DETECT_WIRE_LEN: u16 = BUFFER_LEN as u16;

/// Sensor `(address, value)` pairs written during activation, in order.
/// Exposure, gain, black level and gamma. These values give the cleanest
/// image; other values were tried and were worse.
pub const SENSOR_DEFAULTS: [(u8, u8); 11] = [
    (0x00, 0x40),
    (0x08, 0x01),
    (0x70, 0x00),
    (0x02, 0xff),
    (0x03, 0xff),
    (0x04, 0xff),
    (0x0e, 0x00),
    (0x05, 0xb2),
    (0x06, 0xb2),
    (0x07, 0xb2),
    (0x0f, 0x03),
];

/// Stream toggle sub-command.
const STREAM_TOGGLE: u8 = 0x14;

/// The 384-byte probe sent ahead of every command group.
pub fn probe_frame() -> [u8; BUFFER_LEN] {
    let mut frame = [0u8; BUFFER_LEN];
    frame[0] = 0x51;
    frame[1] = 0x52;
    frame[254] = 0x53;
    frame[255] = 0x54;
    frame
}

/// Fire-and-forget command switching the data stream on or off.
pub fn stream_command(enable: bool) -> [u8; 4] {
    [Task::Set as u8, STREAM_TOGGLE, 0x00, u8::from(enable)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unattached,
    Detecting,
    Activating,
    Active,
    Deactivating,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Not a tracker. Callers should carry on without one.
    #[error("device detection failed: {0}")]
    Detection(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cannot {operation} while tracker is {state:?}")]
    StreamState {
        operation: &'static str,
        state: TrackerState,
    },
}

impl TrackerError {
    pub fn is_not_detected(&self) -> bool {
        matches!(self, Self::Detection(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerOptions {
    /// Handshake timeout for every acknowledged command.
    pub handshake_timeout: Duration,
    /// Pause between GET_CUR polls while a command is pending.
    pub poll_interval: Duration,
    /// Pause after toggling the stream.
    pub settle_delay: Duration,
    pub encoding: RegisterEncoding,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: Duration::from_millis(250),
            encoding: RegisterEncoding::default(),
        }
    }
}

/// A VIVE Facial Tracker attached through an extension-unit transport.
///
/// Dropping an active tracker deactivates it; use [`ViveTracker::release`]
/// to leave the stream running.
pub struct ViveTracker<T: ControlTransport> {
    protocol: RegisterProtocol<T>,
    state: TrackerState,
    options: TrackerOptions,
    span: Span,
}

impl<T: ControlTransport> ViveTracker<T> {
    pub fn new(transport: T, options: TrackerOptions) -> Self {
        Self {
            protocol: RegisterProtocol::new(transport, options.poll_interval, options.encoding),
            state: TrackerState::Unattached,
            options,
            span: tracing::info_span!("tracker"),
        }
    }

    /// Log under `span` instead of the default `tracker` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Detect and activate in one step.
    pub fn attach(transport: T, options: TrackerOptions) -> Result<Self, TrackerError> {
        let mut tracker = Self::new(transport, options);
        tracker.detect()?;
        tracker.activate()?;
        Ok(tracker)
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        self.protocol.transport()
    }

    /// Filter to apply to frames while this tracker is active.
    pub fn post_processor(&self) -> MedianBlur {
        MedianBlur::default()
    }

    /// Check the command selector's wire length, then confirm the device
    /// acknowledges a probe. Other devices never receive the probe.
    pub fn detect(&mut self) -> Result<(), TrackerError> {
        self.require(TrackerState::Unattached, "detect")?;
        let _enter = self.span.clone().entered();
        self.state = TrackerState::Detecting;

        // Length check before the probe: nothing is written to a foreign device.
        let len = match self.protocol.wire_len() {
            Ok(len) => len,
            Err(e) => {
                self.state = TrackerState::Unattached;
                return Err(TrackerError::Detection(format!("GET_LEN failed: {e}")));
            }
        };
        if len != DETECT_WIRE_LEN {
            self.state = TrackerState::Unattached;
            return Err(TrackerError::Detection(format!(
                "length check failed: {len} instead of {DETECT_WIRE_LEN}"
            )));
        }

        if let Err(e) = self.send_probe() {
            self.state = TrackerState::Unattached;
            return Err(e.into());
        }

        tracing::info!("vive tracker detected");
        Ok(())
    }

    /// Program the sensor and switch the stream on.
    ///
    /// On failure the tracker is deactivated before the error is returned.
    pub fn activate(&mut self) -> Result<(), TrackerError> {
        self.require(TrackerState::Detecting, "activate")?;
        let _enter = self.span.clone().entered();
        self.state = TrackerState::Activating;
        tracing::info!("activate vive tracker");

        match self.run_activation() {
            Ok(()) => {
                self.state = TrackerState::Active;
                tracing::info!("vive tracker active");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "activation failed; deactivating");
                self.deactivate();
                Err(e.into())
            }
        }
    }

    fn run_activation(&mut self) -> Result<(), ProtocolError> {
        tracing::info!("-> disable stream");
        self.set_stream(false)?;

        tracing::info!("-> set camera parameters");
        self.send_probe()?;
        for (address, value) in SENSOR_DEFAULTS {
            self.protocol.set_register_sensor(
                u32::from(address),
                u32::from(value),
                self.options.handshake_timeout,
            )?;
        }

        tracing::info!("-> enable stream");
        self.set_stream(true)
    }

    /// Switch the stream off. Best effort: failures are logged and the
    /// tracker always ends up `Unattached`.
    pub fn deactivate(&mut self) {
        if self.state == TrackerState::Unattached {
            return;
        }
        let _enter = self.span.clone().entered();
        self.state = TrackerState::Deactivating;
        tracing::info!("deactivate vive tracker");

        if let Err(e) = self.send_probe() {
            tracing::warn!(error = %e, "probe before disabling stream failed");
        }
        if let Err(e) = self.protocol.set_cur_no_response(&stream_command(false)) {
            tracing::warn!(error = %e, "disabling stream failed");
        }
        self.settle();
        self.state = TrackerState::Unattached;
    }

    /// Deactivate and drop.
    pub fn dispose(mut self) {
        tracing::info!(parent: &self.span, "dispose vive tracker");
        self.deactivate();
    }

    /// Drop without deactivating, leaving the stream in whatever state it is.
    pub fn release(mut self) {
        self.state = TrackerState::Unattached;
    }

    /// Read one sensor register.
    pub fn read_sensor_register(&mut self, address: u8) -> Result<u8, TrackerError> {
        self.require_attached("read sensor register")?;
        let timeout = self.options.handshake_timeout;
        Ok(self.protocol.get_register_sensor(u32::from(address), timeout)?)
    }

    /// Write one sensor register with a handshake.
    pub fn write_sensor_register(&mut self, address: u8, value: u8) -> Result<(), TrackerError> {
        self.require_attached("write sensor register")?;
        let timeout = self.options.handshake_timeout;
        self.protocol
            .set_register_sensor(u32::from(address), u32::from(value), timeout)?;
        Ok(())
    }

    /// Current values of every register the activation sequence programs.
    pub fn read_sensor_registers(&mut self) -> Result<Vec<(u8, u8)>, TrackerError> {
        self.require_attached("read sensor registers")?;
        let _enter = self.span.clone().entered();
        self.send_probe()?;
        let mut values = Vec::with_capacity(SENSOR_DEFAULTS.len());
        for (address, _) in SENSOR_DEFAULTS {
            let value = self
                .protocol
                .get_register_sensor(u32::from(address), self.options.handshake_timeout)?;
            values.push((address, value));
        }
        Ok(values)
    }

    fn send_probe(&mut self) -> Result<(), ProtocolError> {
        self.protocol
            .set_cur(&probe_frame(), self.options.handshake_timeout)
    }

    fn set_stream(&mut self, enable: bool) -> Result<(), ProtocolError> {
        self.send_probe()?;
        self.protocol.set_cur_no_response(&stream_command(enable))?;
        self.settle();
        Ok(())
    }

    fn settle(&self) {
        if !self.options.settle_delay.is_zero() {
            std::thread::sleep(self.options.settle_delay);
        }
    }

    fn require(&self, expected: TrackerState, operation: &'static str) -> Result<(), TrackerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TrackerError::StreamState {
                operation,
                state: self.state,
            })
        }
    }

    fn require_attached(&self, operation: &'static str) -> Result<(), TrackerError> {
        match self.state {
            TrackerState::Detecting | TrackerState::Active => Ok(()),
            state => Err(TrackerError::StreamState { operation, state }),
        }
    }
}

impl<T: ControlTransport> Drop for ViveTracker<T> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Switch the stream off without detection, for a tracker left running
/// by an earlier `release`.
pub fn disable_stream<T: ControlTransport>(transport: T, options: TrackerOptions) -> Result<(), TrackerError> {
    let mut protocol = RegisterProtocol::new(transport, options.poll_interval, options.encoding);
    protocol.set_cur(&probe_frame(), options.handshake_timeout)?;
    protocol.set_cur_no_response(&stream_command(false))?;
    if !options.settle_delay.is_zero() {
        std::thread::sleep(options.settle_delay);
    }
    Ok(())
}
