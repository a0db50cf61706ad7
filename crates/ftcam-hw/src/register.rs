//! Register command framing and the SET_CUR/GET_CUR handshake.
//!
//! Commands are written to selector 2 of the extension unit through a
//! 384-byte buffer. The device acknowledges asynchronously: GET_CUR returns
//! `0x55` while the command is still running and `0x56` followed by the
//! first 16 bytes of the command once it has finished.

use crate::xu::{ControlTransport, XuError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Selector carrying register commands.
pub const XU_SELECTOR: u8 = 0x02;
/// Size of the send and receive buffers (the selector's wire length).
pub const BUFFER_LEN: usize = 384;
/// Size of a register command frame.
pub const COMMAND_LEN: usize = 17;
/// Register id of the image sensor.
pub const REG_SENSOR: u8 = 0xab;

pub const RESPONSE_PENDING: u8 = 0x55;
pub const RESPONSE_FINISHED: u8 = 0x56;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

const FRAME_MARKER: u8 = 0x60;
const PAGE_ADDRESS: [u8; 4] = [0x90, 0x01, 0x00, 0x01];
/// A finished response repeats the command minus its last byte.
const ECHO_LEN: usize = 16;
/// Where a finished get response carries the register value.
const GET_VALUE_OFFSET: usize = 17;

/// Command task code (byte 0 of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Task {
    Set = 0x50,
    Get = 0x51,
}

/// How 32-bit addresses and values are split into the frame's 4-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterEncoding {
    /// Big-endian byte split.
    #[default]
    Shift,
    /// Reproduces the vendor tool's split, which compares instead of
    /// shifting: the three high bytes become `x > 24`, `x > 16`, `x > 8`.
    /// At 1-byte widths the device only reads byte 3, where both encodings
    /// agree. Use this to match captured USB traces byte for byte.
    LegacyComparison,
}

impl RegisterEncoding {
    pub fn split(self, x: u32) -> [u8; 4] {
        match self {
            Self::Shift => x.to_be_bytes(),
            Self::LegacyComparison => [
                u8::from(x > 24),
                u8::from(x > 16),
                u8::from(x > 8),
                (x & 0xff) as u8,
            ],
        }
    }
}

/// A 17-byte register command:
/// `[task][register][0x60][addr_width][val_width][addr;4][0x90,0x01,0x00,0x01][value;4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCommand([u8; COMMAND_LEN]);

impl RegisterCommand {
    /// Build a frame with 1-byte address and value widths.
    pub fn new(task: Task, register: u8, address: u32, value: u32, encoding: RegisterEncoding) -> Self {
        let mut frame = [0u8; COMMAND_LEN];
        frame[0] = task as u8;
        frame[1] = register;
        frame[2] = FRAME_MARKER;
        frame[3] = 1; // address width in bytes
        frame[4] = 1; // value width in bytes
        frame[5..9].copy_from_slice(&encoding.split(address));
        frame[9..13].copy_from_slice(&PAGE_ADDRESS);
        frame[13..17].copy_from_slice(&encoding.split(value));
        Self(frame)
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn task(&self) -> u8 {
        self.0[0]
    }

    pub fn register(&self) -> u8 {
        self.0[1]
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Query(#[from] XuError),
    #[error("set_cur({command}): timeout after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },
    #[error("set_cur({command}): response not matching command: {response}")]
    Mismatch { command: String, response: String },
    #[error("set_cur({command}): invalid response status {status:#04x}")]
    InvalidResponse { command: String, status: u8 },
    #[error("command of {0} bytes does not fit the {BUFFER_LEN}-byte send buffer")]
    CommandTooLong(usize),
}

/// Register read/write on top of a [`ControlTransport`].
///
/// Blocking: every handshake runs to completion or timeout before
/// returning. Must not be driven concurrently with other ioctl traffic
/// on the same device.
pub struct RegisterProtocol<T> {
    transport: T,
    send: [u8; BUFFER_LEN],
    receive: [u8; BUFFER_LEN],
    poll_interval: Duration,
    encoding: RegisterEncoding,
}

impl<T: ControlTransport> RegisterProtocol<T> {
    pub fn new(transport: T, poll_interval: Duration, encoding: RegisterEncoding) -> Self {
        Self {
            transport,
            send: [0; BUFFER_LEN],
            receive: [0; BUFFER_LEN],
            poll_interval,
            encoding,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn encoding(&self) -> RegisterEncoding {
        self.encoding
    }

    /// The buffer filled by the most recent GET_CUR poll.
    pub fn last_response(&self) -> &[u8; BUFFER_LEN] {
        &self.receive
    }

    /// Wire length of the command selector.
    pub fn wire_len(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.transport.get_len(XU_SELECTOR)?)
    }

    /// Send `command` and poll until the device reports it finished.
    pub fn set_cur(&mut self, command: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        self.load_send_buffer(command)?;
        self.transport.set_cur(XU_SELECTOR, &mut self.send)?;
        tracing::debug!(command = %hex(command), "set_cur");
        self.await_finished(timeout)
    }

    /// Send `command` without waiting for an acknowledgement.
    pub fn set_cur_no_response(&mut self, command: &[u8]) -> Result<(), ProtocolError> {
        self.load_send_buffer(command)?;
        self.transport.set_cur(XU_SELECTOR, &mut self.send)?;
        tracing::debug!(command = %hex(command), "set_cur_no_response");
        Ok(())
    }

    /// Write a register. A zero `timeout` sends without handshake.
    pub fn set_register(
        &mut self,
        register: u8,
        address: u32,
        value: u32,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let command = RegisterCommand::new(Task::Set, register, address, value, self.encoding);
        if timeout.is_zero() {
            self.set_cur_no_response(command.as_bytes())
        } else {
            self.set_cur(command.as_bytes(), timeout)
        }
    }

    /// Read a register through the handshaked path.
    pub fn get_register(&mut self, register: u8, address: u32, timeout: Duration) -> Result<u8, ProtocolError> {
        let command = RegisterCommand::new(Task::Get, register, address, 0, self.encoding);
        self.set_cur(command.as_bytes(), timeout)?;
        Ok(self.receive[GET_VALUE_OFFSET])
    }

    pub fn set_register_sensor(&mut self, address: u32, value: u32, timeout: Duration) -> Result<(), ProtocolError> {
        self.set_register(REG_SENSOR, address, value, timeout)
    }

    pub fn get_register_sensor(&mut self, address: u32, timeout: Duration) -> Result<u8, ProtocolError> {
        self.get_register(REG_SENSOR, address, timeout)
    }

    fn load_send_buffer(&mut self, command: &[u8]) -> Result<(), ProtocolError> {
        if command.len() > BUFFER_LEN {
            return Err(ProtocolError::CommandTooLong(command.len()));
        }
        self.send.fill(0);
        self.send[..command.len()].copy_from_slice(command);
        Ok(())
    }

    fn await_finished(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        let start = Instant::now();
        loop {
            self.receive.fill(0);
            self.transport.get_cur(XU_SELECTOR, &mut self.receive)?;

            match self.receive[0] {
                RESPONSE_PENDING => tracing::trace!("get_cur: pending"),
                RESPONSE_FINISHED => {
                    if self.receive[1..=ECHO_LEN] == self.send[..ECHO_LEN] {
                        tracing::trace!(elapsed = ?start.elapsed(), "get_cur: finished");
                        return Ok(());
                    }
                    return Err(ProtocolError::Mismatch {
                        command: hex(&self.send[..ECHO_LEN]),
                        response: hex(&self.receive[..=ECHO_LEN]),
                    });
                }
                status => {
                    return Err(ProtocolError::InvalidResponse {
                        command: hex(&self.send[..ECHO_LEN]),
                        status,
                    });
                }
            }

            let elapsed = start.elapsed();
            if elapsed > timeout {
                return Err(ProtocolError::Timeout {
                    command: hex(&self.send[..ECHO_LEN]),
                    elapsed,
                });
            }
            if !self.poll_interval.is_zero() {
                std::thread::sleep(self.poll_interval);
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(ECHO_LEN)];
    shown
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
