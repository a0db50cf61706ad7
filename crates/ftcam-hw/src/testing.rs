//! In-memory stand-in for the tracker's extension unit.

use crate::register::{BUFFER_LEN, RESPONSE_FINISHED, RESPONSE_PENDING};
use crate::xu::{ControlTransport, UvcQuery, XuError};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Normal,
    NeverFinish,
    CorruptEcho,
    Status(u8),
}

/// Answers GET_LEN, records SET_CUR payloads and acknowledges them the way
/// the real device does after `pending_polls` pending responses.
pub(crate) struct SimulatedTracker {
    pub wire_len: u16,
    pub pending_polls: usize,
    pub behavior: Behavior,
    pub fail_get_len: bool,
    /// Fail the n-th SET_CUR attempt (0-based).
    pub fail_set_cur_at: Option<usize>,
    pub sent: Vec<Vec<u8>>,
    pub get_cur_count: usize,
    set_cur_attempts: usize,
    registers: HashMap<u8, u8>,
    last: [u8; BUFFER_LEN],
    pending_left: usize,
}

impl SimulatedTracker {
    pub fn new() -> Self {
        Self {
            wire_len: BUFFER_LEN as u16,
            pending_polls: 0,
            behavior: Behavior::Normal,
            fail_get_len: false,
            fail_set_cur_at: None,
            sent: Vec::new(),
            get_cur_count: 0,
            set_cur_attempts: 0,
            registers: HashMap::new(),
            last: [0; BUFFER_LEN],
            pending_left: 0,
        }
    }

    pub fn sensor_register(&self, address: u8) -> Option<u8> {
        self.registers.get(&address).copied()
    }

    pub fn set_sensor_register(&mut self, address: u8, value: u8) {
        self.registers.insert(address, value);
    }

    /// First four bytes of every SET_CUR payload, in order.
    pub fn sent_heads(&self) -> Vec<[u8; 4]> {
        self.sent
            .iter()
            .map(|p| [p[0], p[1], p[2], p[3]])
            .collect()
    }

    fn is_register_command(payload: &[u8]) -> bool {
        payload[2] == 0x60 && payload[1] == crate::register::REG_SENSOR
    }
}

impl ControlTransport for SimulatedTracker {
    fn query(&mut self, selector: u8, query: UvcQuery, data: &mut [u8]) -> Result<(), XuError> {
        let io_error = |source| XuError::ControlQueryIo {
            selector,
            query,
            source,
        };

        match query {
            UvcQuery::GetLen => {
                if self.fail_get_len {
                    return Err(io_error(nix::errno::Errno::ENOENT));
                }
                data.copy_from_slice(&self.wire_len.to_le_bytes());
            }
            UvcQuery::SetCur => {
                let attempt = self.set_cur_attempts;
                self.set_cur_attempts += 1;
                if self.fail_set_cur_at == Some(attempt) {
                    return Err(io_error(nix::errno::Errno::EIO));
                }
                self.last.fill(0);
                let n = data.len().min(BUFFER_LEN);
                self.last[..n].copy_from_slice(&data[..n]);
                self.sent.push(data.to_vec());
                self.pending_left = self.pending_polls;

                if data[0] == 0x50 && Self::is_register_command(data) {
                    self.registers.insert(data[8], data[16]);
                }
            }
            UvcQuery::GetCur => {
                self.get_cur_count += 1;
                data.fill(0);
                if self.behavior == Behavior::NeverFinish || self.pending_left > 0 {
                    self.pending_left = self.pending_left.saturating_sub(1);
                    data[0] = RESPONSE_PENDING;
                    return Ok(());
                }
                match self.behavior {
                    Behavior::Status(status) => data[0] = status,
                    Behavior::CorruptEcho => {
                        data[0] = RESPONSE_FINISHED;
                        data[1..17].copy_from_slice(&self.last[..16]);
                        data[1] ^= 0xff;
                    }
                    Behavior::Normal | Behavior::NeverFinish => {
                        data[0] = RESPONSE_FINISHED;
                        data[1..17].copy_from_slice(&self.last[..16]);
                        data[17] = if self.last[0] == 0x51 && Self::is_register_command(&self.last) {
                            self.registers.get(&self.last[8]).copied().unwrap_or(0)
                        } else {
                            self.last[16]
                        };
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
