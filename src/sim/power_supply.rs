//! Power supply model speaking the STX/DLE/ETX protocol.

use crate::codec::framed::{bcc, stuff, unstuff, DLE, ETX, NAK, STX};
use crate::transport::mock::{MockTransport, Responder};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Mode register offset: the device reports modes as `0x8000 | mode`.
pub const MODE_OFFSET: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Handshake done, expecting a frame.
    Ready,
    /// Read frame accepted, waiting for the host's DLE.
    ReadPending(u8),
    /// Payload sent, waiting for the closing DLE.
    Closing,
}

#[derive(Debug)]
struct SupplyState {
    phase: Phase,
    registers: BTreeMap<u8, u16>,
    nak_budget: u32,
    glitch_budget: u32,
    frames: Vec<Vec<u8>>,
}

/// Shared-state power supply model.
#[derive(Debug, Clone)]
pub struct PowerSupplyDevice {
    state: Arc<Mutex<SupplyState>>,
}

impl Default for PowerSupplyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSupplyDevice {
    /// Unipolar-negative mode, output off.
    pub fn new() -> Self {
        let registers = BTreeMap::from([
            (0, MODE_OFFSET | 0x0002),
            (2, 0),
            (13, 0),
            (14, 0),
            (20, 0),
            (21, 0),
        ]);
        Self {
            state: Arc::new(Mutex::new(SupplyState {
                phase: Phase::Idle,
                registers,
                nak_budget: 0,
                glitch_budget: 0,
                frames: Vec::new(),
            })),
        }
    }

    pub fn set_register(&self, address: u8, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn register(&self, address: u8) -> u16 {
        self.state.lock().registers.get(&address).copied().unwrap_or(0)
    }

    /// Refuse the next `count` handshakes with NAK.
    pub fn nak_next(&self, count: u32) {
        self.state.lock().nak_budget = count;
    }

    /// Corrupt the next `count` read payloads with 0xFFFF.
    pub fn glitch_next_reads(&self, count: u32) {
        self.state.lock().glitch_budget = count;
    }

    /// Command frames accepted so far.
    pub fn accepted_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().frames.clone()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone())
    }
}

impl SupplyState {
    fn on_frame(&mut self, wire: &[u8]) -> Vec<u8> {
        let n = wire.len();
        if n < 13 || wire[n - 3] != DLE || wire[n - 2] != ETX || bcc(&wire[..n - 1]) != wire[n - 1] {
            self.phase = Phase::Idle;
            return vec![NAK];
        }
        let frame = unstuff(&wire[..n - 3]);
        if frame.len() < 10 {
            self.phase = Phase::Idle;
            return vec![NAK];
        }
        let address = frame[5];
        match (frame[2], frame.len()) {
            (0x45, 10) => {
                self.phase = Phase::ReadPending(address);
                return vec![DLE];
            }
            (0x41, 12) => {
                self.registers.insert(address, u16::from_be_bytes([frame[10], frame[11]]));
            }
            (0x41, 14) => {
                // Mode and status bits share the low nibble of register 0.
                self.registers.insert(0, MODE_OFFSET | u16::from(frame[11] & 0x0F));
            }
            (0x41, 18) => {
                for (i, chunk) in frame[10..18].chunks(2).enumerate() {
                    self.registers
                        .insert(4 + i as u8, u16::from_be_bytes([chunk[0], chunk[1]]));
                }
            }
            _ => {
                self.phase = Phase::Idle;
                return vec![NAK];
            }
        }
        if address == 1 && frame.len() == 12 {
            self.apply_command(u16::from_be_bytes([frame[10], frame[11]]));
        }
        self.frames.push(wire.to_vec());
        self.phase = Phase::Idle;
        vec![DLE]
    }

    fn apply_command(&mut self, command: u16) {
        let status = self.registers.entry(0).or_insert(MODE_OFFSET);
        match command {
            33 => *status |= 0x0001,
            32 => *status &= !0x0001,
            3 => {
                *status &= !0x0004;
                self.registers.insert(2, 0);
            }
            _ => {}
        }
    }

    fn payload(&mut self, address: u8) -> Vec<u8> {
        let value = if self.glitch_budget > 0 {
            self.glitch_budget -= 1;
            0xFFFF
        } else {
            self.registers.get(&address).copied().unwrap_or(0)
        };
        let [hi, lo] = value.to_be_bytes();
        let mut payload = stuff(&[0, 0, 0x45, 0x44, 0, address, hi, lo]);
        payload.push(ETX);
        payload.push(bcc(&payload));
        payload
    }
}

impl Responder for PowerSupplyDevice {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        match (state.phase, request) {
            (_, [STX]) => {
                if state.nak_budget > 0 {
                    state.nak_budget -= 1;
                    state.phase = Phase::Idle;
                    vec![NAK]
                } else {
                    state.phase = Phase::Ready;
                    vec![DLE]
                }
            }
            (Phase::Ready, frame) => state.on_frame(frame),
            (Phase::ReadPending(address), [DLE]) => {
                state.phase = Phase::Closing;
                state.payload(address)
            }
            (Phase::Closing, [DLE]) => {
                state.phase = Phase::Idle;
                Vec::new()
            }
            _ => {
                state.phase = Phase::Idle;
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framed::{encode_read, FramedCommand};

    #[test]
    fn read_takes_four_turns() {
        let mut device = PowerSupplyDevice::new();
        device.set_register(13, 500);
        assert_eq!(device.respond(&[STX]), vec![DLE]);
        assert_eq!(device.respond(&encode_read(13)), vec![DLE]);
        let payload = device.respond(&[DLE]);
        assert_eq!(&payload[6..8], &[0x01, 0xF4]);
        assert!(device.respond(&[DLE]).is_empty());
    }

    #[test]
    fn dle_valued_registers_survive_the_wire() {
        let mut device = PowerSupplyDevice::new();
        device.respond(&[STX]);
        let ack = device.respond(
            &FramedCommand::WriteRegister { address: 13, value: 0x1010 }.encode(),
        );
        assert_eq!(ack, vec![DLE]);
        assert_eq!(device.register(13), 0x1010);

        device.respond(&[STX]);
        device.respond(&encode_read(13));
        let payload = device.respond(&[DLE]);
        assert_eq!(&payload[6..10], &[DLE, DLE, DLE, DLE]);
    }

    #[test]
    fn frames_without_handshake_are_ignored() {
        let mut device = PowerSupplyDevice::new();
        let frame = FramedCommand::WriteRegister { address: 13, value: 9 }.encode();
        assert!(device.respond(&frame).is_empty());
        assert_eq!(device.register(13), 0);
    }

    #[test]
    fn output_command_sets_the_dc_bit() {
        let mut device = PowerSupplyDevice::new();
        device.respond(&[STX]);
        device.respond(&FramedCommand::WriteRegister { address: 1, value: 33 }.encode());
        assert_eq!(device.register(0) & 0x0001, 1);
        assert_eq!(device.accepted_frames().len(), 1);
    }
}
