//! UC-2000 laser controller model.

use crate::codec::opcode::{checksum, LaserStatus, COMMAND_START, REMOTE_MODE, STATUS_QUERY};
use crate::transport::mock::{MockTransport, Responder};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Byte the controller returns for an accepted command.
const ACK: u8 = 0xAA;
const PWM_OPCODE: u8 = 0x7F;

#[derive(Debug)]
struct ControllerState {
    status: LaserStatus,
    commands: Vec<u8>,
    ignored: HashSet<u8>,
}

/// Shared-state laser controller. Starts in manual mode with the beam off.
#[derive(Debug, Clone)]
pub struct LaserController {
    state: Arc<Mutex<ControllerState>>,
}

impl Default for LaserController {
    fn default() -> Self {
        Self::new()
    }
}

impl LaserController {
    pub fn new() -> Self {
        let status = LaserStatus {
            pwm_frequency: 5,
            version: 2,
            ..LaserStatus::default()
        };
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                status,
                commands: Vec::new(),
                ignored: HashSet::new(),
            })),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut LaserStatus)) {
        f(&mut self.state.lock().status);
    }

    pub fn state(&self) -> LaserStatus {
        self.state.lock().status
    }

    /// Opcodes of every well-formed command frame received, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.state.lock().commands.clone()
    }

    /// Acknowledge `opcode` but leave the state unchanged.
    pub fn ignore_opcode(&self, opcode: u8) {
        self.state.lock().ignored.insert(opcode);
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone())
    }
}

fn apply(status: &mut LaserStatus, opcode: u8, data: Option<u8>) {
    match opcode {
        0x70..=0x74 => {
            status.mode = opcode - 0x70;
            status.remote_control = false;
        }
        0x75 => {
            status.mode = REMOTE_MODE;
            status.remote_control = true;
            status.laser_on = true;
        }
        0x76 => status.laser_on = false,
        0x77 => status.pwm_frequency = 5,
        0x78 => status.pwm_frequency = 10,
        0x79 => status.pwm_frequency = 20,
        0x7A | 0x7B => status.gate_pull_up = opcode == 0x7A,
        0x7C | 0x7D => status.max_pwm_95 = opcode == 0x7C,
        0x30 | 0x31 => status.lase_on_powerup = opcode == 0x30,
        PWM_OPCODE => {
            let raw = data.unwrap_or(0);
            status.pwm_raw = raw;
            status.power_raw = if status.laser_on { raw } else { 0 };
        }
        _ => {}
    }
}

impl Responder for LaserController {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        match request {
            [STATUS_QUERY] => state.status.encode().to_vec(),
            [COMMAND_START, opcode, rest @ ..] => {
                let (data, sum) = match (*opcode, rest) {
                    (PWM_OPCODE, [data, sum]) => (Some(*data), *sum),
                    (op, [sum]) if op != PWM_OPCODE => (None, *sum),
                    _ => return Vec::new(),
                };
                if checksum(*opcode, data) != sum {
                    return Vec::new();
                }
                state.commands.push(*opcode);
                if !state.ignored.contains(opcode) {
                    apply(&mut state.status, *opcode, data);
                }
                vec![ACK]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::opcode::encode_command;

    #[test]
    fn commands_need_a_valid_checksum() {
        let mut laser = LaserController::new();
        assert!(laser.respond(&[COMMAND_START, 0x75, 0x00]).is_empty());
        assert_eq!(laser.respond(&encode_command(0x75, None)), vec![ACK]);
        assert!(laser.state().remote_control);
        assert_eq!(laser.commands(), vec![0x75]);
    }

    #[test]
    fn pwm_tracks_power_while_lasing() {
        let mut laser = LaserController::new();
        laser.update(|s| s.laser_on = true);
        laser.respond(&encode_command(PWM_OPCODE, Some(60)));
        let status = LaserStatus::decode(&laser.respond(&[STATUS_QUERY])).unwrap();
        assert_eq!(status.pwm_percentage(), 30.0);
        assert_eq!(status.power_percentage(), 30.0);
    }
}
