//! Alicat flow controller model.

use crate::codec::ascii::{gas_name, AlicatStatus, AsciiCommand, ControlLoop, MixComponent, MIX_NUMBERS};
use crate::transport::mock::{MockTransport, Responder};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const ARGON: u8 = 1;

#[derive(Debug)]
struct AlicatState {
    status: AlicatStatus,
    control: ControlLoop,
    gas: u8,
    mixes: BTreeMap<u8, (String, Vec<MixComponent>)>,
    commands: Vec<String>,
}

impl AlicatState {
    fn gas_label(&self) -> String {
        gas_name(self.gas)
            .map(str::to_string)
            .or_else(|| self.mixes.get(&self.gas).map(|(name, _)| name.clone()))
            .unwrap_or_else(|| self.gas.to_string())
    }

    fn snapshot(&self) -> AlicatStatus {
        AlicatStatus {
            gas: self.gas_label(),
            ..self.status.clone()
        }
    }

    fn execute(&mut self, unit: char, command: AsciiCommand) -> Vec<u8> {
        let rejected = format!("{unit} ?\r").into_bytes();
        match command {
            AsciiCommand::Poll => self.snapshot().encode(unit),
            AsciiCommand::SelectLoop(control) => {
                self.control = control;
                format!("{unit} 122={}\r", control.register_value()).into_bytes()
            }
            AsciiCommand::Setpoint(value) => {
                self.status.setpoint = value;
                match self.control {
                    ControlLoop::MassFlow => {
                        self.status.mass_flow = value;
                        self.status.volumetric_flow = value;
                    }
                    ControlLoop::Pressure => self.status.pressure = value,
                }
                self.snapshot().encode(unit)
            }
            AsciiCommand::Gas(number) => {
                if gas_name(number).is_none() && !self.mixes.contains_key(&number) {
                    return rejected;
                }
                self.gas = number;
                self.snapshot().encode(unit)
            }
            AsciiCommand::CreateMix {
                number,
                name,
                components,
            } => {
                let total: f64 = components.iter().map(|c| c.percent).sum();
                if !MIX_NUMBERS.contains(&number)
                    || !(2..=5).contains(&components.len())
                    || (total - 100.0).abs() > 0.01
                {
                    return rejected;
                }
                self.mixes.insert(number, (name, components));
                format!("{unit} {number}\r").into_bytes()
            }
            AsciiCommand::DeleteMix(number) => {
                if self.mixes.remove(&number).is_none() {
                    return rejected;
                }
                if self.gas == number {
                    self.gas = ARGON;
                }
                format!("{unit} {number}\r").into_bytes()
            }
        }
    }
}

/// Shared-state Alicat controller at sea-level pressure and room
/// temperature, no flow, argon selected, mass-flow loop active.
#[derive(Debug, Clone)]
pub struct AlicatDevice {
    unit: char,
    state: Arc<Mutex<AlicatState>>,
}

impl AlicatDevice {
    pub fn new(unit: char) -> Self {
        let status = AlicatStatus {
            pressure: 14.7,
            temperature: 25.0,
            volumetric_flow: 0.0,
            mass_flow: 0.0,
            setpoint: 0.0,
            gas: String::new(),
            flags: Vec::new(),
        };
        Self {
            unit,
            state: Arc::new(Mutex::new(AlicatState {
                status,
                control: ControlLoop::MassFlow,
                gas: ARGON,
                mixes: BTreeMap::new(),
                commands: Vec::new(),
            })),
        }
    }

    /// Pre-define a mix, as if created on the front panel.
    pub fn with_mix(self, number: u8, name: &str, components: Vec<MixComponent>) -> Self {
        self.state
            .lock()
            .mixes
            .insert(number, (name.to_string(), components));
        self
    }

    /// Change measured values; the gas field is ignored.
    pub fn update(&self, f: impl FnOnce(&mut AlicatStatus)) {
        f(&mut self.state.lock().status);
    }

    pub fn status(&self) -> AlicatStatus {
        self.state.lock().snapshot()
    }

    pub fn gas(&self) -> u8 {
        self.state.lock().gas
    }

    pub fn control_loop(&self) -> ControlLoop {
        self.state.lock().control
    }

    pub fn mix(&self, number: u8) -> Option<(String, Vec<MixComponent>)> {
        self.state.lock().mixes.get(&number).cloned()
    }

    /// Bodies of the commands addressed to this unit, without unit letter
    /// and terminator. A poll is the empty string.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone())
    }
}

impl Responder for AlicatDevice {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let Some((unit, command)) = AsciiCommand::decode(request) else {
            return match request.first() {
                Some(unit) if char::from(*unit) == self.unit => format!("{} ?\r", self.unit).into_bytes(),
                _ => Vec::new(),
            };
        };
        // Other units on the bus answer for themselves.
        if unit != self.unit {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let body = String::from_utf8_lossy(&request[1..]).trim_end().to_string();
        state.commands.push(body);
        state.execute(unit, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_commands_get_a_question_mark() {
        let mut device = AlicatDevice::new('A');
        assert_eq!(device.respond(b"AZZ\r"), b"A ?\r");
        assert!(device.respond(b"BZZ\r").is_empty());
        assert!(device.respond(b"B\r").is_empty());
        assert!(device.commands().is_empty());
    }

    #[test]
    fn pressure_loop_setpoint_moves_pressure() {
        let mut device = AlicatDevice::new('A');
        assert_eq!(device.respond(b"AW122=34\r"), b"A 122=34\r");
        device.respond(b"AS30.00\r");
        let status = device.status();
        assert_eq!(status.pressure, 30.0);
        assert_eq!(status.mass_flow, 0.0);
        assert_eq!(status.gas, "Ar");
    }

    #[test]
    fn deleting_the_selected_mix_falls_back_to_argon() {
        let mut device = AlicatDevice::new('A');
        assert_eq!(device.respond(b"AGM Mix1 236 60.00 8 40.00 11\r"), b"A 236\r");
        assert_eq!(device.mix(236).map(|(name, _)| name), Some("Mix1".to_string()));
        device.respond(b"AG236\r");
        assert_eq!(device.status().gas, "Mix1");
        assert_eq!(device.respond(b"AGD 236\r"), b"A 236\r");
        assert_eq!(device.gas(), ARGON);
        assert_eq!(device.respond(b"AGD 236\r"), b"A ?\r");
    }
}
