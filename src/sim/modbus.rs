//! Modbus RTU/TCP slave model.

use crate::codec::modbus::{crc16, READ_HOLDING, WRITE_MULTIPLE, WRITE_SINGLE};
use crate::transport::mock::{MockTransport, Responder};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

const ILLEGAL_FUNCTION: u8 = 1;
const ILLEGAL_ADDRESS: u8 = 2;
const ILLEGAL_VALUE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Rtu,
    Tcp,
}

#[derive(Debug)]
struct SlaveState {
    framing: Framing,
    id: u8,
    registers: BTreeMap<u16, u16>,
    exceptions: HashMap<u16, u8>,
    scripted: HashMap<u16, VecDeque<u16>>,
    mirrors: Vec<(u16, u16)>,
    silent: bool,
    requests: usize,
}

/// A holding-register slave. Clones share state, so a test keeps one handle
/// while the session owns the transport built from another.
#[derive(Debug, Clone)]
pub struct ModbusDevice {
    state: Arc<Mutex<SlaveState>>,
}

impl ModbusDevice {
    fn with_framing(framing: Framing, id: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlaveState {
                framing,
                id,
                registers: BTreeMap::new(),
                exceptions: HashMap::new(),
                scripted: HashMap::new(),
                mirrors: Vec::new(),
                silent: false,
                requests: 0,
            })),
        }
    }

    pub fn rtu(slave: u8) -> Self {
        Self::with_framing(Framing::Rtu, slave)
    }

    pub fn tcp(unit: u8) -> Self {
        Self::with_framing(Framing::Tcp, unit)
    }

    /// Define a register. Reads of undefined addresses raise Illegal Data Address.
    pub fn with_register(self, address: u16, value: u16) -> Self {
        self.set_register(address, value);
        self
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state.lock().registers.get(&address).copied()
    }

    /// Answer every request touching `address` with exception `code`.
    pub fn fail_with(&self, address: u16, code: u8) {
        self.state.lock().exceptions.insert(address, code);
    }

    /// Serve these values to the next reads of `address`, then the stored one.
    pub fn script_reads(&self, address: u16, values: impl IntoIterator<Item = u16>) {
        self.state
            .lock()
            .scripted
            .entry(address)
            .or_default()
            .extend(values);
    }

    /// Writes to `source` also land in `target`.
    pub fn mirror(self, source: u16, target: u16) -> Self {
        self.state.lock().mirrors.push((source, target));
        self
    }

    /// Stop answering, as if the cable were pulled.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Number of well-formed requests seen.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport::new(self.clone())
    }
}

impl SlaveState {
    fn store(&mut self, address: u16, value: u16) {
        self.registers.insert(address, value);
        let targets: Vec<u16> = self
            .mirrors
            .iter()
            .filter(|(source, _)| *source == address)
            .map(|(_, target)| *target)
            .collect();
        for target in targets {
            self.registers.insert(target, value);
        }
    }

    fn handle_pdu(&mut self, pdu: &[u8]) -> Vec<u8> {
        let function = pdu[0];
        let exception = |code: u8| vec![function | 0x80, code];
        if pdu.len() < 5 {
            return exception(ILLEGAL_VALUE);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);
        if let Some(code) = self.exceptions.get(&address) {
            return exception(*code);
        }
        match function {
            READ_HOLDING => {
                if word != 1 {
                    return exception(ILLEGAL_VALUE);
                }
                let scripted = self.scripted.get_mut(&address).and_then(VecDeque::pop_front);
                match scripted.or_else(|| self.registers.get(&address).copied()) {
                    Some(value) => {
                        let [hi, lo] = value.to_be_bytes();
                        vec![function, 2, hi, lo]
                    }
                    None => exception(ILLEGAL_ADDRESS),
                }
            }
            WRITE_SINGLE => {
                self.store(address, word);
                pdu[..5].to_vec()
            }
            WRITE_MULTIPLE => {
                if word != 2 || pdu.len() < 10 || pdu[5] != 4 {
                    return exception(ILLEGAL_VALUE);
                }
                self.store(address, u16::from_be_bytes([pdu[6], pdu[7]]));
                self.store(address.wrapping_add(1), u16::from_be_bytes([pdu[8], pdu[9]]));
                pdu[..5].to_vec()
            }
            _ => exception(ILLEGAL_FUNCTION),
        }
    }

    fn respond_rtu(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < 4 {
            return Vec::new();
        }
        let (body, tail) = frame.split_at(frame.len() - 2);
        if crc16(body) != u16::from_le_bytes([tail[0], tail[1]]) || body[0] != self.id {
            return Vec::new();
        }
        self.requests += 1;
        let mut reply = vec![self.id];
        reply.extend(self.handle_pdu(&body[1..]));
        let crc = crc16(&reply);
        reply.extend_from_slice(&crc.to_le_bytes());
        reply
    }

    fn respond_tcp(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < 8 || frame[6] != self.id {
            return Vec::new();
        }
        self.requests += 1;
        let pdu = self.handle_pdu(&frame[7..]);
        let mut reply = frame[..4].to_vec();
        reply.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
        reply.push(self.id);
        reply.extend(pdu);
        reply
    }
}

impl Responder for ModbusDevice {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        if state.silent {
            return Vec::new();
        }
        match state.framing {
            Framing::Rtu => state.respond_rtu(request),
            Framing::Tcp => state.respond_tcp(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::modbus::{encode_rtu, Request};

    #[test]
    fn answers_reads_writes_and_exceptions() {
        let mut device = ModbusDevice::rtu(1).with_register(0x41, 300).mirror(0x40, 0x42);
        let reply = device.respond(&encode_rtu(1, &Request::Read { address: 0x41 }));
        assert_eq!(reply, vec![0x01, 0x03, 0x02, 0x01, 0x2C, 0xB8, 0x09]);

        device.respond(&encode_rtu(1, &Request::WriteSingle { address: 0x40, value: 7 }));
        assert_eq!(device.register(0x42), Some(7));

        let reply = device.respond(&encode_rtu(1, &Request::Read { address: 0x99 }));
        assert_eq!(&reply[1..3], &[0x83, ILLEGAL_ADDRESS]);

        assert!(device.respond(&encode_rtu(2, &Request::Read { address: 0x41 })).is_empty());
        assert_eq!(device.request_count(), 3);
    }
}
