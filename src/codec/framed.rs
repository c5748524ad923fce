//! STX/DLE/ETX framed protocol used by the pulsed power supply.
//!
//! Every exchange opens with a handshake: the host sends STX and the device
//! answers DLE when it is ready (or NAK when it is not). Frames end with
//! `DLE ETX BCC`, where BCC is the XOR of every preceding byte.
//!
//! A register read takes four turns:
//!
//! ```text
//! host   STX          read-frame          DLE                DLE
//! device      DLE                  DLE          payload
//! ```
//!
//! The value sits in the two bytes before the payload's `ETX BCC` tail,
//! high byte first.
//!
//! A DLE inside a frame body is sent twice so it cannot be mistaken for the
//! start of the `DLE ETX` trailer. The BCC covers the bytes as sent.

use crate::catalog::Register;
use crate::error::{AppResult, FramingError, ProtocolError, TransportError, ValidationError};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{hex, Transport};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const DLE: u8 = 0x10;
pub const NAK: u8 = 0x15;

const WRITE_OP: u8 = 0x41;
const READ_OP: u8 = 0x45;
const TARGET: u8 = 0x44;
/// DLE acknowledgement plus the shortest payload the value can be taken from.
const MIN_READ_REPLY: usize = 9;
/// Bytes the device sends after the host's DLE, at least.
const MIN_PAYLOAD: usize = 7;

/// XOR block check over `bytes`.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Commands the power supply accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramedCommand {
    /// Select the output mode and switch it on (2) or off (1).
    ModeSwitch { mode: u8, on_off: u8 },
    /// Four clock/setpoint words.
    Clock([u16; 4]),
    WriteRegister { address: u8, value: u16 },
}

impl FramedCommand {
    pub fn encode(&self) -> Vec<u8> {
        let (address, count, data): (u8, u8, Vec<u8>) = match *self {
            FramedCommand::ModeSwitch { mode, on_off } => (0, 2, vec![0, mode, 0, on_off]),
            FramedCommand::Clock(words) => (
                4,
                4,
                words.iter().flat_map(|w| w.to_be_bytes()).collect(),
            ),
            FramedCommand::WriteRegister { address, value } => {
                (address, 1, value.to_be_bytes().to_vec())
            }
        };
        let mut frame = vec![0, 0, WRITE_OP, TARGET, 0, address, 0, count, 0xFF, 0xFF];
        frame.extend(data);
        seal(frame)
    }
}

/// The fixed 13-byte read request for `address`.
pub fn encode_read(address: u8) -> Vec<u8> {
    seal(vec![0, 0, READ_OP, TARGET, 0, address, 0, 1, 0xFF, 0xFF])
}

fn seal(body: Vec<u8>) -> Vec<u8> {
    let mut frame = stuff(&body);
    frame.extend_from_slice(&[DLE, ETX]);
    frame.push(bcc(&frame));
    frame
}

/// Double every DLE in a frame body.
pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for &byte in body {
        out.push(byte);
        if byte == DLE {
            out.push(DLE);
        }
    }
    out
}

/// Collapse doubled DLEs back into one.
pub fn unstuff(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        out.push(byte);
        if byte == DLE {
            iter.next_if_eq(&DLE);
        }
    }
    out
}

/// Take the register value out of a read reply (DLE ack followed by payload).
pub fn decode_value(reply: &[u8]) -> AppResult<u16> {
    let n = reply.len();
    let short = || FramingError::ShortFrame {
        expected: MIN_READ_REPLY,
        received: n,
    };
    if n < MIN_READ_REPLY {
        return Err(short().into());
    }
    // Walk back from the ETX BCC tail so the ack DLE in front never pairs
    // with a doubled DLE of the payload.
    let mut body = reply[..n - 2].iter().rev().copied().peekable();
    let mut next = || {
        let byte = body.next()?;
        if byte == DLE {
            body.next_if_eq(&DLE);
        }
        Some(byte)
    };
    match (next(), next()) {
        (Some(lo), Some(hi)) => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(short().into()),
    }
}

/// Framed-protocol master.
#[derive(Debug, Clone)]
pub struct Framed {
    timeout: Duration,
    handshake_window: Duration,
    ack_window: Duration,
    read_settle: Duration,
    write_policy: RetryPolicy,
    read_policy: RetryPolicy,
}

impl Framed {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            handshake_window: Duration::from_millis(400),
            ack_window: Duration::from_millis(750),
            read_settle: Duration::from_millis(80),
            write_policy: RetryPolicy::framed_write(),
            read_policy: RetryPolicy::framed_read(),
        }
    }

    pub fn with_policies(mut self, write: RetryPolicy, read: RetryPolicy) -> Self {
        self.write_policy = write;
        self.read_policy = read;
        self
    }

    /// Send a command, retrying transient failures.
    pub async fn send(
        &mut self,
        transport: &mut dyn Transport,
        command: FramedCommand,
    ) -> AppResult<()> {
        let policy = self.write_policy.clone();
        let frame = command.encode();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            let frame = frame.clone();
            Box::pin(async move { codec.send_once(&mut **transport, &frame).await })
        })
        .await
    }

    /// Read a catalog register. Values outside its range count as misreads
    /// and are retried with the read policy.
    pub async fn read(
        &mut self,
        transport: &mut dyn Transport,
        register: &'static Register,
    ) -> AppResult<u16> {
        let address = wire_address(register)?;
        let policy = self.read_policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            Box::pin(async move {
                let value = codec.read_once(&mut **transport, address).await?;
                if !register.plausible(f64::from(value)) {
                    return Err(FramingError::ImplausibleValue {
                        register: register.name,
                        value: i64::from(value),
                    }
                    .into());
                }
                Ok(value)
            })
        })
        .await
    }

    /// Write a catalog register.
    pub async fn write(
        &mut self,
        transport: &mut dyn Transport,
        register: &'static Register,
        value: u16,
    ) -> AppResult<()> {
        let address = wire_address(register)?;
        self.send(transport, FramedCommand::WriteRegister { address, value })
            .await
    }

    async fn send_once(&mut self, transport: &mut dyn Transport, frame: &[u8]) -> AppResult<()> {
        self.handshake(transport).await?;
        debug!(tx = %hex(frame), "framed command");
        transport.write(frame).await?;
        Ok(())
    }

    /// One complete read exchange, no retries.
    pub async fn read_once(&mut self, transport: &mut dyn Transport, address: u8) -> AppResult<u16> {
        self.handshake(transport).await?;

        let frame = encode_read(address);
        debug!(address, tx = %hex(&frame), "framed read");
        transport.write(&frame).await?;
        tokio::time::sleep(self.read_settle).await;

        let mut reply = await_dle(transport, self.ack_window).await?;
        transport.write(&[DLE]).await?;
        reply.extend(transport.read_burst(MIN_PAYLOAD, self.timeout).await?);
        trace!(address, rx = %hex(&reply), "framed reply");

        let value = decode_value(&reply)?;
        transport.write(&[DLE]).await?;
        Ok(value)
    }

    async fn handshake(&self, transport: &mut dyn Transport) -> AppResult<()> {
        transport.write(&[STX]).await?;
        await_dle(transport, self.handshake_window).await?;
        Ok(())
    }
}

/// Collect bytes until a DLE arrives. A NAK in first position aborts.
async fn await_dle(transport: &mut dyn Transport, window: Duration) -> AppResult<Vec<u8>> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(window).into());
        }
        let byte = match transport.read_exact(1, remaining).await {
            Ok(bytes) => bytes[0],
            Err(TransportError::Timeout(_)) => return Err(TransportError::Timeout(window).into()),
            Err(e) => return Err(e.into()),
        };
        if seen.is_empty() && byte == NAK {
            debug!("device answered NAK");
            return Err(ProtocolError::DeviceNak.into());
        }
        seen.push(byte);
        if byte == DLE {
            return Ok(seen);
        }
    }
}

fn wire_address(register: &Register) -> AppResult<u8> {
    u8::try_from(register.address).map_err(|_| {
        ValidationError::TypeMismatch {
            register: register.name.to_string(),
            reason: format!("address {} does not fit the framed protocol", register.address),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::POWER_SUPPLY;
    use crate::error::DeviceError;
    use crate::sim::PowerSupplyDevice;

    fn unhex(text: &str) -> Vec<u8> {
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn bcc_is_xor_of_all_bytes() {
        assert_eq!(bcc(&[]), 0);
        assert_eq!(bcc(&[0x12, 0x34]), 0x26);
        let frame = encode_read(13);
        assert_eq!(bcc(&frame[..frame.len() - 1]), frame[frame.len() - 1]);
    }

    #[test]
    fn frames_match_reference_layout() {
        assert_eq!(encode_read(13), unhex("00004544000d0001ffff10031e"));
        assert_eq!(
            FramedCommand::WriteRegister {
                address: 13,
                value: 500
            }
            .encode(),
            unhex("00004144000d0001ffff01f41003ef")
        );
        assert_eq!(
            FramedCommand::ModeSwitch { mode: 2, on_off: 2 }.encode(),
            unhex("0000414400000002ffff00020002100314")
        );
        let clock = FramedCommand::Clock([1, 2, 3, 4]).encode();
        assert_eq!(clock.len(), 21);
        assert_eq!(clock, unhex("0000414400040004ffff0001000200030004100312"));
    }

    #[test]
    fn dle_in_the_body_is_doubled() {
        let frame = FramedCommand::WriteRegister {
            address: 0x10,
            value: 0x1010,
        }
        .encode();
        assert_eq!(frame, unhex("000041440010100001ffff10101010100317"));
        assert_eq!(bcc(&frame[..frame.len() - 1]), frame[frame.len() - 1]);
        let body = &frame[..frame.len() - 3];
        assert_eq!(unstuff(body), unhex("0000414400100001ffff1010"));
    }

    #[test]
    fn doubled_dle_in_a_reply_is_one_byte() {
        // Value 0x1005: the high byte arrives doubled.
        let reply = [DLE, 0, 0, 0x45, 0x44, 0, 13, DLE, DLE, 0x05, ETX, 0x00];
        assert_eq!(decode_value(&reply).unwrap(), 0x1005);
        // Value 0x0010 right behind the ack DLE and a doubled address.
        let reply = [DLE, 0, 0, 0x45, 0x44, 0, DLE, DLE, 0x00, DLE, DLE, ETX, 0x00];
        assert_eq!(decode_value(&reply).unwrap(), 0x0010);
    }

    #[test]
    fn value_comes_from_the_tail() {
        let reply = [DLE, 0, 0, 0x45, 0x44, 0, 13, 0x01, 0xF4, ETX, 0x00];
        assert_eq!(decode_value(&reply).unwrap(), 500);
        assert!(matches!(
            decode_value(&reply[..8]),
            Err(DeviceError::Framing(FramingError::ShortFrame { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_and_write_against_the_model() {
        let device = PowerSupplyDevice::new();
        let mut transport = device.transport();
        let mut codec = Framed::new(Duration::from_millis(200));
        let register = POWER_SUPPLY.get("VOLTAGE_SET").unwrap();

        codec.write(&mut transport, register, 1234).await.unwrap();
        assert_eq!(device.register(13), 1234);
        assert_eq!(codec.read(&mut transport, register).await.unwrap(), 1234);
    }

    #[tokio::test(start_paused = true)]
    async fn dle_valued_setpoint_round_trips() {
        let device = PowerSupplyDevice::new();
        let mut transport = device.transport();
        let mut codec = Framed::new(Duration::from_millis(200));
        let register = POWER_SUPPLY.get("VOLTAGE_SET").unwrap();

        codec.write(&mut transport, register, 0x0410).await.unwrap();
        assert_eq!(device.register(13), 0x0410);
        let sent = device.accepted_frames().pop().unwrap();
        assert_eq!(&sent[10..13], &[0x04, DLE, DLE]);
        assert_eq!(codec.read(&mut transport, register).await.unwrap(), 0x0410);
    }

    #[tokio::test(start_paused = true)]
    async fn nak_short_circuits_without_retry() {
        let device = PowerSupplyDevice::new();
        device.nak_next(1);
        let mut transport = device.transport();
        let mut codec = Framed::new(Duration::from_millis(200));
        let started = Instant::now();

        let err = codec
            .send(&mut transport, FramedCommand::WriteRegister { address: 13, value: 1 })
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::DeviceNak.into());
        assert_eq!(transport.log().writes(), vec![vec![STX]]);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn implausible_reads_are_retried() {
        let device = PowerSupplyDevice::new();
        device.set_register(13, 800);
        device.glitch_next_reads(2);
        let mut transport = device.transport();
        let mut codec = Framed::new(Duration::from_millis(200));
        let register = POWER_SUPPLY.get("VOLTAGE_SET").unwrap();

        assert_eq!(codec.read(&mut transport, register).await.unwrap(), 800);
        let stx_count = transport
            .log()
            .writes()
            .iter()
            .filter(|w| w.as_slice() == [STX])
            .count();
        assert_eq!(stx_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_the_handshake() {
        let mut transport = crate::transport::mock::MockTransport::new(|_: &[u8]| Vec::new());
        let mut codec = Framed::new(Duration::from_millis(200))
            .with_policies(RetryPolicy::new(2, Duration::from_millis(50)), RetryPolicy::once());
        let err = codec
            .send(&mut transport, FramedCommand::Clock([0; 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(TransportError::Timeout(_))));
        assert_eq!(transport.log().writes().len(), 2);
    }
}
