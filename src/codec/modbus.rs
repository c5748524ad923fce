//! Modbus RTU and Modbus TCP masters.
//!
//! Both variants share the PDU layer: function 0x03 reads one holding
//! register, 0x06 writes one, and 0x10 writes a two-register (32-bit)
//! quantity. RTU wraps the PDU as `[slave][pdu][crcLo][crcHi]`; TCP prefixes
//! the MBAP header `[tid][0000][len][unit]` and drops the CRC.
//!
//! Exception replies (function code with bit 0x80 set) are decoded into
//! [`ProtocolError::ModbusException`] and are never retried.

use crate::error::{AppResult, FramingError, ProtocolError};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{hex, Transport};
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use tracing::{debug, trace};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub const READ_HOLDING: u8 = 0x03;
pub const WRITE_SINGLE: u8 = 0x06;
pub const WRITE_MULTIPLE: u8 = 0x10;

const EXCEPTION_BIT: u8 = 0x80;
/// Length of an RTU exception frame, and of the first read of any reply.
const RTU_HEAD: usize = 5;
const MBAP_LEN: usize = 7;

/// CRC-16/MODBUS: init 0xFFFF, reflected polynomial 0xA001.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// One Modbus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Read one holding register.
    Read { address: u16 },
    /// Write one holding register (function 0x06).
    WriteSingle { address: u16, value: u16 },
    /// Write a 32-bit quantity as two registers, high word first.
    WriteDouble { address: u16, value: u32 },
}

/// Decoded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Value of the register that was read.
    Register(u16),
    /// The slave echoed a write.
    Written,
}

impl Request {
    /// Modbus function code.
    pub fn function(&self) -> u8 {
        match self {
            Request::Read { .. } => READ_HOLDING,
            Request::WriteSingle { .. } => WRITE_SINGLE,
            Request::WriteDouble { .. } => WRITE_MULTIPLE,
        }
    }

    /// Protocol data unit: function code and big-endian fields, no
    /// address, CRC or MBAP header.
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = vec![self.function()];
        match *self {
            Request::Read { address } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&1u16.to_be_bytes());
            }
            Request::WriteSingle { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteDouble { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&2u16.to_be_bytes());
                pdu.push(4);
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
        pdu
    }

    /// Length of a normal reply PDU (function code included).
    fn reply_pdu_len(&self) -> usize {
        match self {
            Request::Read { .. } => 4,
            Request::WriteSingle { .. } | Request::WriteDouble { .. } => 5,
        }
    }

    /// Check a reply PDU against this request.
    pub fn decode(&self, pdu: &[u8]) -> AppResult<Reply> {
        let function = *pdu.first().ok_or(FramingError::ShortFrame {
            expected: 2,
            received: 0,
        })?;
        if function == self.function() | EXCEPTION_BIT {
            let code = pdu.get(1).copied().unwrap_or_default();
            return Err(ProtocolError::ModbusException { code }.into());
        }
        if function != self.function() {
            return Err(FramingError::UnexpectedReply(format!(
                "function {function:#04x} in reply to {:#04x}",
                self.function()
            ))
            .into());
        }
        if pdu.len() < self.reply_pdu_len() {
            return Err(FramingError::ShortFrame {
                expected: self.reply_pdu_len(),
                received: pdu.len(),
            }
            .into());
        }
        match *self {
            Request::Read { .. } => {
                if pdu[1] != 2 {
                    return Err(FramingError::UnexpectedReply(format!(
                        "byte count {} for a single register",
                        pdu[1]
                    ))
                    .into());
                }
                Ok(Reply::Register(u16::from_be_bytes([pdu[2], pdu[3]])))
            }
            Request::WriteSingle { .. } | Request::WriteDouble { .. } => {
                // 0x06 echoes address and value, 0x10 echoes address and quantity.
                let request = self.pdu();
                if pdu[1..5] != request[1..5] {
                    return Err(FramingError::UnexpectedReply(format!(
                        "write echo {} does not match request {}",
                        hex(&pdu[1..5]),
                        hex(&request[1..5])
                    ))
                    .into());
                }
                Ok(Reply::Written)
            }
        }
    }
}

/// Build an RTU frame: slave, PDU, CRC little-endian.
pub fn encode_rtu(slave: u8, request: &Request) -> Vec<u8> {
    let mut frame = vec![slave];
    frame.extend(request.pdu());
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Validate a complete RTU reply frame: CRC first, then slave, then PDU.
pub fn decode_rtu(slave: u8, request: &Request, frame: &[u8]) -> AppResult<Reply> {
    if frame.len() < 4 {
        return Err(FramingError::ShortFrame {
            expected: RTU_HEAD,
            received: frame.len(),
        }
        .into());
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let expected = crc16(body);
    if expected != received {
        return Err(FramingError::ChecksumMismatch { expected, received }.into());
    }
    if body[0] != slave {
        return Err(FramingError::UnexpectedReply(format!(
            "reply from slave {} while talking to {slave}",
            body[0]
        ))
        .into());
    }
    request.decode(&body[1..])
}

/// Modbus RTU master for one slave.
#[derive(Debug, Clone)]
pub struct ModbusRtu {
    slave: u8,
    timeout: Duration,
    /// Pause between a write and reading its reply.
    post_write_delay: Duration,
    policy: RetryPolicy,
}

impl ModbusRtu {
    pub fn new(slave: u8, timeout: Duration) -> Self {
        Self {
            slave,
            timeout,
            post_write_delay: Duration::ZERO,
            policy: RetryPolicy::modbus(),
        }
    }

    pub fn with_post_write_delay(mut self, delay: Duration) -> Self {
        self.post_write_delay = delay;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Run `request` with retries.
    pub async fn execute(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
    ) -> AppResult<Reply> {
        let policy = self.policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            Box::pin(async move { codec.exchange(&mut **transport, request).await })
        })
        .await
    }

    /// One request/reply exchange, no retries.
    pub async fn exchange(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
    ) -> AppResult<Reply> {
        let frame = encode_rtu(self.slave, &request);
        debug!(slave = self.slave, tx = %hex(&frame), "modbus rtu request");
        transport.write(&frame).await?;
        if !self.post_write_delay.is_zero() {
            tokio::time::sleep(self.post_write_delay).await;
        }

        let mut reply = transport.read_exact(RTU_HEAD, self.timeout).await?;
        if reply[1] & EXCEPTION_BIT == 0 {
            let total = 1 + request.reply_pdu_len() + 2;
            reply.extend(transport.read_exact(total - RTU_HEAD, self.timeout).await?);
        }
        trace!(slave = self.slave, rx = %hex(&reply), "modbus rtu reply");
        decode_rtu(self.slave, &request, &reply)
    }
}

/// Build a Modbus TCP ADU.
pub fn encode_tcp(transaction: u16, unit: u8, request: &Request) -> Vec<u8> {
    let pdu = request.pdu();
    let mut frame = Vec::with_capacity(MBAP_LEN + pdu.len());
    frame.extend_from_slice(&transaction.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit);
    frame.extend(pdu);
    frame
}

/// Modbus TCP master for one unit id.
#[derive(Debug, Clone)]
pub struct ModbusTcp {
    unit: u8,
    timeout: Duration,
    policy: RetryPolicy,
    next_transaction: u16,
}

impl ModbusTcp {
    pub fn new(unit: u8, timeout: Duration) -> Self {
        Self {
            unit,
            timeout,
            policy: RetryPolicy::modbus(),
            next_transaction: 1,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn execute(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
    ) -> AppResult<Reply> {
        let policy = self.policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            Box::pin(async move { codec.exchange(&mut **transport, request).await })
        })
        .await
    }

    pub async fn exchange(
        &mut self,
        transport: &mut dyn Transport,
        request: Request,
    ) -> AppResult<Reply> {
        let transaction = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);

        let frame = encode_tcp(transaction, self.unit, &request);
        debug!(unit = self.unit, transaction, tx = %hex(&frame), "modbus tcp request");
        transport.write(&frame).await?;

        let header = transport.read_exact(MBAP_LEN, self.timeout).await?;
        let echoed = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if echoed != transaction {
            return Err(FramingError::UnexpectedReply(format!(
                "transaction {echoed} in reply to {transaction}"
            ))
            .into());
        }
        if header[2..4] != [0, 0] || !(2..=254).contains(&length) {
            return Err(FramingError::UnexpectedReply(format!(
                "malformed MBAP header {}",
                hex(&header)
            ))
            .into());
        }
        if header[6] != self.unit {
            return Err(FramingError::UnexpectedReply(format!(
                "reply from unit {} while talking to {}",
                header[6], self.unit
            ))
            .into());
        }
        let pdu = transport.read_exact(length - 1, self.timeout).await?;
        trace!(unit = self.unit, rx = %hex(&pdu), "modbus tcp reply");
        request.decode(&pdu)
    }
}
