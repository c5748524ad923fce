//! Wire protocols.
//!
//! Each codec owns the framing rules and retry policy of one protocol and
//! borrows the transport for the duration of an exchange. [`Protocol`]
//! selects one of them per session and maps catalog reads and writes onto
//! protocol requests.

pub mod ascii;
pub mod framed;
pub mod modbus;
pub mod opcode;

pub use ascii::{AlicatStatus, AsciiCommand, AsciiLine, ControlLoop, MixComponent};
pub use framed::{Framed, FramedCommand};
pub use modbus::{ModbusRtu, ModbusTcp, Reply, Request};
pub use opcode::{LaserCommand, LaserStatus, Opcode};

use crate::catalog::{Catalog, Register, Value, Width};
use crate::config::{DeviceConfig, DeviceKind, ProtocolKind};
use crate::error::{AppResult, FramingError, ProtocolError, ValidationError};
use crate::transport::Transport;
use std::time::Duration;
use tracing::warn;

/// Pause the Azbil MFC needs between a request and its reply.
const MFC_POST_WRITE_DELAY: Duration = Duration::from_millis(100);

/// The protocol spoken by one session.
#[derive(Debug, Clone)]
pub enum Protocol {
    /// Modbus RTU over a serial line.
    ModbusRtu(ModbusRtu),
    /// Modbus TCP with MBAP headers.
    ModbusTcp(ModbusTcp),
    /// STX/DLE/ETX frames of the pulsed power supply.
    Framed(Framed),
    /// Single-byte opcodes of the laser controller.
    Opcode(Opcode),
    /// Alicat command lines.
    Ascii(AsciiLine),
}

impl Protocol {
    /// Codec for `kind` tuned from `config`, honouring a protocol override.
    pub fn new(kind: DeviceKind, config: &DeviceConfig) -> Self {
        let timeout = config.response_timeout;
        match config.protocol_for(kind) {
            ProtocolKind::ModbusRtu => {
                let codec = ModbusRtu::new(config.slave_id, timeout);
                Protocol::ModbusRtu(if kind == DeviceKind::MassFlowController {
                    codec.with_post_write_delay(MFC_POST_WRITE_DELAY)
                } else {
                    codec
                })
            }
            ProtocolKind::ModbusTcp => Protocol::ModbusTcp(ModbusTcp::new(config.slave_id, timeout)),
            ProtocolKind::Framed => Protocol::Framed(Framed::new(timeout)),
            ProtocolKind::Opcode => Protocol::Opcode(Opcode::new(timeout)),
            ProtocolKind::Ascii => {
                let unit = ascii::unit_for(config.slave_id).unwrap_or_else(|| {
                    warn!(unit_id = config.slave_id, "unit id outside A-Z, addressing unit A");
                    'A'
                });
                Protocol::Ascii(AsciiLine::new(unit, timeout))
            }
        }
    }

    /// Which protocol this is.
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::ModbusRtu(_) => ProtocolKind::ModbusRtu,
            Protocol::ModbusTcp(_) => ProtocolKind::ModbusTcp,
            Protocol::Framed(_) => ProtocolKind::Framed,
            Protocol::Opcode(_) => ProtocolKind::Opcode,
            Protocol::Ascii(_) => ProtocolKind::Ascii,
        }
    }

    /// Connect-time verification exchange: proves the right device answers.
    ///
    /// For the laser this also selects remote control.
    pub async fn identify(
        &mut self,
        transport: &mut dyn Transport,
        catalog: &'static Catalog,
    ) -> AppResult<Value> {
        if let Protocol::Opcode(codec) = self {
            let status = codec.ensure_remote(transport).await?;
            return Ok(Value::from(i64::from(status.mode)));
        }
        let register = catalog.for_read(catalog.identity)?;
        self.read(transport, register).await
    }

    /// Leave the device under local control before the link closes. Only
    /// the laser needs this; other protocols hold no remote state.
    pub async fn release(&mut self, transport: &mut dyn Transport) -> AppResult<()> {
        match self {
            Protocol::Opcode(codec) => codec.release(transport).await,
            _ => Ok(()),
        }
    }

    /// Read one register or status slot.
    pub async fn read(
        &mut self,
        transport: &mut dyn Transport,
        register: &'static Register,
    ) -> AppResult<Value> {
        match self {
            Protocol::ModbusRtu(codec) => {
                let reply = codec
                    .execute(transport, Request::Read { address: register.address })
                    .await?;
                register_value(reply)
            }
            Protocol::ModbusTcp(codec) => {
                let reply = codec
                    .execute(transport, Request::Read { address: register.address })
                    .await?;
                register_value(reply)
            }
            Protocol::Framed(codec) => Ok(Value::from(codec.read(transport, register).await?)),
            Protocol::Opcode(codec) => codec.read(transport, register).await,
            Protocol::Ascii(codec) => codec.read(transport, register).await,
        }
    }

    /// Write a value the catalog has already validated.
    pub async fn write(
        &mut self,
        transport: &mut dyn Transport,
        register: &'static Register,
        value: &Value,
    ) -> AppResult<()> {
        match self {
            Protocol::ModbusRtu(codec) => {
                codec.execute(transport, modbus_write(register, value)?).await?;
                Ok(())
            }
            Protocol::ModbusTcp(codec) => {
                codec.execute(transport, modbus_write(register, value)?).await?;
                Ok(())
            }
            Protocol::Framed(codec) => codec.write(transport, register, word(register, value)?).await,
            Protocol::Opcode(codec) => codec.write(transport, register, value).await,
            Protocol::Ascii(codec) => codec.write(transport, register, value).await,
        }
    }

    /// The framed codec, or `WrongProtocol`.
    pub fn framed(&mut self) -> AppResult<&mut Framed> {
        match self {
            Protocol::Framed(codec) => Ok(codec),
            other => Err(wrong_protocol(ProtocolKind::Framed, other.kind())),
        }
    }

    /// The laser codec, or `WrongProtocol`.
    pub fn opcode(&mut self) -> AppResult<&mut Opcode> {
        match self {
            Protocol::Opcode(codec) => Ok(codec),
            other => Err(wrong_protocol(ProtocolKind::Opcode, other.kind())),
        }
    }

    /// The Alicat codec, or `WrongProtocol`.
    pub fn ascii(&mut self) -> AppResult<&mut AsciiLine> {
        match self {
            Protocol::Ascii(codec) => Ok(codec),
            other => Err(wrong_protocol(ProtocolKind::Ascii, other.kind())),
        }
    }
}

fn wrong_protocol(expected: ProtocolKind, actual: ProtocolKind) -> crate::error::DeviceError {
    ProtocolError::WrongProtocol {
        expected: expected.name(),
        actual: actual.name(),
    }
    .into()
}

fn register_value(reply: Reply) -> AppResult<Value> {
    match reply {
        Reply::Register(raw) => Ok(Value::from(raw)),
        Reply::Written => Err(FramingError::UnexpectedReply("write echo to a read".into()).into()),
    }
}

fn modbus_write(register: &Register, value: &Value) -> AppResult<Request> {
    Ok(match register.width {
        Width::Single => Request::WriteSingle {
            address: register.address,
            value: word(register, value)?,
        },
        Width::Double => Request::WriteDouble {
            address: register.address,
            value: value
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| mismatch(register, "expected an unsigned 32-bit integer"))?,
        },
    })
}

/// A value as one unsigned 16-bit register word.
fn word(register: &Register, value: &Value) -> AppResult<u16> {
    value
        .as_i64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| mismatch(register, "expected an integer in 0..=65535"))
}

fn mismatch(register: &Register, reason: &str) -> crate::error::DeviceError {
    ValidationError::TypeMismatch {
        register: register.name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MASS_FLOW_CONTROLLER, ROBOT_ARM};

    #[test]
    fn protocol_follows_kind_and_override() {
        let heater = DeviceKind::Heater.config_for("/dev/ttyS0");
        assert_eq!(Protocol::new(DeviceKind::Heater, &heater).kind(), ProtocolKind::ModbusRtu);
        let gateway = heater.with_protocol(ProtocolKind::ModbusTcp);
        assert_eq!(Protocol::new(DeviceKind::Heater, &gateway).kind(), ProtocolKind::ModbusTcp);
        let laser = DeviceKind::Laser.config_for("/dev/ttyS1");
        assert!(Protocol::new(DeviceKind::Laser, &laser).framed().is_err());
        let alicat = DeviceKind::Alicat.config_for("/dev/ttyS2").with_slave_id(3);
        let mut protocol = Protocol::new(DeviceKind::Alicat, &alicat);
        assert_eq!(protocol.kind(), ProtocolKind::Ascii);
        assert_eq!(protocol.ascii().unwrap().unit(), 'C');
        assert!(protocol.opcode().is_err());
    }

    #[test]
    fn double_width_registers_use_function_0x10() {
        let reset = MASS_FLOW_CONTROLLER.get("TOTAL_FLOW_RESET").unwrap();
        let request = modbus_write(reset, &Value::Integer(0)).unwrap();
        assert_eq!(request, Request::WriteDouble { address: reset.address, value: 0 });

        let start = ROBOT_ARM.get("ROBOT_START").unwrap();
        assert_eq!(
            modbus_write(start, &Value::Integer(1)).unwrap(),
            Request::WriteSingle { address: 0x9C41, value: 1 }
        );
        assert!(modbus_write(start, &Value::Float(0.5)).is_err());
    }
}
