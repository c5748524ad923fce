//! Per-device connection settings.

use crate::catalog::{self, Catalog};
use crate::codec::ascii::unit_for;
use crate::error::{AppResult, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Instrument families the bridge knows how to talk to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[value(alias = "mfc")]
    MassFlowController,
    Heater,
    Ultrasonic,
    #[value(alias = "psu")]
    PowerSupply,
    Laser,
    #[value(alias = "robot")]
    RobotArm,
    Alicat,
}

impl DeviceKind {
    /// Every kind, in catalog order.
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::MassFlowController,
        DeviceKind::Heater,
        DeviceKind::Ultrasonic,
        DeviceKind::PowerSupply,
        DeviceKind::Laser,
        DeviceKind::RobotArm,
        DeviceKind::Alicat,
    ];

    /// Snake-case name used in configuration files and events.
    pub fn name(self) -> &'static str {
        self.catalog().device
    }

    /// Register table of this kind.
    pub fn catalog(self) -> &'static Catalog {
        match self {
            DeviceKind::MassFlowController => &catalog::MASS_FLOW_CONTROLLER,
            DeviceKind::Heater => &catalog::HEATER,
            DeviceKind::Ultrasonic => &catalog::ULTRASONIC,
            DeviceKind::PowerSupply => &catalog::POWER_SUPPLY,
            DeviceKind::Laser => &catalog::LASER,
            DeviceKind::RobotArm => &catalog::ROBOT_ARM,
            DeviceKind::Alicat => &catalog::ALICAT,
        }
    }

    /// Protocol spoken unless [`DeviceConfig::protocol`] overrides it.
    pub fn default_protocol(self) -> ProtocolKind {
        match self {
            DeviceKind::MassFlowController | DeviceKind::Heater | DeviceKind::Ultrasonic => {
                ProtocolKind::ModbusRtu
            }
            DeviceKind::PowerSupply => ProtocolKind::Framed,
            DeviceKind::Laser => ProtocolKind::Opcode,
            DeviceKind::RobotArm => ProtocolKind::ModbusTcp,
            DeviceKind::Alicat => ProtocolKind::Ascii,
        }
    }

    /// Pause between opening the port and the first exchange.
    pub fn connect_settle(self) -> Duration {
        match self {
            DeviceKind::MassFlowController => Duration::from_secs(2),
            _ => Duration::ZERO,
        }
    }

    /// Factory settings with an empty port or host.
    pub fn default_config(self) -> DeviceConfig {
        let serial = |baud_rate, parity| {
            DeviceConfig::serial(SerialSettings {
                port: String::new(),
                baud_rate,
                data_bits: 8,
                parity,
                stop_bits: 1,
            })
        };
        match self {
            DeviceKind::MassFlowController => serial(38_400, Parity::Even),
            DeviceKind::Heater => serial(9_600, Parity::None),
            DeviceKind::Ultrasonic => serial(38_400, Parity::None),
            DeviceKind::PowerSupply => serial(19_200, Parity::None),
            DeviceKind::Laser => serial(9_600, Parity::None),
            DeviceKind::Alicat => serial(19_200, Parity::None),
            DeviceKind::RobotArm => {
                DeviceConfig::tcp(String::new(), MODBUS_TCP_PORT).with_slave_id(5)
            }
        }
    }

    /// Factory settings pointed at `address`: a serial port path, or
    /// `host[:port]` for the robot arm.
    pub fn config_for(self, address: &str) -> DeviceConfig {
        let mut config = self.default_config();
        match &mut config.transport {
            TransportConfig::Serial(serial) => serial.port = address.to_string(),
            TransportConfig::Tcp { host, port } => {
                *host = address.to_string();
                if let Some((h, p)) = address.rsplit_once(':') {
                    if let Ok(parsed) = p.parse::<u16>() {
                        *host = h.to_string();
                        *port = parsed;
                    }
                }
            }
        }
        config
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        DeviceKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .or(match wanted.as_str() {
                "mfc" => Some(DeviceKind::MassFlowController),
                "psu" => Some(DeviceKind::PowerSupply),
                "robot" => Some(DeviceKind::RobotArm),
                _ => None,
            })
            .ok_or_else(|| ValidationError::InvalidConfig(format!("unknown device kind '{s}'")))
    }
}

/// Wire protocol spoken on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    ModbusRtu,
    ModbusTcp,
    Framed,
    Opcode,
    /// Alicat unit-letter command lines.
    Ascii,
}

impl ProtocolKind {
    /// Name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::ModbusRtu => "modbus-rtu",
            ProtocolKind::ModbusTcp => "modbus-tcp",
            ProtocolKind::Framed => "framed",
            ProtocolKind::Opcode => "opcode",
            ProtocolKind::Ascii => "ascii",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serial parity bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings. Flow control is always off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path such as `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

/// Physical link to an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial(SerialSettings),
    Tcp { host: String, port: u16 },
}

pub const MODBUS_TCP_PORT: u16 = 502;

/// Everything needed to open and address one instrument.
///
/// Immutable once a session has been created from it.
///
/// # Example
///
/// ```
/// use labbridge::config::{DeviceKind, ProtocolKind};
/// use std::time::Duration;
///
/// let config = DeviceKind::Alicat
///     .config_for("/dev/ttyUSB5")
///     .with_slave_id(2)
///     .with_response_timeout(Duration::from_millis(250))
///     .with_label("carrier gas");
/// assert_eq!(config.protocol_for(DeviceKind::Alicat), ProtocolKind::Ascii);
/// assert_eq!(config.display_name(), "carrier gas");
/// assert!(config.validate(DeviceKind::Alicat).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub transport: TransportConfig,
    /// Modbus slave or unit id. On the ASCII protocol 1-26 select unit
    /// letters `A`-`Z`. Ignored by the framed and opcode protocols.
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Overrides the device kind's default protocol.
    #[serde(default)]
    pub protocol: Option<ProtocolKind>,
    /// Overrides the device kind's connect settle time.
    #[serde(default, with = "humantime_serde")]
    pub connect_settle: Option<Duration>,
    /// Human name used in events; defaults to the address.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_slave_id() -> u8 {
    1
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(1)
}

impl DeviceConfig {
    /// Serial link with default addressing and timing.
    pub fn serial(settings: SerialSettings) -> Self {
        Self::with_transport(TransportConfig::Serial(settings))
    }

    /// TCP link with default addressing and timing.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::with_transport(TransportConfig::Tcp {
            host: host.into(),
            port,
        })
    }

    fn with_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            slave_id: default_slave_id(),
            response_timeout: default_response_timeout(),
            protocol: None,
            connect_settle: None,
            label: None,
        }
    }

    /// Replace the slave id (unit id on Modbus TCP and ASCII).
    pub fn with_slave_id(mut self, slave_id: u8) -> Self {
        self.slave_id = slave_id;
        self
    }

    /// Replace the per-exchange reply timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Speak `protocol` instead of the kind's default.
    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Replace the kind's pause between opening the port and the first exchange.
    pub fn with_connect_settle(mut self, settle: Duration) -> Self {
        self.connect_settle = Some(settle);
        self
    }

    /// Name the device in events and logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Port path or `host:port`. Two sessions never share an address.
    pub fn address(&self) -> String {
        match &self.transport {
            TransportConfig::Serial(serial) => serial.port.clone(),
            TransportConfig::Tcp { host, port } => format!("{host}:{port}"),
        }
    }

    /// Label for events and logs.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.address())
    }

    pub fn protocol_for(&self, kind: DeviceKind) -> ProtocolKind {
        self.protocol.unwrap_or_else(|| kind.default_protocol())
    }

    pub fn settle_for(&self, kind: DeviceKind) -> Duration {
        self.connect_settle.unwrap_or_else(|| kind.connect_settle())
    }

    /// Check the settings for `kind` before any port is touched.
    pub fn validate(&self, kind: DeviceKind) -> AppResult<()> {
        let invalid = |msg: String| Err(ValidationError::InvalidConfig(msg).into());

        match &self.transport {
            TransportConfig::Serial(serial) => {
                if serial.port.trim().is_empty() {
                    return invalid("serial port must not be empty".to_string());
                }
                if serial.baud_rate == 0 {
                    return invalid(format!("{}: baud rate must be positive", serial.port));
                }
                if !(5..=8).contains(&serial.data_bits) {
                    return invalid(format!(
                        "{}: data bits must be 5-8, got {}",
                        serial.port, serial.data_bits
                    ));
                }
                if !matches!(serial.stop_bits, 1 | 2) {
                    return invalid(format!(
                        "{}: stop bits must be 1 or 2, got {}",
                        serial.port, serial.stop_bits
                    ));
                }
            }
            TransportConfig::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return invalid("tcp host must not be empty".to_string());
                }
                if *port == 0 {
                    return invalid(format!("{host}: tcp port must be non-zero"));
                }
            }
        }

        let protocol = self.protocol_for(kind);
        match protocol {
            ProtocolKind::ModbusRtu if !(1..=247).contains(&self.slave_id) => {
                return invalid(format!("slave id must be 1-247, got {}", self.slave_id));
            }
            ProtocolKind::ModbusTcp if !matches!(self.transport, TransportConfig::Tcp { .. }) => {
                return invalid("modbus-tcp needs a tcp transport".to_string());
            }
            ProtocolKind::Ascii if unit_for(self.slave_id).is_none() => {
                return invalid(format!("unit id must be 1-26 (A-Z), got {}", self.slave_id));
            }
            _ => {}
        }
        if protocol != kind.default_protocol() {
            let compatible = matches!(
                (kind.default_protocol(), protocol),
                (ProtocolKind::ModbusRtu, ProtocolKind::ModbusTcp)
                    | (ProtocolKind::ModbusTcp, ProtocolKind::ModbusRtu)
            );
            if !compatible {
                return invalid(format!("{kind} cannot speak the {protocol} protocol"));
            }
        }

        if self.response_timeout.is_zero() {
            return invalid("response timeout must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[test]
    fn factory_framing_per_kind() {
        let mfc = DeviceKind::MassFlowController.config_for("/dev/ttyUSB0");
        match &mfc.transport {
            TransportConfig::Serial(s) => {
                assert_eq!((s.baud_rate, s.data_bits, s.parity, s.stop_bits), (38_400, 8, Parity::Even, 1));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert!(mfc.validate(DeviceKind::MassFlowController).is_ok());

        let robot = DeviceKind::RobotArm.config_for("10.0.0.7");
        assert_eq!(robot.address(), "10.0.0.7:502");
        assert_eq!(robot.slave_id, 5);
        assert_eq!(DeviceKind::RobotArm.config_for("10.0.0.7:1502").address(), "10.0.0.7:1502");
    }

    #[test]
    fn tcp_address_without_a_valid_port_keeps_the_default() {
        let robot = DeviceKind::RobotArm.config_for("plc.lab:http");
        assert_eq!(
            robot.transport,
            TransportConfig::Tcp {
                host: "plc.lab:http".into(),
                port: MODBUS_TCP_PORT
            }
        );
        let robot = DeviceKind::RobotArm.config_for("plc.lab:70000");
        assert_eq!(robot.address(), "plc.lab:70000:502");
        let robot = DeviceKind::RobotArm.config_for("plc.lab:5020");
        assert_eq!(
            robot.transport,
            TransportConfig::Tcp {
                host: "plc.lab".into(),
                port: 5020
            }
        );
    }

    #[test]
    fn empty_port_is_rejected() {
        let err = DeviceKind::Heater.default_config().validate(DeviceKind::Heater).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Validation(ValidationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn protocol_override_must_fit_the_kind() {
        let config = DeviceKind::Laser
            .config_for("/dev/ttyS1")
            .with_protocol(ProtocolKind::ModbusRtu);
        assert!(config.validate(DeviceKind::Laser).is_err());

        let rtu_over_tcp = DeviceConfig::tcp("gateway", 4001).with_protocol(ProtocolKind::ModbusRtu);
        assert!(rtu_over_tcp.validate(DeviceKind::Heater).is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
            response_timeout = "250ms"
            [transport]
            kind = "serial"
            port = "/dev/ttyUSB1"
            baud_rate = 19200
            "#,
        )
        .unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.slave_id, 1);
        assert_eq!(config.connect_settle, None);
        assert_eq!(config.address(), "/dev/ttyUSB1");
    }

    #[test]
    fn alicat_defaults_to_unit_a_at_19200() {
        let alicat = DeviceKind::Alicat.config_for("/dev/ttyUSB6");
        match &alicat.transport {
            TransportConfig::Serial(s) => assert_eq!((s.baud_rate, s.parity), (19_200, Parity::None)),
            other => panic!("unexpected transport {other:?}"),
        }
        assert_eq!(alicat.protocol_for(DeviceKind::Alicat), ProtocolKind::Ascii);
        assert!(alicat.validate(DeviceKind::Alicat).is_ok());
        assert!(alicat.clone().with_slave_id(26).validate(DeviceKind::Alicat).is_ok());
        let err = alicat.with_slave_id(27).validate(DeviceKind::Alicat).unwrap_err();
        assert!(err.to_string().contains("A-Z"));
        assert_eq!("alicat".parse::<DeviceKind>().unwrap(), DeviceKind::Alicat);
    }

    #[test]
    fn kind_names_parse() {
        assert_eq!("mass-flow-controller".parse::<DeviceKind>().unwrap(), DeviceKind::MassFlowController);
        assert_eq!("psu".parse::<DeviceKind>().unwrap(), DeviceKind::PowerSupply);
        assert!("toaster".parse::<DeviceKind>().is_err());
    }
}
