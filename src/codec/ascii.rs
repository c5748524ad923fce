//! ASCII line protocol of Alicat flow controllers.
//!
//! A command is the unit letter, a body and a carriage return. Every reply
//! is one `\r`-terminated line that starts with the unit letter; a bare `?`
//! field means the controller refused the command. Polling the unit (`A\r`)
//! returns the status line:
//!
//! ```text
//! A +014.70 +025.00 +000.00 +000.00 +000.00 Ar
//! ```
//!
//! which is pressure, temperature, volumetric flow, mass flow, setpoint and
//! the selected gas, followed by any alarm flags. As with the laser, catalog
//! slots name fields of the status line.

use crate::catalog::{alicat, Register, Value};
use crate::error::{AppResult, DeviceError, FramingError, ProtocolError, ValidationError};
use crate::retry::{with_retry, with_verify, RetryPolicy};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Ends every command and reply line.
pub const TERMINATOR: u8 = b'\r';

/// Gas numbers the controller reserves for user-defined mixes.
pub const MIX_NUMBERS: RangeInclusive<u8> = 236..=255;
/// Most gases one mix may combine.
pub const MAX_MIX_COMPONENTS: usize = 5;
const MAX_MIX_NAME: usize = 6;
/// Largest read-back error still counted as the requested setpoint.
const SETPOINT_TOLERANCE: f64 = 0.01;
/// Argon; selected when the gas in use before a mix scan has no number.
const FALLBACK_GAS: u8 = 1;

/// Built-in gases, indexed by gas number.
pub const STANDARD_GASES: [&str; 30] = [
    "Air", "Ar", "CH4", "CO", "CO2", "C2H6", "H2", "He", "N2", "N2O", "Ne", "O2", "C3H8",
    "nC4H10", "C2H2", "C2H4", "iC4H10", "Kr", "Xe", "SF6", "C-25", "C-10", "C-8", "C-2", "C-75",
    "A-75", "A-25", "A1025", "Star29", "P-5",
];

/// Number of a standard gas, matched without regard to case.
pub fn standard_gas(name: &str) -> Option<u8> {
    STANDARD_GASES
        .iter()
        .position(|gas| gas.eq_ignore_ascii_case(name))
        .and_then(|index| u8::try_from(index).ok())
}

/// Name of standard gas `number`; `None` for mix numbers.
pub fn gas_name(number: u8) -> Option<&'static str> {
    STANDARD_GASES.get(usize::from(number)).copied()
}

/// Unit letter for a configured unit id: 1 is `A`, 26 is `Z`.
pub fn unit_for(id: u8) -> Option<char> {
    (1..=26).contains(&id).then(|| char::from(b'A' + id - 1))
}

/// Variable the controller regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLoop {
    MassFlow,
    Pressure,
}

impl ControlLoop {
    /// Value of register 122 that selects this loop.
    pub fn register_value(self) -> u16 {
        match self {
            ControlLoop::MassFlow => 37,
            ControlLoop::Pressure => 34,
        }
    }

    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            37 => Some(ControlLoop::MassFlow),
            34 => Some(ControlLoop::Pressure),
            _ => None,
        }
    }
}

/// One gas of a mix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MixComponent {
    /// Standard gas number.
    pub gas: u8,
    pub percent: f64,
}

/// Commands understood by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiCommand {
    /// Request the status line.
    Poll,
    /// Write register 122.
    SelectLoop(ControlLoop),
    /// Setpoint of the active loop.
    Setpoint(f64),
    /// Select a standard gas or a mix by number.
    Gas(u8),
    /// Define a mix of standard gases.
    CreateMix {
        number: u8,
        name: String,
        components: Vec<MixComponent>,
    },
    /// Remove a mix definition.
    DeleteMix(u8),
}

impl AsciiCommand {
    /// Command text without unit letter and terminator.
    fn body(&self) -> String {
        match self {
            AsciiCommand::Poll => String::new(),
            AsciiCommand::SelectLoop(control) => format!("W122={}", control.register_value()),
            AsciiCommand::Setpoint(value) => format!("S{value:.2}"),
            AsciiCommand::Gas(number) => format!("G{number}"),
            AsciiCommand::CreateMix {
                number,
                name,
                components,
            } => {
                let mut body = format!("GM {name} {number}");
                for component in components {
                    body.push_str(&format!(" {:.2} {}", component.percent, component.gas));
                }
                body
            }
            AsciiCommand::DeleteMix(number) => format!("GD {number}"),
        }
    }

    /// Full command line for `unit`, terminator included.
    pub fn encode(&self, unit: char) -> Vec<u8> {
        let mut line = format!("{unit}{}", self.body()).into_bytes();
        line.push(TERMINATOR);
        line
    }

    /// Parse a command line the way the controller does. Returns the unit
    /// letter and the command, or `None` for anything it would not accept.
    pub fn decode(line: &[u8]) -> Option<(char, Self)> {
        let text = std::str::from_utf8(line).ok()?.strip_suffix('\r')?;
        let mut chars = text.chars();
        let unit = chars.next().filter(char::is_ascii_uppercase)?;
        let body = chars.as_str();

        let command = if body.is_empty() {
            AsciiCommand::Poll
        } else if let Some(value) = body.strip_prefix("W122=") {
            AsciiCommand::SelectLoop(ControlLoop::from_register(value.parse().ok()?)?)
        } else if let Some(rest) = body.strip_prefix("GM ") {
            decode_mix(rest)?
        } else if let Some(number) = body.strip_prefix("GD ") {
            AsciiCommand::DeleteMix(number.trim().parse().ok()?)
        } else if let Some(number) = body.strip_prefix('G') {
            AsciiCommand::Gas(number.parse().ok()?)
        } else if let Some(value) = body.strip_prefix('S') {
            AsciiCommand::Setpoint(value.parse().ok()?)
        } else {
            return None;
        };
        Some((unit, command))
    }
}

fn decode_mix(text: &str) -> Option<AsciiCommand> {
    let mut tokens = text.split_whitespace();
    let name = tokens.next()?.to_string();
    let number = tokens.next()?.parse().ok()?;
    let rest: Vec<&str> = tokens.collect();
    if rest.len() % 2 != 0 {
        return None;
    }
    let components = rest
        .chunks(2)
        .map(|pair| {
            Some(MixComponent {
                percent: pair[0].parse().ok()?,
                gas: pair[1].parse().ok()?,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(AsciiCommand::CreateMix {
        number,
        name,
        components,
    })
}

impl fmt::Display for AsciiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsciiCommand::Poll => f.write_str("poll"),
            other => f.write_str(&other.body()),
        }
    }
}

/// Decoded status line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlicatStatus {
    /// Absolute pressure, psia.
    pub pressure: f64,
    /// Gas temperature, C.
    pub temperature: f64,
    pub volumetric_flow: f64,
    pub mass_flow: f64,
    /// Setpoint of the active control loop.
    pub setpoint: f64,
    /// Gas or mix name as the controller shows it.
    pub gas: String,
    /// Alarm and state flags such as `HLD` or `OPL`.
    pub flags: Vec<String>,
}

impl AlicatStatus {
    const FIELDS: usize = 6;

    /// Decode the fields that follow the unit letter.
    pub fn decode(fields: &[String]) -> AppResult<Self> {
        if fields.len() < Self::FIELDS {
            return Err(FramingError::UnexpectedReply(format!(
                "status line has {} fields, expected {}",
                fields.len(),
                Self::FIELDS
            ))
            .into());
        }
        let number = |index: usize| -> AppResult<f64> {
            fields[index].parse().map_err(|_| {
                FramingError::UnexpectedReply(format!("'{}' is not a number", fields[index])).into()
            })
        };
        Ok(Self {
            pressure: number(0)?,
            temperature: number(1)?,
            volumetric_flow: number(2)?,
            mass_flow: number(3)?,
            setpoint: number(4)?,
            gas: fields[5].clone(),
            flags: fields[Self::FIELDS..].to_vec(),
        })
    }

    /// Status line as the controller prints it, terminator included.
    pub fn encode(&self, unit: char) -> Vec<u8> {
        let mut line = format!(
            "{unit} {:+07.2} {:+07.2} {:+07.2} {:+07.2} {:+07.2} {}",
            self.pressure,
            self.temperature,
            self.volumetric_flow,
            self.mass_flow,
            self.setpoint,
            self.gas
        );
        for flag in &self.flags {
            line.push(' ');
            line.push_str(flag);
        }
        line.push(char::from(TERMINATOR));
        line.into_bytes()
    }

    /// Value of one catalog slot. The gas slot needs a number and is
    /// resolved by the codec.
    pub fn field(&self, slot: u16) -> Option<Value> {
        let value = match slot {
            alicat::PRESSURE => self.pressure,
            alicat::TEMPERATURE => self.temperature,
            alicat::VOLUMETRIC_FLOW => self.volumetric_flow,
            alicat::MASS_FLOW => self.mass_flow,
            alicat::SETPOINT => self.setpoint,
            _ => return None,
        };
        Some(Value::from(value))
    }
}

impl fmt::Display for AlicatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pressure={} temp={} vol_flow={} mass_flow={} setpoint={} gas={}",
            self.pressure,
            self.temperature,
            self.volumetric_flow,
            self.mass_flow,
            self.setpoint,
            self.gas
        )?;
        if !self.flags.is_empty() {
            write!(f, " flags={}", self.flags.join(","))?;
        }
        Ok(())
    }
}

/// Alicat master for one unit letter on a shared line.
#[derive(Debug, Clone)]
pub struct AsciiLine {
    unit: char,
    timeout: Duration,
    policy: RetryPolicy,
    verify_policy: RetryPolicy,
    /// Last mix selected through this codec, for reading the gas slot back.
    selected_mix: Option<(u8, String)>,
}

impl AsciiLine {
    pub fn new(unit: char, timeout: Duration) -> Self {
        Self {
            unit,
            timeout,
            policy: RetryPolicy::ascii(),
            verify_policy: RetryPolicy::ascii_verify(),
            selected_mix: None,
        }
    }

    pub fn unit(&self) -> char {
        self.unit
    }

    /// One command, one reply line, no retries. Returns the reply fields
    /// after the unit letter.
    pub async fn exchange_once(
        &mut self,
        transport: &mut dyn Transport,
        command: &AsciiCommand,
    ) -> AppResult<Vec<String>> {
        let line = command.encode(self.unit);
        debug!(%command, unit = %self.unit, "alicat command");
        transport.write(&line).await?;
        let reply = transport.read_until(TERMINATOR, self.timeout).await?;
        let text = std::str::from_utf8(&reply)
            .map_err(|_| FramingError::UnexpectedReply("reply is not ASCII".into()))?;
        trace!(rx = text.trim_end(), "alicat reply");

        let mut fields = text.split_whitespace();
        let expected = self.unit.to_string();
        match fields.next() {
            Some(unit) if unit == expected => {}
            other => {
                return Err(FramingError::UnexpectedReply(format!(
                    "reply '{}' is not from unit {}",
                    other.unwrap_or_default(),
                    self.unit
                ))
                .into())
            }
        }
        let fields: Vec<String> = fields.map(str::to_string).collect();
        if fields.iter().any(|field| field == "?") {
            return Err(ProtocolError::CommandRejected(command.to_string()).into());
        }
        Ok(fields)
    }

    /// [`AsciiLine::exchange_once`] under the exchange retry policy.
    pub async fn exchange(
        &mut self,
        transport: &mut dyn Transport,
        command: &AsciiCommand,
    ) -> AppResult<Vec<String>> {
        let policy = self.policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            let command = command.clone();
            Box::pin(async move { codec.exchange_once(&mut **transport, &command).await })
        })
        .await
    }

    /// Poll the status line. A garbled line counts as a failed attempt.
    pub async fn status(&mut self, transport: &mut dyn Transport) -> AppResult<AlicatStatus> {
        let policy = self.policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            Box::pin(async move {
                let fields = codec.exchange_once(&mut **transport, &AsciiCommand::Poll).await?;
                AlicatStatus::decode(&fields)
            })
        })
        .await
    }

    /// Select the control loop and check the register echo.
    pub async fn select_loop(
        &mut self,
        transport: &mut dyn Transport,
        control: ControlLoop,
    ) -> AppResult<()> {
        let fields = self
            .exchange(transport, &AsciiCommand::SelectLoop(control))
            .await?;
        // Firmware prints either `122=37` or `122 = 37`.
        let reply = fields.concat();
        let selected = reply.rsplit('=').next().and_then(|v| v.parse::<u16>().ok());
        if selected != Some(control.register_value()) {
            return Err(DeviceError::verification(control.register_value(), reply));
        }
        Ok(())
    }

    /// Switch to `control` and drive it to `value`, confirmed from a poll.
    pub async fn set_setpoint(
        &mut self,
        transport: &mut dyn Transport,
        control: ControlLoop,
        value: f64,
    ) -> AppResult<AlicatStatus> {
        self.select_loop(transport, control).await?;
        info!(?control, value, unit = %self.unit, "alicat setpoint");
        self.verified(transport, AsciiCommand::Setpoint(value), move |status| {
            (status.setpoint - value).abs() <= SETPOINT_TOLERANCE
        })
        .await
    }

    /// Select a standard gas or a defined mix.
    pub async fn set_gas(&mut self, transport: &mut dyn Transport, number: u8) -> AppResult<AlicatStatus> {
        let expected = gas_name(number);
        let status = self
            .verified(transport, AsciiCommand::Gas(number), move |status| {
                expected.map_or(true, |name| status.gas.eq_ignore_ascii_case(name))
            })
            .await?;
        self.selected_mix = expected.is_none().then(|| (number, status.gas.clone()));
        info!(number, gas = %status.gas, "alicat gas selected");
        Ok(status)
    }

    /// Define mix `number` from standard gases. Checked locally first: the
    /// number must be a mix number, the name 1-6 printable characters, and
    /// 2-5 components must add up to 100 percent.
    pub async fn create_mix(
        &mut self,
        transport: &mut dyn Transport,
        number: u8,
        name: &str,
        components: &[MixComponent],
    ) -> AppResult<()> {
        check_mix(number, name, components)?;
        let command = AsciiCommand::CreateMix {
            number,
            name: name.to_string(),
            components: components.to_vec(),
        };
        self.exchange(transport, &command).await?;
        info!(number, name, "gas mix defined");
        Ok(())
    }

    /// Remove mix `number` (236-255).
    pub async fn delete_mix(&mut self, transport: &mut dyn Transport, number: u8) -> AppResult<()> {
        check_mix_number(number)?;
        self.exchange(transport, &AsciiCommand::DeleteMix(number))
            .await?;
        if self.selected_mix.as_ref().is_some_and(|(n, _)| *n == number) {
            self.selected_mix = None;
        }
        info!(number, "gas mix deleted");
        Ok(())
    }

    /// Every defined mix, found by selecting each mix number in turn.
    ///
    /// The gas in use beforehand is selected again afterwards, also when the
    /// scan fails. If that gas cannot be named by number, argon is selected.
    pub async fn gas_mixes(&mut self, transport: &mut dyn Transport) -> AppResult<BTreeMap<u8, String>> {
        let before = self.status(transport).await?;
        let scanned = self.scan_mixes(transport).await;
        let restore = match &scanned {
            Ok(mixes) => standard_gas(&before.gas).or_else(|| {
                mixes
                    .iter()
                    .find(|(_, name)| **name == before.gas)
                    .map(|(number, _)| *number)
            }),
            Err(_) => standard_gas(&before.gas),
        }
        .unwrap_or(FALLBACK_GAS);
        let restored = self.set_gas(transport, restore).await;

        match (scanned, restored) {
            (Ok(mixes), Ok(_)) => Ok(mixes),
            (Ok(_), Err(err)) => {
                warn!(error = %err, gas = %before.gas, "mix scan finished but the gas was not restored");
                Err(err)
            }
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!(error = %restore_err, "failed to restore the gas after a mix scan");
                }
                Err(err)
            }
        }
    }

    async fn scan_mixes(&mut self, transport: &mut dyn Transport) -> AppResult<BTreeMap<u8, String>> {
        let mut mixes = BTreeMap::new();
        for number in MIX_NUMBERS {
            match self.exchange(transport, &AsciiCommand::Gas(number)).await {
                Ok(fields) => {
                    mixes.insert(number, AlicatStatus::decode(&fields)?.gas);
                }
                Err(DeviceError::Protocol(ProtocolError::CommandRejected(_))) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(found = mixes.len(), "gas mixes scanned");
        Ok(mixes)
    }

    /// Read one catalog slot from a fresh poll.
    pub async fn read(&mut self, transport: &mut dyn Transport, register: &Register) -> AppResult<Value> {
        let status = self.status(transport).await?;
        if register.address == alicat::GAS {
            let mix = self
                .selected_mix
                .as_ref()
                .filter(|(_, name)| *name == status.gas)
                .map(|(number, _)| *number);
            return standard_gas(&status.gas)
                .or(mix)
                .map(|number| Value::from(u16::from(number)))
                .ok_or_else(|| {
                    ValidationError::TypeMismatch {
                        register: register.name.to_string(),
                        reason: format!("gas '{}' has no known number", status.gas),
                    }
                    .into()
                });
        }
        status
            .field(register.address)
            .ok_or_else(|| ValidationError::UnknownRegister(register.name.to_string()).into())
    }

    pub async fn write(
        &mut self,
        transport: &mut dyn Transport,
        register: &Register,
        value: &Value,
    ) -> AppResult<()> {
        let mismatch = |reason: &str| -> DeviceError {
            ValidationError::TypeMismatch {
                register: register.name.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        match register.address {
            alicat::FLOW_SETPOINT | alicat::PRESSURE_SETPOINT => {
                let target = value.as_f64().ok_or_else(|| mismatch("expected a number"))?;
                let control = if register.address == alicat::FLOW_SETPOINT {
                    ControlLoop::MassFlow
                } else {
                    ControlLoop::Pressure
                };
                self.set_setpoint(transport, control, target).await.map(|_| ())
            }
            alicat::GAS => {
                let number = value
                    .as_i64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| mismatch("expected a gas number 0-255"))?;
                self.set_gas(transport, number).await.map(|_| ())
            }
            _ => Err(ValidationError::ReadOnly(register.name.to_string()).into()),
        }
    }

    async fn verified<P>(
        &mut self,
        transport: &mut dyn Transport,
        command: AsciiCommand,
        check: P,
    ) -> AppResult<AlicatStatus>
    where
        P: Fn(&AlicatStatus) -> bool,
    {
        let policy = self.verify_policy.clone();
        let mut ctx = (self, transport);
        let verified = with_verify(
            &policy,
            &mut ctx,
            &command,
            |(codec, transport)| {
                let command = command.clone();
                Box::pin(async move {
                    codec.exchange(&mut **transport, &command).await.map(|_| ())
                })
            },
            |(codec, transport)| Box::pin(async move { codec.status(&mut **transport).await }),
            check,
        )
        .await?;
        Ok(verified.value)
    }
}

fn check_mix_number(number: u8) -> AppResult<()> {
    if MIX_NUMBERS.contains(&number) {
        return Ok(());
    }
    Err(ValidationError::OutOfRange {
        register: "MIX".to_string(),
        value: f64::from(number),
        min: f64::from(*MIX_NUMBERS.start()),
        max: f64::from(*MIX_NUMBERS.end()),
    }
    .into())
}

fn check_mix(number: u8, name: &str, components: &[MixComponent]) -> AppResult<()> {
    check_mix_number(number)?;
    let invalid = |reason: String| -> DeviceError {
        ValidationError::TypeMismatch {
            register: "MIX".to_string(),
            reason,
        }
        .into()
    };
    if name.is_empty() || name.len() > MAX_MIX_NAME || !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(invalid(format!(
            "mix name '{name}' must be 1-{MAX_MIX_NAME} printable characters"
        )));
    }
    if !(2..=MAX_MIX_COMPONENTS).contains(&components.len()) {
        return Err(invalid(format!(
            "a mix needs 2-{MAX_MIX_COMPONENTS} gases, got {}",
            components.len()
        )));
    }
    if let Some(component) = components.iter().find(|c| gas_name(c.gas).is_none()) {
        return Err(invalid(format!("gas {} is not a standard gas", component.gas)));
    }
    if components.iter().any(|c| c.percent <= 0.0) {
        return Err(invalid("every gas needs a positive share".to_string()));
    }
    let total: f64 = components.iter().map(|c| c.percent).sum();
    if (total - 100.0).abs() > SETPOINT_TOLERANCE {
        return Err(invalid(format!("percentages add up to {total}, not 100")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ALICAT;
    use crate::sim::AlicatDevice;

    fn mix(parts: &[(u8, f64)]) -> Vec<MixComponent> {
        parts
            .iter()
            .map(|(gas, percent)| MixComponent {
                gas: *gas,
                percent: *percent,
            })
            .collect()
    }

    #[test]
    fn commands_encode_with_unit_and_carriage_return() {
        assert_eq!(AsciiCommand::Poll.encode('A'), b"A\r");
        assert_eq!(AsciiCommand::Setpoint(12.5).encode('B'), b"BS12.50\r");
        assert_eq!(
            AsciiCommand::SelectLoop(ControlLoop::Pressure).encode('A'),
            b"AW122=34\r"
        );
        let create = AsciiCommand::CreateMix {
            number: 236,
            name: "ArCO2".into(),
            components: mix(&[(1, 75.0), (4, 25.0)]),
        };
        assert_eq!(create.encode('A'), b"AGM ArCO2 236 75.00 1 25.00 4\r");
        assert_eq!(AsciiCommand::decode(b"AGM ArCO2 236 75.00 1 25.00 4\r"), Some(('A', create)));
        assert_eq!(AsciiCommand::decode(b"AGD 240\r"), Some(('A', AsciiCommand::DeleteMix(240))));
        assert_eq!(AsciiCommand::decode(b"AX\r"), None);
        assert_eq!(AsciiCommand::decode(b"A"), None);
    }

    #[test]
    fn status_line_decodes_with_flags() {
        let fields: Vec<String> = "+014.70 +025.00 +001.20 +001.10 +001.00 N2 HLD"
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let status = AlicatStatus::decode(&fields).unwrap();
        assert_eq!(status.pressure, 14.7);
        assert_eq!(status.mass_flow, 1.1);
        assert_eq!(status.gas, "N2");
        assert_eq!(status.flags, vec!["HLD"]);
        assert_eq!(status.field(alicat::SETPOINT), Some(Value::Float(1.0)));
        assert!(AlicatStatus::decode(&fields[..4]).is_err());
    }

    #[test]
    fn unit_letters_and_gas_numbers() {
        assert_eq!(unit_for(1), Some('A'));
        assert_eq!(unit_for(26), Some('Z'));
        assert_eq!(unit_for(0), None);
        assert_eq!(unit_for(27), None);
        assert_eq!(standard_gas("co2"), Some(4));
        assert_eq!(gas_name(29), Some("P-5"));
        assert_eq!(gas_name(30), None);
    }

    #[tokio::test(start_paused = true)]
    async fn flow_setpoint_switches_to_the_mass_flow_loop() {
        let device = AlicatDevice::new('A');
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(100));

        let status = codec
            .set_setpoint(&mut transport, ControlLoop::MassFlow, 2.5)
            .await
            .unwrap();
        assert_eq!(status.setpoint, 2.5);
        assert_eq!(status.mass_flow, 2.5);
        assert_eq!(device.control_loop(), ControlLoop::MassFlow);
        assert_eq!(device.commands(), vec!["W122=37", "S2.50", ""]);
    }

    #[tokio::test(start_paused = true)]
    async fn question_mark_reply_is_a_rejection() {
        let device = AlicatDevice::new('A');
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(100));

        let err = codec.set_gas(&mut transport, 240).await.unwrap_err();
        assert_eq!(err, ProtocolError::CommandRejected("G240".into()).into());
        // Rejections are not retried.
        assert_eq!(device.commands(), vec!["G240"]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_units_stay_silent() {
        let device = AlicatDevice::new('B');
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(50));
        let err = codec.status(&mut transport).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(device.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_mixes_never_reach_the_wire() {
        let device = AlicatDevice::new('A');
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(100));
        let good = mix(&[(1, 50.0), (8, 50.0)]);

        for (number, name, components) in [
            (12, "mix", good.clone()),
            (236, "", good.clone()),
            (236, "toolong", good.clone()),
            (236, "two w", good.clone()),
            (236, "mix", mix(&[(1, 100.0)])),
            (236, "mix", mix(&[(1, 50.0), (8, 40.0)])),
            (236, "mix", mix(&[(1, 50.0), (99, 50.0)])),
        ] {
            assert!(
                matches!(
                    codec.create_mix(&mut transport, number, name, &components).await,
                    Err(DeviceError::Validation(_))
                ),
                "{number} {name} {components:?}"
            );
        }
        assert!(codec.delete_mix(&mut transport, 3).await.is_err());
        assert!(device.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mix_scan_restores_the_selected_gas() {
        let device = AlicatDevice::new('A')
            .with_mix(236, "ArCO2", mix(&[(1, 75.0), (4, 25.0)]))
            .with_mix(250, "HeNe", mix(&[(7, 90.0), (10, 10.0)]));
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(100));
        codec.set_gas(&mut transport, 8).await.unwrap();

        let mixes = codec.gas_mixes(&mut transport).await.unwrap();
        assert_eq!(
            mixes,
            BTreeMap::from([(236, "ArCO2".to_string()), (250, "HeNe".to_string())])
        );
        assert_eq!(device.gas(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn gas_slot_reads_back_a_selected_mix() {
        let device = AlicatDevice::new('A').with_mix(240, "N2O2", mix(&[(8, 79.0), (11, 21.0)]));
        let mut transport = device.transport();
        let mut codec = AsciiLine::new('A', Duration::from_millis(100));
        let gas = ALICAT.get("GAS").unwrap();

        assert_eq!(codec.read(&mut transport, gas).await.unwrap(), Value::Integer(1));
        codec.write(&mut transport, gas, &Value::Integer(240)).await.unwrap();
        assert_eq!(codec.read(&mut transport, gas).await.unwrap(), Value::Integer(240));

        let pressure = ALICAT.get("PRESSURE").unwrap();
        assert!(codec.write(&mut transport, pressure, &Value::Float(15.0)).await.is_err());
    }
}
