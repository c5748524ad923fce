//! Single-opcode protocol of the UC-2000 CO2 laser controller.
//!
//! Commands are `[0x5B][opcode][data?][checksum]` with
//! `checksum = !(opcode + data)`; the controller acknowledges with a single
//! byte. The status query is the bare byte 0x7E, answered by a five-byte
//! status block.
//!
//! The controller has no registers. Catalog slots for the laser name fields
//! of the status block, and writes are translated into opcodes. Every
//! state-changing command is verified by re-querying the status until the
//! field matches.

use crate::catalog::{laser, Register, Value};
use crate::error::{AppResult, DeviceError, ProtocolError, ValidationError};
use crate::retry::{with_retry, with_verify, RetryPolicy};
use crate::transport::{hex, Transport};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const COMMAND_START: u8 = 0x5B;
pub const STATUS_QUERY: u8 = 0x7E;
pub const STATUS_LEN: usize = 5;

/// Mode index of remote control.
pub const REMOTE_MODE: u8 = 5;
/// Mode the controller is handed back in: front-panel manual control.
pub const LOCAL_MODE: u8 = 0;
pub const MODE_NAMES: [&str; 6] = [
    "manual",
    "ANC",
    "ANV",
    "manual closed",
    "ANV closed",
    "remote",
];
const FREQUENCIES_KHZ: [u8; 3] = [5, 10, 20];

pub fn checksum(opcode: u8, data: Option<u8>) -> u8 {
    !opcode.wrapping_add(data.unwrap_or(0))
}

pub fn encode_command(opcode: u8, data: Option<u8>) -> Vec<u8> {
    let mut frame = vec![COMMAND_START, opcode];
    frame.extend(data);
    frame.push(checksum(opcode, data));
    frame
}

/// Decoded five-byte status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaserStatus {
    pub mode: u8,
    pub remote_control: bool,
    pub laser_on: bool,
    pub gate_pull_up: bool,
    /// PWM frequency in kHz; zero for the reserved selector value.
    pub pwm_frequency: u8,
    pub lase_on_powerup: bool,
    pub max_pwm_95: bool,
    pub version: u8,
    /// PWM duty in half-percent steps.
    pub pwm_raw: u8,
    /// Output power in half-percent steps.
    pub power_raw: u8,
}

impl LaserStatus {
    pub fn decode(reply: &[u8]) -> AppResult<Self> {
        if reply.len() != STATUS_LEN {
            return Err(crate::error::FramingError::ShortFrame {
                expected: STATUS_LEN,
                received: reply.len(),
            }
            .into());
        }
        let flags = reply[1];
        let options = reply[2];
        Ok(Self {
            mode: flags & 0x07,
            remote_control: flags & 0x08 != 0,
            laser_on: flags & 0x10 != 0,
            gate_pull_up: flags & 0x20 != 0,
            pwm_frequency: FREQUENCIES_KHZ
                .get(usize::from(flags >> 6))
                .copied()
                .unwrap_or(0),
            lase_on_powerup: options & 0x01 != 0,
            max_pwm_95: options & 0x02 != 0,
            version: options >> 4,
            pwm_raw: reply[3],
            power_raw: reply[4],
        })
    }

    /// Inverse of [`LaserStatus::decode`], with a zero lead byte.
    pub fn encode(&self) -> [u8; STATUS_LEN] {
        let selector = FREQUENCIES_KHZ
            .iter()
            .position(|f| *f == self.pwm_frequency)
            .unwrap_or(3) as u8;
        let flags = (self.mode & 0x07)
            | u8::from(self.remote_control) << 3
            | u8::from(self.laser_on) << 4
            | u8::from(self.gate_pull_up) << 5
            | selector << 6;
        let options = u8::from(self.lase_on_powerup)
            | u8::from(self.max_pwm_95) << 1
            | (self.version & 0x0F) << 4;
        [0, flags, options, self.pwm_raw, self.power_raw]
    }

    pub fn mode_name(&self) -> &'static str {
        MODE_NAMES.get(usize::from(self.mode)).copied().unwrap_or("unknown")
    }

    pub fn pwm_percentage(&self) -> f64 {
        f64::from(self.pwm_raw) / 2.0
    }

    pub fn power_percentage(&self) -> f64 {
        f64::from(self.power_raw) / 2.0
    }

    /// Value of one catalog slot.
    pub fn field(&self, slot: u16) -> Option<Value> {
        let value = match slot {
            laser::MODE => Value::from(i64::from(self.mode)),
            laser::REMOTE_CONTROL => Value::from(self.remote_control),
            laser::LASER_ON => Value::from(self.laser_on),
            laser::GATE_PULL_UP => Value::from(self.gate_pull_up),
            laser::PWM_FREQUENCY => Value::from(i64::from(self.pwm_frequency)),
            laser::LASE_ON_POWERUP => Value::from(self.lase_on_powerup),
            laser::MAX_PWM_95 => Value::from(self.max_pwm_95),
            laser::VERSION => Value::from(i64::from(self.version)),
            laser::PWM_PERCENTAGE => Value::from(self.pwm_percentage()),
            laser::POWER_PERCENTAGE => Value::from(self.power_percentage()),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for LaserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={} remote={} laser_on={} gate_pull_up={} freq={}kHz powerup={} max95={} pwm={}%",
            self.mode_name(),
            self.remote_control,
            self.laser_on,
            self.gate_pull_up,
            self.pwm_frequency,
            self.lase_on_powerup,
            self.max_pwm_95,
            self.pwm_percentage()
        )
    }
}

/// State-changing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserCommand {
    /// Operating mode 0..=5; 5 selects remote control.
    Mode(u8),
    Lase(bool),
    /// PWM frequency in kHz: 5, 10 or 20.
    Frequency(u8),
    GatePullUp(bool),
    MaxPwm95(bool),
    LaseOnPowerup(bool),
    /// PWM duty in half-percent steps.
    Pwm(u8),
}

impl LaserCommand {
    pub fn opcode(&self) -> u8 {
        match *self {
            LaserCommand::Mode(mode) => 0x70 + mode.min(REMOTE_MODE),
            LaserCommand::Lase(true) => 0x75,
            LaserCommand::Lase(false) => 0x76,
            LaserCommand::Frequency(5) => 0x77,
            LaserCommand::Frequency(10) => 0x78,
            LaserCommand::Frequency(_) => 0x79,
            LaserCommand::GatePullUp(true) => 0x7A,
            LaserCommand::GatePullUp(false) => 0x7B,
            LaserCommand::MaxPwm95(true) => 0x7C,
            LaserCommand::MaxPwm95(false) => 0x7D,
            LaserCommand::LaseOnPowerup(true) => 0x30,
            LaserCommand::LaseOnPowerup(false) => 0x31,
            LaserCommand::Pwm(_) => 0x7F,
        }
    }

    pub fn data(&self) -> Option<u8> {
        match *self {
            LaserCommand::Pwm(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn frame(&self) -> Vec<u8> {
        encode_command(self.opcode(), self.data())
    }

    /// PWM duty command from a percentage (0-99), half-percent resolution.
    pub fn pwm_percent(percent: f64) -> Self {
        LaserCommand::Pwm((percent.clamp(0.0, 99.0) * 2.0) as u8)
    }

    /// Whether `status` shows the command took effect.
    pub fn satisfied_by(&self, status: &LaserStatus) -> bool {
        match *self {
            LaserCommand::Mode(REMOTE_MODE) => status.remote_control,
            LaserCommand::Mode(mode) => status.mode == mode,
            LaserCommand::Lase(on) => status.laser_on == on,
            LaserCommand::Frequency(khz) => status.pwm_frequency == khz,
            LaserCommand::GatePullUp(on) => status.gate_pull_up == on,
            LaserCommand::MaxPwm95(on) => status.max_pwm_95 == on,
            LaserCommand::LaseOnPowerup(on) => status.lase_on_powerup == on,
            LaserCommand::Pwm(raw) => status.pwm_raw == raw,
        }
    }

    fn needs_remote(&self) -> bool {
        matches!(
            self,
            LaserCommand::Frequency(_) | LaserCommand::GatePullUp(_) | LaserCommand::MaxPwm95(_)
        )
    }

    /// Changes the controller only accepts while the beam is off.
    fn needs_laser_off(&self) -> bool {
        matches!(self, LaserCommand::Frequency(_) | LaserCommand::GatePullUp(_))
    }

    fn name(&self) -> &'static str {
        match self {
            LaserCommand::Mode(_) => "mode change",
            LaserCommand::Lase(_) => "lase on/off",
            LaserCommand::Frequency(_) => "PWM frequency change",
            LaserCommand::GatePullUp(_) => "gate pull-up change",
            LaserCommand::MaxPwm95(_) => "max PWM 95% change",
            LaserCommand::LaseOnPowerup(_) => "lase-on-power-up change",
            LaserCommand::Pwm(_) => "PWM duty change",
        }
    }

    /// Translate a catalog write into a command.
    pub fn from_write(register: &Register, value: &Value) -> AppResult<Self> {
        let mismatch = |reason: &str| -> DeviceError {
            ValidationError::TypeMismatch {
                register: register.name.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        if register.address == laser::PWM_PERCENTAGE {
            let percent = value.as_f64().ok_or_else(|| mismatch("expected a percentage"))?;
            return Ok(LaserCommand::pwm_percent(percent));
        }
        let int = value.as_i64().ok_or_else(|| mismatch("expected an integer"))?;
        let flag = int != 0;
        match register.address {
            laser::MODE => u8::try_from(int)
                .ok()
                .filter(|m| *m <= REMOTE_MODE)
                .map(LaserCommand::Mode)
                .ok_or_else(|| mismatch("mode must be 0-5")),
            laser::LASER_ON => Ok(LaserCommand::Lase(flag)),
            laser::GATE_PULL_UP => Ok(LaserCommand::GatePullUp(flag)),
            laser::LASE_ON_POWERUP => Ok(LaserCommand::LaseOnPowerup(flag)),
            laser::MAX_PWM_95 => Ok(LaserCommand::MaxPwm95(flag)),
            laser::PWM_FREQUENCY => FREQUENCIES_KHZ
                .iter()
                .find(|f| i64::from(**f) == int)
                .map(|f| LaserCommand::Frequency(*f))
                .ok_or_else(|| mismatch("frequency must be 5, 10 or 20 kHz")),
            _ => Err(ValidationError::ReadOnly(register.name.to_string()).into()),
        }
    }
}

impl fmt::Display for LaserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LaserCommand::Mode(mode) => {
                write!(f, "mode {}", MODE_NAMES.get(usize::from(mode)).unwrap_or(&"?"))
            }
            LaserCommand::Lase(on) => write!(f, "laser_on={on}"),
            LaserCommand::Frequency(khz) => write!(f, "freq={khz}kHz"),
            LaserCommand::GatePullUp(on) => write!(f, "gate_pull_up={on}"),
            LaserCommand::MaxPwm95(on) => write!(f, "max95={on}"),
            LaserCommand::LaseOnPowerup(on) => write!(f, "powerup={on}"),
            LaserCommand::Pwm(raw) => write!(f, "pwm={}%", f64::from(raw) / 2.0),
        }
    }
}

/// Laser controller master.
#[derive(Debug, Clone)]
pub struct Opcode {
    timeout: Duration,
    /// Wait between a command and its verifying status query.
    settle: Duration,
    /// Wait after selecting remote mode.
    remote_settle: Duration,
    command_policy: RetryPolicy,
    status_policy: RetryPolicy,
}

impl Opcode {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            settle: Duration::from_secs(1),
            remote_settle: Duration::from_secs(2),
            command_policy: RetryPolicy::laser_command(),
            status_policy: RetryPolicy::laser_status(),
        }
    }

    pub fn with_settle(mut self, settle: Duration, remote_settle: Duration) -> Self {
        self.settle = settle;
        self.remote_settle = remote_settle;
        self
    }

    /// Query the status block, retrying transient failures.
    pub async fn status(&mut self, transport: &mut dyn Transport) -> AppResult<LaserStatus> {
        let policy = self.status_policy.clone();
        let mut ctx = (self, transport);
        with_retry(&policy, &mut ctx, |(codec, transport)| {
            Box::pin(async move { codec.status_once(&mut **transport).await })
        })
        .await
    }

    async fn status_once(&mut self, transport: &mut dyn Transport) -> AppResult<LaserStatus> {
        transport.write(&[STATUS_QUERY]).await?;
        let reply = transport.read_exact(STATUS_LEN, self.timeout).await?;
        let status = LaserStatus::decode(&reply)?;
        debug!(rx = %hex(&reply), %status, "laser status");
        Ok(status)
    }

    /// Send one command and wait for its single-byte acknowledgement.
    pub async fn command_once(
        &mut self,
        transport: &mut dyn Transport,
        command: LaserCommand,
    ) -> AppResult<()> {
        let frame = command.frame();
        debug!(%command, tx = %hex(&frame), "laser command");
        transport.write(&frame).await?;
        transport.read_exact(1, self.timeout).await?;
        Ok(())
    }

    /// Apply a command with the controller's preconditions and verify it.
    pub async fn apply(
        &mut self,
        transport: &mut dyn Transport,
        command: LaserCommand,
    ) -> AppResult<LaserStatus> {
        if command == LaserCommand::Mode(REMOTE_MODE) {
            return self.ensure_remote(transport).await;
        }
        if !command.needs_remote() {
            return self.verified(transport, command).await;
        }
        let status = self.status(transport).await?;
        if !status.remote_control {
            return Err(ProtocolError::RemoteRequired(command.name()).into());
        }
        if command.needs_laser_off() && status.laser_on {
            self.while_laser_off(transport, command).await
        } else {
            self.verified(transport, command).await
        }
    }

    /// Select remote control unless the controller is already in it.
    pub async fn ensure_remote(&mut self, transport: &mut dyn Transport) -> AppResult<LaserStatus> {
        let status = self.status(transport).await?;
        if status.remote_control {
            return Ok(status);
        }
        info!("selecting remote control mode");
        self.command_once(transport, LaserCommand::Mode(REMOTE_MODE))
            .await?;
        tokio::time::sleep(self.remote_settle).await;
        let status = self.status(transport).await?;
        if !status.remote_control {
            return Err(DeviceError::verification("remote control", status));
        }
        Ok(status)
    }

    /// Return the controller to front-panel control before the port closes.
    pub async fn release(&mut self, transport: &mut dyn Transport) -> AppResult<()> {
        info!("returning laser to local control");
        self.command_once(transport, LaserCommand::Mode(LOCAL_MODE))
            .await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Read one catalog slot from a fresh status query.
    pub async fn read(
        &mut self,
        transport: &mut dyn Transport,
        register: &Register,
    ) -> AppResult<Value> {
        let status = self.status(transport).await?;
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
        let command = LaserCommand::from_write(register, value)?;
        self.apply(transport, command).await.map(|_| ())
    }

    async fn verified(
        &mut self,
        transport: &mut dyn Transport,
        command: LaserCommand,
    ) -> AppResult<LaserStatus> {
        let policy = self.command_policy.clone();
        let settle = self.settle;
        let mut ctx = (self, transport);
        let verified = with_verify(
            &policy,
            &mut ctx,
            command,
            |(codec, transport)| Box::pin(async move { codec.command_once(&mut **transport, command).await }),
            |(codec, transport)| {
                Box::pin(async move {
                    tokio::time::sleep(settle).await;
                    codec.status(&mut **transport).await
                })
            },
            |status| command.satisfied_by(status),
        )
        .await?;
        Ok(verified.value)
    }

    /// Switch the beam off, apply `command`, then restore the beam even when
    /// the command failed.
    async fn while_laser_off(
        &mut self,
        transport: &mut dyn Transport,
        command: LaserCommand,
    ) -> AppResult<LaserStatus> {
        info!(%command, "switching laser off for the change");
        self.verified(transport, LaserCommand::Lase(false)).await?;
        let outcome = self.verified(transport, command).await;
        let restored = self.verified(transport, LaserCommand::Lase(true)).await;
        match (outcome, restored) {
            (Ok(_), Ok(status)) => Ok(status),
            (Ok(_), Err(err)) => {
                warn!(error = %err, "change applied but laser could not be switched back on");
                Err(err)
            }
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!(error = %restore_err, "failed to restore laser state");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LASER;
    use crate::sim::LaserController;

    #[test]
    fn checksum_is_inverted_sum() {
        assert_eq!(encode_command(0x75, None), vec![0x5B, 0x75, 0x8A]);
        assert_eq!(encode_command(0x7F, Some(100)), vec![0x5B, 0x7F, 100, 0x1C]);
        assert_eq!(LaserCommand::pwm_percent(50.0).frame(), vec![0x5B, 0x7F, 100, 0x1C]);
    }

    #[test]
    fn status_bits_decode() {
        let status = LaserStatus::decode(&[0x00, 0b0101_1101, 0x32, 41, 80]).unwrap();
        assert_eq!(status.mode, 5);
        assert!(status.remote_control);
        assert!(status.laser_on);
        assert!(!status.gate_pull_up);
        assert_eq!(status.pwm_frequency, 10);
        assert!(!status.lase_on_powerup);
        assert!(status.max_pwm_95);
        assert_eq!(status.version, 3);
        assert_eq!(status.pwm_percentage(), 20.5);
        assert_eq!(status.power_percentage(), 40.0);
        assert_eq!(LaserStatus::decode(&status.encode()).unwrap(), status);
    }

    #[test]
    fn writes_translate_to_opcodes() {
        let freq = LASER.get("PWM_FREQUENCY").unwrap();
        assert_eq!(
            LaserCommand::from_write(freq, &Value::Integer(20)).unwrap().opcode(),
            0x79
        );
        assert!(LaserCommand::from_write(freq, &Value::Integer(7)).is_err());
        let powerup = LASER.get("LASE_ON_POWERUP").unwrap();
        assert_eq!(
            LaserCommand::from_write(powerup, &Value::Integer(1)).unwrap().opcode(),
            0x30
        );
        let version = LASER.get("VERSION").unwrap();
        assert!(LaserCommand::from_write(version, &Value::Integer(1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn frequency_change_cycles_the_beam() {
        let laser = LaserController::new();
        laser.update(|s| {
            s.remote_control = true;
            s.mode = REMOTE_MODE;
            s.laser_on = true;
            s.pwm_frequency = 5;
        });
        let mut transport = laser.transport();
        let mut codec = Opcode::new(Duration::from_millis(100));

        let status = codec
            .apply(&mut transport, LaserCommand::Frequency(20))
            .await
            .unwrap();
        assert_eq!(status.pwm_frequency, 20);
        assert!(status.laser_on);
        assert_eq!(laser.commands(), vec![0x76, 0x79, 0x75]);
    }

    #[tokio::test(start_paused = true)]
    async fn beam_is_restored_when_the_change_fails() {
        let laser = LaserController::new();
        laser.update(|s| {
            s.remote_control = true;
            s.mode = REMOTE_MODE;
            s.laser_on = true;
        });
        laser.ignore_opcode(0x7A);
        let mut transport = laser.transport();
        let mut codec = Opcode::new(Duration::from_millis(100));

        let err = codec
            .apply(&mut transport, LaserCommand::GatePullUp(true))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::VerificationFailed { .. }));
        assert!(laser.state().laser_on);
        assert_eq!(laser.commands(), vec![0x76, 0x7A, 0x7A, 0x7A, 0x75]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_change_needs_remote_mode() {
        let laser = LaserController::new();
        let mut transport = laser.transport();
        let mut codec = Opcode::new(Duration::from_millis(100));
        let err = codec
            .apply(&mut transport, LaserCommand::GatePullUp(true))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::RemoteRequired("gate pull-up change").into()
        );
        assert!(laser.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_control_back_to_the_panel() {
        let laser = LaserController::new();
        let mut transport = laser.transport();
        let mut codec = Opcode::new(Duration::from_millis(100));
        codec.ensure_remote(&mut transport).await.unwrap();
        codec.release(&mut transport).await.unwrap();
        assert_eq!(laser.commands(), vec![0x75, 0x70]);
        assert!(!laser.state().remote_control);
        assert_eq!(laser.state().mode, LOCAL_MODE);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_is_selected_once() {
        let laser = LaserController::new();
        let mut transport = laser.transport();
        let mut codec = Opcode::new(Duration::from_millis(100));
        assert!(codec.ensure_remote(&mut transport).await.unwrap().remote_control);
        assert!(codec.ensure_remote(&mut transport).await.unwrap().remote_control);
        assert_eq!(laser.commands(), vec![0x75]);
    }
}
