//! Pulsed DC power supply on the STX/DLE/ETX framed protocol.
//!
//! Protocol overview:
//! - 19200 baud, 8N1
//! - Every exchange opens with an STX/DLE handshake; see
//!   [`crate::codec::framed`] for the frame layout
//! - Register 0 carries the operating mode in its low nibble, offset by
//!   0x8000, and the status bits in the same word
//! - Setpoints are scaled integers: 0.2 V and 1 mA per count
//!
//! # Example
//!
//! ```no_run
//! use labbridge::config::DeviceKind;
//! use labbridge::drivers::{self, PowerSupply};
//! use labbridge::session::SessionManager;
//!
//! # async fn demo() -> labbridge::error::AppResult<()> {
//! let manager = SessionManager::default();
//! let config = DeviceKind::PowerSupply.config_for("/dev/ttyUSB2");
//! let (psu, _) = drivers::connect::<PowerSupply>(&manager, config).await?;
//!
//! psu.set_voltage(400.0).await?;
//! psu.set_current(1.5).await?;
//! psu.set_running(2, true).await?;
//! println!("{:?}", psu.status().await?);
//! # Ok(())
//! # }
//! ```

use super::{integer, Device, Driver};
use crate::codec::FramedCommand;
use crate::config::DeviceKind;
use crate::error::{AppResult, FramingError, ValidationError};
use crate::retry::{with_retry, RetryPolicy};
use crate::session::Link;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Volts per voltage count.
pub const VOLTS_PER_COUNT: f64 = 0.2;
/// Amps per current count.
pub const AMPS_PER_COUNT: f64 = 0.001;

const COUNTS_PER_VOLT: f64 = 5.0;
const COUNTS_PER_AMP: f64 = 1000.0;

const MODE_OFFSET: u16 = 0x8000;
const DC1_ON: u16 = 32 + 1;
const DC1_OFF: u16 = 32;
const CLEAR_ERROR: u16 = 3;

/// Operating modes accepted by [`PowerSupply::set_running`].
pub const MODE_NAMES: [(u8, &str); 3] = [
    (1, "bipolar"),
    (2, "unipolar negative"),
    (3, "unipolar positive"),
];

/// Everything `status` could read. A field is `None` when its register
/// did not answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplyStatus {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub actual_voltage: Option<f64>,
    pub actual_current: Option<f64>,
    pub mode: Option<u8>,
    pub dc1_on: Option<bool>,
    pub power_on: Option<bool>,
    pub error: Option<bool>,
    pub ready: Option<bool>,
    pub error_code: Option<u16>,
}

impl SupplyStatus {
    pub fn mode_name(&self) -> Option<&'static str> {
        let mode = self.mode?;
        MODE_NAMES.iter().find(|(m, _)| *m == mode).map(|(_, name)| *name)
    }
}

/// Mode code from a register-0 word. A zero nibble reads as bipolar.
pub fn decode_mode(raw: u16) -> u8 {
    match (raw.wrapping_sub(MODE_OFFSET) & 0x0F) as u8 {
        0 => 1,
        mode => mode,
    }
}

/// Driver for the power supply.
#[derive(Clone)]
pub struct PowerSupply {
    device: Device,
    mode_policy: RetryPolicy,
}

impl Driver for PowerSupply {
    const KIND: DeviceKind = DeviceKind::PowerSupply;

    fn from_device(device: Device) -> Self {
        Self {
            device,
            mode_policy: RetryPolicy::new(5, Duration::from_millis(200)),
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl PowerSupply {
    /// Program the voltage setpoint. Returns the volts actually programmed,
    /// which is `volts` truncated to the 0.2 V grid.
    pub async fn set_voltage(&self, volts: f64) -> AppResult<f64> {
        let raw = (volts * COUNTS_PER_VOLT) as i64;
        self.device.write("VOLTAGE_SET", raw).await?;
        let programmed = raw as f64 * VOLTS_PER_COUNT;
        info!(volts = programmed, raw, "voltage set");
        Ok(programmed)
    }

    /// Program the current setpoint, truncated to 1 mA.
    pub async fn set_current(&self, amps: f64) -> AppResult<f64> {
        let raw = (amps * COUNTS_PER_AMP) as i64;
        self.device.write("CURRENT_SET", raw).await?;
        let programmed = raw as f64 * AMPS_PER_COUNT;
        info!(amps = programmed, raw, "current set");
        Ok(programmed)
    }

    pub async fn voltage(&self) -> AppResult<f64> {
        self.scaled("VOLTAGE_SET", VOLTS_PER_COUNT).await
    }

    pub async fn current(&self) -> AppResult<f64> {
        self.scaled("CURRENT_SET", AMPS_PER_COUNT).await
    }

    pub async fn actual_voltage(&self) -> AppResult<f64> {
        self.scaled("VOLTAGE_ACTUAL", VOLTS_PER_COUNT).await
    }

    pub async fn actual_current(&self) -> AppResult<f64> {
        self.scaled("CURRENT_ACTUAL", AMPS_PER_COUNT).await
    }

    async fn scaled(&self, name: &str, per_count: f64) -> AppResult<f64> {
        let value = self.device.read(name).await?;
        Ok(integer(name, &value)? as f64 * per_count)
    }

    /// Operating mode, 1 to 3.
    pub async fn mode(&self) -> AppResult<u8> {
        let policy = self.mode_policy.clone();
        self.device
            .execute(move |link| Box::pin(async move { read_mode(link, &policy).await }))
            .await
    }

    /// Read setpoints, actual values, mode and status bits in one job.
    pub async fn status(&self) -> AppResult<SupplyStatus> {
        let policy = self.mode_policy.clone();
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let voltage = optional(scaled(link, "VOLTAGE_SET", VOLTS_PER_COUNT).await)?;
                    let current = optional(scaled(link, "CURRENT_SET", AMPS_PER_COUNT).await)?;
                    let actual_voltage =
                        optional(scaled(link, "VOLTAGE_ACTUAL", VOLTS_PER_COUNT).await)?;
                    let actual_current =
                        optional(scaled(link, "CURRENT_ACTUAL", AMPS_PER_COUNT).await)?;
                    let mode = optional(read_mode(link, &policy).await)?;
                    let word = optional(read_word(link, "STATUS").await)?;
                    let error_code = optional(read_word(link, "ERROR_CODE").await)?;
                    let bit = |mask: u16| word.map(|w| w & mask != 0);
                    Ok(SupplyStatus {
                        voltage,
                        current,
                        actual_voltage,
                        actual_current,
                        mode,
                        dc1_on: bit(0x0001),
                        power_on: bit(0x0002),
                        error: bit(0x0004),
                        ready: bit(0x0008),
                        error_code,
                    })
                })
            })
            .await
    }

    /// Switch the DC1 output.
    pub async fn set_dc_output(&self, on: bool) -> AppResult<()> {
        let command = if on { DC1_ON } else { DC1_OFF };
        self.device.write("COMMAND", command).await?;
        info!(on, "DC1 output switched");
        Ok(())
    }

    /// Select an operating mode and start or stop the supply in it.
    ///
    /// # Arguments
    /// * `mode` - 1 bipolar, 2 unipolar negative, 3 unipolar positive
    /// * `on` - run (true) or stop (false)
    pub async fn set_running(&self, mode: u8, on: bool) -> AppResult<()> {
        if !MODE_NAMES.iter().any(|(m, _)| *m == mode) {
            return Err(ValidationError::OutOfRange {
                register: "MODE".to_string(),
                value: f64::from(mode),
                min: 1.0,
                max: 3.0,
            }
            .into());
        }
        let command = FramedCommand::ModeSwitch {
            mode,
            on_off: if on { 2 } else { 1 },
        };
        self.send(command).await?;
        info!(mode, on, "running state set");
        Ok(())
    }

    pub async fn clear_error(&self) -> AppResult<()> {
        self.device.write("COMMAND", CLEAR_ERROR).await
    }

    /// Write the four pulse clock words.
    pub async fn set_clock(&self, words: [u16; 4]) -> AppResult<()> {
        self.send(FramedCommand::Clock(words)).await
    }

    async fn send(&self, command: FramedCommand) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let (codec, transport) = link.framed()?;
                    codec.send(transport, command).await
                })
            })
            .await
    }
}

async fn read_word(link: &mut Link, name: &str) -> AppResult<u16> {
    let value = link.read(name).await?;
    let raw = integer(name, &value)?;
    u16::try_from(raw).map_err(|_| {
        FramingError::ImplausibleValue {
            register: link.catalog().get(name).map_or("?", |r| r.name),
            value: raw,
        }
        .into()
    })
}

async fn scaled(link: &mut Link, name: &str, per_count: f64) -> AppResult<f64> {
    Ok(f64::from(read_word(link, name).await?) * per_count)
}

/// Register 0 below the offset is a partial read; retry it.
async fn read_mode(link: &mut Link, policy: &RetryPolicy) -> AppResult<u8> {
    with_retry(policy, link, |link| {
        Box::pin(async move {
            let raw = read_word(link, "MODE").await?;
            if raw < MODE_OFFSET {
                return Err(FramingError::ImplausibleValue {
                    register: "MODE",
                    value: i64::from(raw),
                }
                .into());
            }
            Ok(decode_mode(raw))
        })
    })
    .await
}

/// Soft failures become `None`; hard faults end the job.
fn optional<T>(result: AppResult<T>) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(error = %err, "status field unavailable");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::error::{DeviceError, ProtocolError};
    use crate::sim::{PowerSupplyDevice, Simulator};

    async fn psu() -> (PowerSupplyDevice, PowerSupply) {
        let (sim, manager, config) = simulated(DeviceKind::PowerSupply);
        let Simulator::PowerSupply(device) = sim else {
            panic!("power supply model expected");
        };
        let (psu, _) = connect::<PowerSupply>(&manager, config).await.unwrap();
        (device, psu)
    }

    #[test]
    fn mode_nibble_decodes_with_zero_as_bipolar() {
        assert_eq!(decode_mode(0x8000), 1);
        assert_eq!(decode_mode(0x8002), 2);
        assert_eq!(decode_mode(0x800B), 11);
        assert_eq!(decode_mode(0x8013), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn setpoints_are_scaled_to_counts() {
        let (device, psu) = psu().await;
        assert_eq!(psu.set_voltage(400.1).await.unwrap(), 400.0);
        assert_eq!(device.register(13), 2000);
        psu.set_current(1.5).await.unwrap();
        assert_eq!(device.register(14), 1500);
        assert!((psu.current().await.unwrap() - 1.5).abs() < 1e-9);
        assert!((psu.voltage().await.unwrap() - 400.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn excessive_voltage_is_refused_locally() {
        let (device, psu) = psu().await;
        let before = device.accepted_frames().len();
        let err = psu.set_voltage(900.0).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(ValidationError::OutOfRange { .. })));
        assert_eq!(device.accepted_frames().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn status_decodes_mode_and_bits() {
        let (device, psu) = psu().await;
        psu.set_running(3, true).await.unwrap();
        psu.set_dc_output(true).await.unwrap();
        device.set_register(20, 1000);
        device.set_register(21, 250);

        let status = psu.status().await.unwrap();
        assert_eq!(status.mode, Some(3));
        assert_eq!(status.mode_name(), Some("unipolar positive"));
        assert_eq!(status.dc1_on, Some(true));
        assert_eq!(status.error_code, Some(0));
        assert_eq!(status.actual_voltage, Some(200.0));
        assert_eq!(status.actual_current, Some(0.25));

        psu.set_dc_output(false).await.unwrap();
        assert_eq!(psu.status().await.unwrap().dc1_on, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_mode_words_are_retried_then_reported() {
        let (device, psu) = psu().await;
        device.set_register(0, 30_500);
        let err = psu.mode().await.unwrap_err();
        assert_eq!(
            err,
            FramingError::ImplausibleValue {
                register: "MODE",
                value: 30_500
            }
            .into()
        );
        device.set_register(0, 0x8000);
        assert_eq!(psu.mode().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_error_resets_the_error_code() {
        let (device, psu) = psu().await;
        device.set_register(0, 0x8002 | 0x0004);
        device.set_register(2, 17);
        assert_eq!(psu.status().await.unwrap().error, Some(true));
        psu.clear_error().await.unwrap();
        let status = psu.status().await.unwrap();
        assert_eq!(status.error, Some(false));
        assert_eq!(status.error_code, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn nak_is_not_retried() {
        let (device, psu) = psu().await;
        let before = device.accepted_frames().len();
        device.nak_next(1);
        let err = psu.set_clock([1, 2, 3, 4]).await.unwrap_err();
        assert_eq!(err, ProtocolError::DeviceNak.into());
        assert_eq!(device.accepted_frames().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_modes_are_rejected() {
        let (_device, psu) = psu().await;
        assert!(matches!(
            psu.set_running(7, true).await,
            Err(DeviceError::Validation(_))
        ));
    }
}
