//! UC-2000 CO2 laser controller.
//!
//! The controller speaks single-byte opcodes at 9600 8N1 and reports its
//! whole state in one five-byte status block; see [`crate::codec::opcode`].
//! Frequency and gate changes need remote control mode and are only accepted
//! with the beam off, so the codec switches the beam off around them and
//! back on afterwards.

use super::{Device, Driver};
use crate::catalog::Value;
use crate::codec::LaserStatus;
use crate::config::DeviceKind;
use crate::error::AppResult;
use tracing::info;

/// Driver for the laser controller.
#[derive(Clone)]
pub struct Laser {
    device: Device,
}

impl Driver for Laser {
    const KIND: DeviceKind = DeviceKind::Laser;

    fn from_device(device: Device) -> Self {
        Self { device }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Laser {
    pub async fn status(&self) -> AppResult<LaserStatus> {
        self.device
            .execute(|link| {
                Box::pin(async move {
                    let (codec, transport) = link.opcode()?;
                    codec.status(transport).await
                })
            })
            .await
    }

    /// Select an operating mode, 0 to 5. Mode 5 is remote control.
    pub async fn set_mode(&self, mode: u8) -> AppResult<LaserStatus> {
        self.apply("MODE", Value::from(u16::from(mode))).await
    }

    pub async fn set_laser_enabled(&self, on: bool) -> AppResult<LaserStatus> {
        self.apply("LASER_ON", Value::from(on)).await
    }

    /// PWM frequency in kHz: 5, 10 or 20.
    pub async fn set_frequency(&self, khz: u8) -> AppResult<LaserStatus> {
        self.apply("PWM_FREQUENCY", Value::from(u16::from(khz))).await
    }

    pub async fn set_gate_pull_up(&self, on: bool) -> AppResult<LaserStatus> {
        self.apply("GATE_PULL_UP", Value::from(on)).await
    }

    /// Duty cycle in percent, 0 to 99, applied in half-percent steps.
    pub async fn set_pwm_percentage(&self, percent: f64) -> AppResult<LaserStatus> {
        self.apply("PWM_PERCENTAGE", Value::from(percent)).await
    }

    pub async fn set_lase_on_powerup(&self, on: bool) -> AppResult<LaserStatus> {
        self.apply("LASE_ON_POWERUP", Value::from(on)).await
    }

    pub async fn set_max_pwm_95(&self, on: bool) -> AppResult<LaserStatus> {
        self.apply("MAX_PWM_95", Value::from(on)).await
    }

    /// Write one status slot and return the state that resulted.
    async fn apply(&self, name: &'static str, value: Value) -> AppResult<LaserStatus> {
        let status = self
            .device
            .execute(move |link| {
                Box::pin(async move {
                    link.write(name, &value).await?;
                    let (codec, transport) = link.opcode()?;
                    codec.status(transport).await
                })
            })
            .await?;
        info!(setting = name, %status, "laser updated");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::error::{DeviceError, ProtocolError, ValidationError};
    use crate::sim::{LaserController, Simulator};

    async fn laser() -> (LaserController, Laser) {
        let (sim, manager, config) = simulated(DeviceKind::Laser);
        let Simulator::Laser(controller) = sim else {
            panic!("laser model expected");
        };
        let (laser, _) = connect::<Laser>(&manager, config).await.unwrap();
        (controller, laser)
    }

    #[tokio::test(start_paused = true)]
    async fn frequency_change_needs_remote_control() {
        let (controller, laser) = laser().await;
        let err = laser.set_frequency(10).await.unwrap_err();
        assert_eq!(err, ProtocolError::RemoteRequired("PWM frequency change").into());
        assert_eq!(controller.state().pwm_frequency, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn frequency_change_switches_the_beam_off_and_back_on() {
        let (controller, laser) = laser().await;
        laser.set_mode(5).await.unwrap();
        assert!(controller.state().laser_on);

        let before = controller.commands().len();
        let status = laser.set_frequency(20).await.unwrap();
        assert_eq!(status.pwm_frequency, 20);
        assert!(status.laser_on);
        assert_eq!(&controller.commands()[before..], &[0x76, 0x79, 0x75]);
    }

    #[tokio::test(start_paused = true)]
    async fn pwm_is_set_in_half_percent_steps() {
        let (controller, laser) = laser().await;
        let status = laser.set_pwm_percentage(37.5).await.unwrap();
        assert_eq!(status.pwm_raw, 75);
        assert_eq!(controller.state().pwm_raw, 75);

        let err = laser.set_pwm_percentage(120.0).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(ValidationError::OutOfRange { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_returns_the_controller_to_local_mode() {
        let (controller, laser) = laser().await;
        assert!(controller.state().remote_control);

        laser.device().disconnect().await.unwrap();
        assert_eq!(controller.commands().last(), Some(&0x70));
        assert!(!controller.state().remote_control);
        assert_eq!(controller.state().mode, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_pwm_cap_needs_remote_but_keeps_the_beam() {
        let (controller, laser) = laser().await;
        laser.set_mode(5).await.unwrap();
        let before = controller.commands().len();
        let status = laser.set_max_pwm_95(true).await.unwrap();
        assert!(status.max_pwm_95);
        assert_eq!(&controller.commands()[before..], &[0x7C]);
    }
}
