//! Single-loop temperature controller.
//!
//! Modbus RTU at 9600 8N1. Temperatures are whole degrees; the PID terms
//! share one 0..=9999 range.

use super::{flag, integer, Device, Driver};
use crate::catalog::Value;
use crate::config::DeviceKind;
use crate::error::AppResult;
use crate::retry::RetryPolicy;
use tracing::info;

/// Driver for the heater controller.
#[derive(Clone)]
pub struct Heater {
    device: Device,
}

impl Driver for Heater {
    const KIND: DeviceKind = DeviceKind::Heater;

    fn from_device(device: Device) -> Self {
        Self { device }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Heater {
    /// Write the setpoint and read it back until the controller agrees.
    pub async fn set_target_temperature(&self, celsius: u16) -> AppResult<u16> {
        let verified = self
            .device
            .execute(move |link| {
                Box::pin(async move {
                    link.write_verified("SV", Value::from(celsius), &RetryPolicy::modbus())
                        .await
                })
            })
            .await?;
        info!(celsius, attempts = verified.attempts, "target temperature set");
        Ok(celsius)
    }

    /// Measured temperature.
    pub async fn temperature(&self) -> AppResult<i64> {
        let value = self.device.read("PV").await?;
        integer("PV", &value)
    }

    pub async fn target_temperature(&self) -> AppResult<i64> {
        let value = self.device.read("SV").await?;
        integer("SV", &value)
    }

    /// Write all three PID terms back to back.
    pub async fn set_pid(&self, p: u16, i: u16, d: u16) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    link.write("P", &Value::from(p)).await?;
                    link.write("I", &Value::from(i)).await?;
                    link.write("D", &Value::from(d)).await
                })
            })
            .await?;
        info!(p, i, d, "PID terms set");
        Ok(())
    }

    /// Switch between automatic and manual output.
    pub async fn set_manual(&self, manual: bool) -> AppResult<()> {
        self.device.write("M", manual).await
    }

    pub async fn is_manual(&self) -> AppResult<bool> {
        let value = self.device.read("M").await?;
        flag("M", &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::sim::Simulator;

    #[tokio::test]
    async fn setpoint_and_pid_land_in_their_registers() {
        let (sim, manager, config) = simulated(DeviceKind::Heater);
        let Simulator::Modbus(device) = sim else {
            panic!("heater is a Modbus model");
        };
        let (heater, _) = connect::<Heater>(&manager, config).await.unwrap();

        assert_eq!(heater.temperature().await.unwrap(), 25);
        heater.set_target_temperature(350).await.unwrap();
        assert_eq!(heater.target_temperature().await.unwrap(), 350);

        heater.set_pid(30, 240, 60).await.unwrap();
        assert_eq!(device.register(0x0031), Some(30));
        assert_eq!(device.register(0x0032), Some(240));
        assert_eq!(device.register(0x0033), Some(60));

        heater.set_manual(true).await.unwrap();
        assert!(heater.is_manual().await.unwrap());
    }
}
