//! Azbil MQV mass-flow controller.
//!
//! Protocol overview:
//! - Modbus RTU, 38400 baud, 8E1, slave id 1 by default
//! - Flow values are integral in the unit selected by `FLOW_UNIT`
//! - The controller needs about 2 s after the port opens before it answers,
//!   and as long again after a gas-type change before it reports the new gas
//! - The totaliser is a 32-bit register pair, reset by writing zero to both
//!   words with function 0x10

use super::{integer, Device, Driver};
use crate::catalog::Value;
use crate::config::DeviceKind;
use crate::error::{AppResult, DeviceError};
use crate::retry::{with_verify, RetryPolicy};
use crate::session::{BatchResult, Link};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

const GAS_SETTLE: Duration = Duration::from_secs(2);

/// Selected gas with its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gas {
    pub code: u16,
    pub label: Option<&'static str>,
}

/// Driver for the mass-flow controller.
#[derive(Clone)]
pub struct MassFlowController {
    device: Device,
    gas_settle: Duration,
}

impl Driver for MassFlowController {
    const KIND: DeviceKind = DeviceKind::MassFlowController;

    fn from_device(device: Device) -> Self {
        Self {
            device,
            gas_settle: GAS_SETTLE,
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl MassFlowController {
    /// Override the wait between a gas-type write and its read-back.
    pub fn with_gas_settle(mut self, settle: Duration) -> Self {
        self.gas_settle = settle;
        self
    }

    /// Set the flow rate and confirm the controller took it.
    ///
    /// # Errors
    /// `Validation` when `flow` is outside 0..=50000, before anything is
    /// sent; `VerificationFailed` when the read-back never matches.
    pub async fn set_flow_rate(&self, flow: u16) -> AppResult<u16> {
        let verified = self
            .device
            .execute(move |link| {
                Box::pin(async move {
                    link.write_verified("FLOW_RATE", Value::from(flow), &RetryPolicy::modbus())
                        .await
                })
            })
            .await?;
        info!(flow, attempts = verified.attempts, "flow rate set");
        Ok(flow)
    }

    /// Select a gas. The controller applies it only after a settle time, so
    /// each read-back waits that long first.
    pub async fn set_gas(&self, code: u16) -> AppResult<Gas> {
        let settle = self.gas_settle;
        let value = Value::from(code);
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let register = link.catalog().validate_write("GAS_TYPE", &value)?;
                    with_verify(
                        &RetryPolicy::modbus(),
                        link,
                        code,
                        |link| {
                            let value = value.clone();
                            Box::pin(async move { link.write_register(register, &value).await })
                        },
                        |link| {
                            Box::pin(async move {
                                tokio::time::sleep(settle).await;
                                link.read_register(register).await
                            })
                        },
                        |observed| observed.as_i64() == Some(i64::from(code)),
                    )
                    .await
                })
            })
            .await?;
        let gas = gas(code);
        info!(code, label = gas.label, "gas selected");
        Ok(gas)
    }

    /// Measured flow.
    pub async fn flow(&self) -> AppResult<i64> {
        let value = self.device.read("PV_FLOW").await?;
        integer("PV_FLOW", &value)
    }

    /// Setpoint the controller is regulating to.
    pub async fn setpoint(&self) -> AppResult<i64> {
        let value = self.device.read("SETTING_SP_FLOW").await?;
        integer("SETTING_SP_FLOW", &value)
    }

    /// Selected gas with its label. Codes outside the table come back
    /// unlabelled rather than failing.
    pub async fn gas(&self) -> AppResult<Gas> {
        let value = self.device.read("GAS_TYPE").await?;
        let code = integer("GAS_TYPE", &value)?;
        Ok(gas(u16::try_from(code).unwrap_or(u16::MAX)))
    }

    /// Zero the flow totaliser.
    pub async fn reset_totalizer(&self) -> AppResult<()> {
        self.device.write("TOTAL_FLOW_RESET", 0u16).await?;
        info!("totaliser reset");
        Ok(())
    }

    /// Write several registers in one go, reading each back.
    ///
    /// Every register gets its own outcome: a rejected or unconfirmed value
    /// does not stop the others. A hard transport fault does, and is
    /// returned instead of the map.
    pub async fn update_settings(&self, settings: BTreeMap<String, Value>) -> AppResult<BatchResult> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let mut outcomes = BatchResult::new();
                    for (name, value) in settings {
                        let outcome = update_one(link, &name, value).await;
                        match &outcome {
                            Err(err) if err.is_fatal() => return Err(err.clone()),
                            Err(err) => warn!(register = %name, error = %err, "setting not applied"),
                            Ok(_) => {}
                        }
                        outcomes.insert(name, outcome);
                    }
                    Ok(outcomes)
                })
            })
            .await
    }
}

async fn update_one(link: &mut Link, name: &str, value: Value) -> AppResult<Value> {
    link.write(name, &value).await?;
    if !link.catalog().get(name)?.access.readable() {
        return Ok(value);
    }
    let observed = link.read(name).await?;
    if observed.as_f64() != value.as_f64() {
        return Err(DeviceError::verification(&value, &observed));
    }
    Ok(observed)
}

fn gas(code: u16) -> Gas {
    let label = DeviceKind::MassFlowController
        .catalog()
        .get("GAS_TYPE")
        .ok()
        .and_then(|r| r.label_for(i64::from(code)));
    Gas { code, label }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::error::ValidationError;
    use crate::sim::Simulator;

    async fn mfc() -> (crate::sim::ModbusDevice, MassFlowController) {
        let (sim, manager, config) = simulated(DeviceKind::MassFlowController);
        let Simulator::Modbus(device) = sim else {
            panic!("mass-flow controller is a Modbus model");
        };
        let (mfc, _) = connect::<MassFlowController>(&manager, config).await.unwrap();
        (device, mfc.with_gas_settle(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn flow_rate_is_written_and_confirmed() {
        let (device, mfc) = mfc().await;
        assert_eq!(mfc.set_flow_rate(1200).await.unwrap(), 1200);
        assert_eq!(device.register(0x04B9), Some(1200));
        assert_eq!(mfc.flow().await.unwrap(), 1200);
        assert_eq!(mfc.setpoint().await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn out_of_range_flow_never_reaches_the_controller() {
        let (device, mfc) = mfc().await;
        let before = device.request_count();
        let err = mfc.set_flow_rate(60_000).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(ValidationError::OutOfRange { .. })));
        assert_eq!(device.request_count(), before);
    }

    #[tokio::test]
    async fn gas_change_reports_its_label() {
        let (_device, mfc) = mfc().await;
        let gas = mfc.set_gas(3).await.unwrap();
        assert_eq!(gas, Gas { code: 3, label: Some("Ar") });
        assert_eq!(mfc.gas().await.unwrap().label, Some("Ar"));
    }

    #[tokio::test]
    async fn totaliser_reset_writes_both_words() {
        let (device, mfc) = mfc().await;
        device.set_register(0x04BC, 7);
        device.set_register(0x04BD, 9);
        mfc.reset_totalizer().await.unwrap();
        assert_eq!(device.register(0x04BC), Some(0));
        assert_eq!(device.register(0x04BD), Some(0));
    }

    #[tokio::test]
    async fn settings_update_reports_each_register() {
        let (device, mfc) = mfc().await;
        device.script_reads(0x07E0, [1]);
        let settings = BTreeMap::from([
            ("GAS_TYPE".to_string(), Value::Integer(2)),
            ("GATE_ERROR_FIX".to_string(), Value::Integer(3)),
            ("PV_FLOW".to_string(), Value::Integer(5)),
        ]);
        let outcomes = mfc.update_settings(settings).await.unwrap();
        assert_eq!(outcomes["GAS_TYPE"], Ok(Value::Integer(2)));
        assert_eq!(
            outcomes["GATE_ERROR_FIX"],
            Err(DeviceError::VerificationFailed {
                expected: "3".into(),
                observed: "1".into()
            })
        );
        assert_eq!(
            outcomes["PV_FLOW"],
            Err(ValidationError::ReadOnly("PV_FLOW".into()).into())
        );
    }
}
