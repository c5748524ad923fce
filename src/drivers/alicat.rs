//! Alicat mass-flow controller.
//!
//! The controller speaks unit-addressed ASCII lines at 19200 8N1; see
//! [`crate::codec::ascii`]. A flow or pressure setpoint first selects the
//! matching control loop and is confirmed from a fresh poll. Gases are
//! chosen by standard name or by number, which also reaches user mixes.

use super::{Device, Driver};
use crate::catalog::Value;
use crate::codec::ascii::{standard_gas, MixComponent, STANDARD_GASES};
use crate::codec::AlicatStatus;
use crate::config::DeviceKind;
use crate::error::{AppResult, ValidationError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Driver for an Alicat flow controller.
#[derive(Clone)]
pub struct Alicat {
    device: Device,
}

impl Driver for Alicat {
    const KIND: DeviceKind = DeviceKind::Alicat;

    fn from_device(device: Device) -> Self {
        Self { device }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Gases the controller can be switched to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasInventory {
    pub current_gas: String,
    /// Gas number to name.
    pub standard_gases: BTreeMap<u8, &'static str>,
    /// Mix number to name.
    pub custom_mixtures: BTreeMap<u8, String>,
}

impl GasInventory {
    /// Keep the entries whose name, or mix number, contains `search`
    /// regardless of case.
    fn new(current_gas: String, mixes: BTreeMap<u8, String>, search: Option<&str>) -> Self {
        let needle = search.map(str::to_ascii_lowercase);
        let matches = |text: &str| {
            needle
                .as_deref()
                .map_or(true, |needle| text.to_ascii_lowercase().contains(needle))
        };
        let standard_gases = STANDARD_GASES
            .iter()
            .enumerate()
            .filter(|(_, name)| matches(name))
            .filter_map(|(number, name)| u8::try_from(number).ok().map(|n| (n, *name)))
            .collect();
        let custom_mixtures = mixes
            .into_iter()
            .filter(|(number, name)| matches(name) || matches(&number.to_string()))
            .collect();
        Self {
            current_gas,
            standard_gases,
            custom_mixtures,
        }
    }
}

impl Alicat {
    pub async fn status(&self) -> AppResult<AlicatStatus> {
        self.device
            .execute(|link| {
                Box::pin(async move {
                    let (codec, transport) = link.ascii()?;
                    codec.status(transport).await
                })
            })
            .await
    }

    /// Mass-flow control at `flow`, in the controller's standard flow unit.
    pub async fn set_flow_rate(&self, flow: f64) -> AppResult<AlicatStatus> {
        self.apply("FLOW_SETPOINT", Value::from(flow)).await
    }

    /// Pressure control at `psia`.
    pub async fn set_pressure(&self, psia: f64) -> AppResult<AlicatStatus> {
        self.apply("PRESSURE_SETPOINT", Value::from(psia)).await
    }

    /// Select a gas by standard name (`"Ar"`, `"co2"`) or by number.
    pub async fn set_gas(&self, gas: &str) -> AppResult<AlicatStatus> {
        let number = resolve_gas(gas)?;
        self.apply("GAS", Value::from(u16::from(number))).await
    }

    /// Define mix `number` (236-255) from standard gases and percentages.
    pub async fn create_mix(&self, number: u8, name: &str, gases: &[(&str, f64)]) -> AppResult<()> {
        let components = gases
            .iter()
            .map(|(gas, percent)| {
                Ok(MixComponent {
                    gas: resolve_gas(gas)?,
                    percent: *percent,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        let name = name.to_string();
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let (codec, transport) = link.ascii()?;
                    codec.create_mix(transport, number, &name, &components).await
                })
            })
            .await
    }

    pub async fn delete_mix(&self, number: u8) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    let (codec, transport) = link.ascii()?;
                    codec.delete_mix(transport, number).await
                })
            })
            .await
    }

    /// Mix number to name for every mix defined on the controller. Takes
    /// one exchange per mix number; the gas in use is selected again after.
    pub async fn gas_mixes(&self) -> AppResult<BTreeMap<u8, String>> {
        self.device
            .execute(|link| {
                Box::pin(async move {
                    let (codec, transport) = link.ascii()?;
                    codec.gas_mixes(transport).await
                })
            })
            .await
    }

    /// The current gas with the standard table and the defined mixes,
    /// optionally narrowed to names containing `search`.
    pub async fn all_gases(&self, search: Option<&str>) -> AppResult<GasInventory> {
        let (current, mixes) = self
            .device
            .execute(|link| {
                Box::pin(async move {
                    let (codec, transport) = link.ascii()?;
                    let current = codec.status(transport).await?.gas;
                    let mixes = codec.gas_mixes(transport).await?;
                    Ok((current, mixes))
                })
            })
            .await?;
        Ok(GasInventory::new(current, mixes, search))
    }

    async fn apply(&self, name: &'static str, value: Value) -> AppResult<AlicatStatus> {
        let status = self
            .device
            .execute(move |link| {
                Box::pin(async move {
                    link.write(name, &value).await?;
                    let (codec, transport) = link.ascii()?;
                    codec.status(transport).await
                })
            })
            .await?;
        info!(setting = name, %status, "alicat updated");
        Ok(status)
    }
}

fn resolve_gas(gas: &str) -> AppResult<u8> {
    let gas = gas.trim();
    standard_gas(gas).or_else(|| gas.parse().ok()).ok_or_else(|| {
        ValidationError::TypeMismatch {
            register: "GAS".to_string(),
            reason: format!("unknown gas '{gas}'"),
        }
        .into()
    })
}
