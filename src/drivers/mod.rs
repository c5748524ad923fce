//! Typed instrument drivers.
//!
//! A driver is a thin, cloneable view of one session: it holds the
//! [`SessionManager`] and the [`SessionId`] and turns instrument operations
//! ("set the flow to 1200", "switch DC1 on") into register traffic. Drivers
//! never own a transport. Single register accesses go through the session
//! queue like any other caller's; operations made of several exchanges run
//! as one [`SessionManager::execute`] job so that nothing else reaches the
//! wire between their steps.
//!
//! # Example
//!
//! ```no_run
//! use labbridge::config::DeviceKind;
//! use labbridge::drivers::{self, MassFlowController};
//! use labbridge::session::SessionManager;
//!
//! # async fn demo() -> labbridge::error::AppResult<()> {
//! let manager = SessionManager::default();
//! let config = DeviceKind::MassFlowController.config_for("/dev/ttyUSB0");
//! let (mfc, snapshot) = drivers::connect::<MassFlowController>(&manager, config).await?;
//! println!("connected, {} registers read", snapshot.len());
//!
//! mfc.set_flow_rate(1200).await?;
//! println!("flow: {}", mfc.flow().await?);
//! # Ok(())
//! # }
//! ```

pub mod alicat;
pub mod heater;
pub mod laser;
pub mod mfc;
pub mod power_supply;
pub mod robot_arm;
pub mod ultrasonic;

pub use alicat::{Alicat, GasInventory};
pub use heater::Heater;
pub use laser::Laser;
pub use mfc::MassFlowController;
pub use power_supply::{PowerSupply, SupplyStatus};
pub use robot_arm::{RobotArm, RobotStatus};
pub use ultrasonic::{Running, Ultrasonic};

use crate::catalog::{Register, Value};
use crate::config::{DeviceConfig, DeviceKind};
use crate::error::{AppResult, ProtocolError, ValidationError};
use crate::session::{BatchResult, Link, SessionId, SessionManager, Snapshot, State};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::info;

/// A connected session, independent of the instrument behind it.
#[derive(Clone)]
pub struct Device {
    manager: SessionManager,
    id: SessionId,
    kind: DeviceKind,
}

impl Device {
    /// Wrap an existing session.
    pub fn attach(manager: &SessionManager, id: SessionId) -> AppResult<Self> {
        let kind = manager.handle(id)?.kind();
        Ok(Self {
            manager: manager.clone(),
            id,
            kind,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn state(&self) -> AppResult<State> {
        self.manager.state(self.id)
    }

    pub async fn read(&self, name: &str) -> AppResult<Value> {
        self.manager.read_register(self.id, name).await
    }

    pub async fn write(&self, name: &str, value: impl Into<Value>) -> AppResult<()> {
        self.manager.write_register(self.id, name, value.into()).await
    }

    /// Every readable register, each with its own outcome.
    pub async fn read_all(&self) -> AppResult<BatchResult> {
        let names: Vec<&str> = self.kind.catalog().readable().map(|r| r.name).collect();
        self.manager.batch_read(self.id, &names).await
    }

    /// Every readable register with its human label, skipping failures.
    pub async fn readings(&self) -> AppResult<Vec<Reading>> {
        let catalog = self.kind.catalog();
        let mut readings = Vec::new();
        for (name, result) in self.read_all().await? {
            let Ok(value) = result else { continue };
            let register = catalog.get(&name)?;
            readings.push(Reading::new(register, value));
        }
        Ok(readings)
    }

    pub async fn execute<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        self.manager.execute(self.id, f).await
    }

    pub async fn disconnect(&self) -> AppResult<()> {
        self.manager.disconnect(self.id).await
    }
}

/// A register value decorated for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub register: &'static str,
    pub value: Value,
    /// Enumeration label, when the register has one for this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'static str>,
}

impl Reading {
    pub fn new(register: &'static Register, value: Value) -> Self {
        let label = value.as_i64().and_then(|raw| register.label_for(raw));
        Self {
            register: register.name,
            value,
            label,
        }
    }
}

/// An instrument-specific view of a session.
pub trait Driver: Sized {
    const KIND: DeviceKind;

    fn from_device(device: Device) -> Self;

    fn device(&self) -> &Device;

    /// Wrap an existing session, checking it talks to the right instrument.
    fn attach(manager: &SessionManager, id: SessionId) -> AppResult<Self> {
        let device = Device::attach(manager, id)?;
        if device.kind() != Self::KIND {
            return Err(ProtocolError::WrongProtocol {
                expected: Self::KIND.name(),
                actual: device.kind().name(),
            }
            .into());
        }
        Ok(Self::from_device(device))
    }
}

/// Connect a session for `D` and wrap it.
pub async fn connect<D: Driver>(
    manager: &SessionManager,
    config: DeviceConfig,
) -> AppResult<(D, Snapshot)> {
    let connected = manager.connect(D::KIND, config).await?;
    info!(session = %connected.id, kind = %D::KIND, "driver attached");
    let driver = D::attach(manager, connected.id)?;
    Ok((driver, connected.snapshot))
}

/// Integral register value, or a type error naming the register.
pub(crate) fn integer(register: &str, value: &Value) -> AppResult<i64> {
    value.as_i64().ok_or_else(|| {
        ValidationError::TypeMismatch {
            register: register.to_string(),
            reason: format!("expected an integer, device returned {value}"),
        }
        .into()
    })
}

pub(crate) fn flag(register: &str, value: &Value) -> AppResult<bool> {
    integer(register, value).map(|raw| raw != 0)
}
