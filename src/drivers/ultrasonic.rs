//! Ultrasonic atomizer driver board.
//!
//! Modbus RTU at 38400 8N1. Register 1 takes the run command, register 3
//! reports the oscillator and register 41 the digital inputs. The status
//! register does not answer on every board revision, so the driver also
//! remembers the last command it sent.

use super::{flag, integer, Device, Driver};
use crate::config::DeviceKind;
use crate::error::AppResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a running state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Running {
    /// Read from the status register.
    Reported(bool),
    /// The status read failed; this is the last command sent.
    Commanded(bool),
}

impl Running {
    pub fn is_running(self) -> bool {
        match self {
            Running::Reported(on) | Running::Commanded(on) => on,
        }
    }
}

/// Driver for the ultrasonic board.
#[derive(Clone)]
pub struct Ultrasonic {
    device: Device,
    last_command: Arc<Mutex<Option<bool>>>,
}

impl Driver for Ultrasonic {
    const KIND: DeviceKind = DeviceKind::Ultrasonic;

    fn from_device(device: Device) -> Self {
        Self {
            device,
            last_command: Arc::new(Mutex::new(None)),
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Ultrasonic {
    pub async fn turn_on(&self) -> AppResult<()> {
        self.command(true).await
    }

    pub async fn turn_off(&self) -> AppResult<()> {
        self.command(false).await
    }

    async fn command(&self, run: bool) -> AppResult<()> {
        self.device.write("COMMAND", run).await?;
        *self.last_command.lock() = Some(run);
        info!(run, "ultrasonic command sent");
        Ok(())
    }

    /// Running state, from the status register when it answers.
    ///
    /// # Errors
    /// Returns the status read error when it failed and no command has been
    /// sent through this driver yet, or when the failure is a hard fault.
    pub async fn is_running(&self) -> AppResult<Running> {
        match self.device.read("STATUS").await {
            Ok(value) => Ok(Running::Reported(flag("STATUS", &value)?)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => match *self.last_command.lock() {
                Some(run) => {
                    debug!(error = %err, "status unreadable, using last command");
                    Ok(Running::Commanded(run))
                }
                None => Err(err),
            },
        }
    }

    pub async fn digital_inputs(&self) -> AppResult<i64> {
        let value = self.device.read("DI").await?;
        integer("DI", &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::error::{DeviceError, ProtocolError};
    use crate::sim::Simulator;

    #[tokio::test]
    async fn running_state_follows_the_status_register() {
        let (_sim, manager, config) = simulated(DeviceKind::Ultrasonic);
        let (board, _) = connect::<Ultrasonic>(&manager, config).await.unwrap();
        board.turn_on().await.unwrap();
        assert_eq!(board.is_running().await.unwrap(), Running::Reported(true));
        board.turn_off().await.unwrap();
        assert!(!board.is_running().await.unwrap().is_running());
    }

    #[tokio::test]
    async fn falls_back_to_the_last_command() {
        let (sim, manager, config) = simulated(DeviceKind::Ultrasonic);
        let Simulator::Modbus(device) = sim else {
            panic!("ultrasonic board is a Modbus model");
        };
        let (board, _) = connect::<Ultrasonic>(&manager, config).await.unwrap();
        device.fail_with(0x0003, 4);

        let err = board.is_running().await.unwrap_err();
        assert_eq!(err, DeviceError::Protocol(ProtocolError::ModbusException { code: 4 }));

        board.turn_on().await.unwrap();
        assert_eq!(board.is_running().await.unwrap(), Running::Commanded(true));
    }
}
