//! Robot-arm PLC over Modbus TCP (unit 5, port 502).
//!
//! Each adjustment is a pair of registers: an enable flag and a value. The
//! PLC applies a value only while its flag is set and reports what it
//! applied in a separate read-only register.

use super::{flag, integer, Device, Driver};
use crate::catalog::Value;
use crate::config::DeviceKind;
use crate::error::AppResult;
use crate::session::Link;
use serde::Serialize;
use tracing::{info, warn};

/// Decoded PLC registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotStatus {
    pub started: bool,
    pub adjustment_rate_enabled: bool,
    pub adjustment_rate: i64,
    pub height_adjustment_enabled: bool,
    pub height_offset: i64,
    pub actual_offset: i64,
    pub count_adjustment_enabled: bool,
    pub count_adjustment: i64,
    pub actual_count: i64,
}

/// Driver for the robot-arm PLC.
#[derive(Clone)]
pub struct RobotArm {
    device: Device,
}

impl Driver for RobotArm {
    const KIND: DeviceKind = DeviceKind::RobotArm;

    fn from_device(device: Device) -> Self {
        Self { device }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl RobotArm {
    /// Start or stop the arm.
    pub async fn start(&self, start: bool) -> AppResult<()> {
        self.device.write("ROBOT_START", start).await?;
        info!(start, "robot start flag written");
        Ok(())
    }

    /// Apply a speed override in percent.
    ///
    /// The PLC latches the rate on the enable edge, so the flag is raised,
    /// the value written and the flag dropped again. The flag is dropped
    /// even when the value write fails.
    pub async fn set_adjustment_rate(&self, percent: u16) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    link.write("ADJUSTMENT_RATE_ENABLED", &Value::from(true)).await?;
                    let written = link
                        .write("ADJUSTMENT_RATE_VALUE", &Value::from(percent))
                        .await;
                    let disabled = link
                        .write("ADJUSTMENT_RATE_ENABLED", &Value::from(false))
                        .await;
                    if let Err(err) = &disabled {
                        warn!(error = %err, "adjustment rate left enabled");
                    }
                    written.and(disabled)
                })
            })
            .await?;
        info!(percent, "adjustment rate applied");
        Ok(())
    }

    /// Enable or disable the height offset, writing `offset` when enabling.
    pub async fn set_height_offset(&self, enabled: bool, offset: Option<u16>) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    adjust(link, "HEIGHT_ADJUSTMENT_ENABLED", "HEIGHT_OFFSET_VALUE", enabled, offset)
                        .await
                })
            })
            .await
    }

    /// Enable or disable the pass-count adjustment, writing `count` when enabling.
    pub async fn set_count_adjustment(&self, enabled: bool, count: Option<u16>) -> AppResult<()> {
        self.device
            .execute(move |link| {
                Box::pin(async move {
                    adjust(
                        link,
                        "COUNT_ADJUSTMENT_ENABLED",
                        "COUNT_ADJUSTMENT_VALUE",
                        enabled,
                        count,
                    )
                    .await
                })
            })
            .await
    }

    pub async fn status(&self) -> AppResult<RobotStatus> {
        self.device
            .execute(|link| {
                Box::pin(async move {
                    Ok(RobotStatus {
                        started: read_flag(link, "ROBOT_START").await?,
                        adjustment_rate_enabled: read_flag(link, "ADJUSTMENT_RATE_ENABLED").await?,
                        adjustment_rate: read_int(link, "ADJUSTMENT_RATE_VALUE").await?,
                        height_adjustment_enabled: read_flag(link, "HEIGHT_ADJUSTMENT_ENABLED")
                            .await?,
                        height_offset: read_int(link, "HEIGHT_OFFSET_VALUE").await?,
                        actual_offset: read_int(link, "ACTUAL_OFFSET_VALUE").await?,
                        count_adjustment_enabled: read_flag(link, "COUNT_ADJUSTMENT_ENABLED")
                            .await?,
                        count_adjustment: read_int(link, "COUNT_ADJUSTMENT_VALUE").await?,
                        actual_count: read_int(link, "ACTUAL_COUNT_VALUE").await?,
                    })
                })
            })
            .await
    }
}

async fn adjust(
    link: &mut Link,
    enable: &str,
    target: &str,
    enabled: bool,
    value: Option<u16>,
) -> AppResult<()> {
    link.write(enable, &Value::from(enabled)).await?;
    if let (true, Some(value)) = (enabled, value) {
        link.write(target, &Value::from(value)).await?;
    }
    info!(register = target, enabled, ?value, "adjustment written");
    Ok(())
}

async fn read_flag(link: &mut Link, name: &str) -> AppResult<bool> {
    let value = link.read(name).await?;
    flag(name, &value)
}

async fn read_int(link: &mut Link, name: &str) -> AppResult<i64> {
    let value = link.read(name).await?;
    integer(name, &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{connect, testing::simulated};
    use crate::error::{DeviceError, ProtocolError};
    use crate::sim::{ModbusDevice, Simulator};

    async fn arm() -> (ModbusDevice, RobotArm) {
        let (sim, manager, config) = simulated(DeviceKind::RobotArm);
        let Simulator::Modbus(device) = sim else {
            panic!("robot arm is a Modbus model");
        };
        let (arm, _) = connect::<RobotArm>(&manager, config).await.unwrap();
        (device, arm)
    }

    #[tokio::test]
    async fn adjustment_rate_leaves_the_flag_down() {
        let (device, arm) = arm().await;
        arm.set_adjustment_rate(80).await.unwrap();
        assert_eq!(device.register(0x9C45), Some(80));
        assert_eq!(device.register(0x9C43), Some(0));
    }

    #[tokio::test]
    async fn adjustment_flag_is_dropped_after_a_failed_write() {
        let (device, arm) = arm().await;
        device.fail_with(0x9C45, 4);
        let err = arm.set_adjustment_rate(80).await.unwrap_err();
        assert_eq!(err, DeviceError::Protocol(ProtocolError::ModbusException { code: 4 }));
        assert_eq!(device.register(0x9C43), Some(0));
    }

    #[tokio::test]
    async fn offsets_show_up_in_status() {
        let (_device, arm) = arm().await;
        arm.start(true).await.unwrap();
        arm.set_height_offset(true, Some(12)).await.unwrap();
        arm.set_count_adjustment(true, Some(3)).await.unwrap();

        let status = arm.status().await.unwrap();
        assert!(status.started);
        assert!(status.height_adjustment_enabled);
        assert_eq!(status.actual_offset, 12);
        assert_eq!(status.actual_count, 3);
        assert!(!status.adjustment_rate_enabled);

        arm.set_height_offset(false, Some(99)).await.unwrap();
        let status = arm.status().await.unwrap();
        assert!(!status.height_adjustment_enabled);
        assert_eq!(status.height_offset, 12);
    }
}
