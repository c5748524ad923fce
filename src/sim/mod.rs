//! In-memory instrument models.
//!
//! Each model answers the bytes its real counterpart would, behind a
//! [`MockTransport`]. Models are cheap handles over shared state: clone one,
//! give the clone's transport to a session and keep the original to inspect
//! or perturb the device from a test.

mod alicat;
mod laser;
mod modbus;
mod power_supply;

pub use alicat::AlicatDevice;
pub use laser::LaserController;
pub use modbus::ModbusDevice;
pub use power_supply::{PowerSupplyDevice, MODE_OFFSET};

use crate::catalog::{Catalog, HEATER, MASS_FLOW_CONTROLLER, ROBOT_ARM, ULTRASONIC};
use crate::codec::ascii::unit_for;
use crate::config::{DeviceConfig, DeviceKind};
use crate::transport::mock::{MockConnector, MockTransport};

/// A simulated instrument of any kind.
#[derive(Debug, Clone)]
pub enum Simulator {
    Modbus(ModbusDevice),
    PowerSupply(PowerSupplyDevice),
    Laser(LaserController),
    Alicat(AlicatDevice),
}

impl Simulator {
    /// A model of `kind` answering on the slave id `config` selects.
    pub fn for_kind(kind: DeviceKind, config: &DeviceConfig) -> Self {
        let slave = config.slave_id;
        match kind {
            DeviceKind::MassFlowController => Simulator::Modbus(
                populated(ModbusDevice::rtu(slave), &MASS_FLOW_CONTROLLER)
                    .mirror(
                        register(&MASS_FLOW_CONTROLLER, "FLOW_RATE"),
                        register(&MASS_FLOW_CONTROLLER, "PV_FLOW"),
                    )
                    .mirror(
                        register(&MASS_FLOW_CONTROLLER, "FLOW_RATE"),
                        register(&MASS_FLOW_CONTROLLER, "SETTING_SP_FLOW"),
                    ),
            ),
            DeviceKind::Heater => {
                let device = populated(ModbusDevice::rtu(slave), &HEATER);
                device.set_register(register(&HEATER, "PV"), 25);
                Simulator::Modbus(device)
            }
            DeviceKind::Ultrasonic => Simulator::Modbus(
                populated(ModbusDevice::rtu(slave), &ULTRASONIC)
                    .mirror(register(&ULTRASONIC, "COMMAND"), register(&ULTRASONIC, "STATUS")),
            ),
            DeviceKind::RobotArm => Simulator::Modbus(
                populated(ModbusDevice::tcp(slave), &ROBOT_ARM)
                    .mirror(
                        register(&ROBOT_ARM, "HEIGHT_OFFSET_VALUE"),
                        register(&ROBOT_ARM, "ACTUAL_OFFSET_VALUE"),
                    )
                    .mirror(
                        register(&ROBOT_ARM, "COUNT_ADJUSTMENT_VALUE"),
                        register(&ROBOT_ARM, "ACTUAL_COUNT_VALUE"),
                    ),
            ),
            DeviceKind::PowerSupply => Simulator::PowerSupply(PowerSupplyDevice::new()),
            DeviceKind::Laser => Simulator::Laser(LaserController::new()),
            DeviceKind::Alicat => Simulator::Alicat(AlicatDevice::new(unit_for(slave).unwrap_or('A'))),
        }
    }

    pub fn transport(&self) -> MockTransport {
        match self {
            Simulator::Modbus(device) => device.transport(),
            Simulator::PowerSupply(device) => device.transport(),
            Simulator::Laser(device) => device.transport(),
            Simulator::Alicat(device) => device.transport(),
        }
    }
}

/// A connector serving one simulator per device address.
pub fn connector<'a>(
    devices: impl IntoIterator<Item = (DeviceKind, &'a DeviceConfig)>,
) -> MockConnector {
    devices
        .into_iter()
        .fold(MockConnector::new(), |connector, (kind, config)| {
            let simulator = Simulator::for_kind(kind, config);
            connector.with_device(config.address(), move || simulator.transport())
        })
}

/// Every catalog register defined, at the bottom of its range.
fn populated(device: ModbusDevice, catalog: &Catalog) -> ModbusDevice {
    for register in catalog.registers {
        let floor = register.range.map_or(0.0, |(low, _)| low);
        device.set_register(register.address, floor as u16);
    }
    device
}

fn register(catalog: &Catalog, name: &str) -> u16 {
    catalog.get(name).map_or(0, |r| r.address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_setpoint_shows_up_as_measured_flow() {
        let config = DeviceKind::MassFlowController.config_for("/dev/ttyUSB0");
        let Simulator::Modbus(device) = Simulator::for_kind(DeviceKind::MassFlowController, &config)
        else {
            panic!("mass-flow controller should be a Modbus model");
        };
        let mut responder = device.clone();
        let request = crate::codec::modbus::encode_rtu(
            1,
            &crate::codec::Request::WriteSingle { address: 0x04B9, value: 1200 },
        );
        crate::transport::mock::Responder::respond(&mut responder, &request);
        assert_eq!(device.register(0x04B7), Some(1200));
        assert_eq!(device.register(0x07E0), Some(1));
    }
}
