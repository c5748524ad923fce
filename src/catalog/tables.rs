//! Per-device register tables.

use super::{Access, Catalog, Register};

use Access::{ReadOnly, ReadWrite, WriteOnly};

const FULL_WORD: (f64, f64) = (0.0, 65535.0);

const GAS_LABELS: &[(i64, &str)] = &[
    (0, "user defined"),
    (1, "Air/N2"),
    (2, "O2"),
    (3, "Ar"),
    (4, "CO2"),
    (6, "propane 100%"),
    (7, "methane 100%"),
    (8, "butane 100%"),
    (11, "city gas 13A"),
];

const FLOW_UNIT_LABELS: &[(i64, &str)] = &[(0, "mL/min"), (1, "L/min"), (2, "m^3/h")];
const TOTAL_UNIT_LABELS: &[(i64, &str)] = &[(0, "mL"), (1, "L"), (2, "m^3")];
const GATE_LABELS: &[(i64, &str)] = &[(0, "fully closed"), (1, "control"), (2, "fully open")];
const KEY_LOCK_LABELS: &[(i64, &str)] = &[(0, "unlocked"), (1, "partial lock"), (2, "full lock")];
const CONTROL_LABELS: &[(i64, &str)] = &[(0, "SP0-SP7"), (1, "analog"), (2, "direct")];
const LIMIT_LABELS: &[(i64, &str)] = &[
    (0, "disabled"),
    (1, "upper only"),
    (2, "lower only"),
    (3, "upper and lower"),
];
const GATE_ERROR_LABELS: &[(i64, &str)] =
    &[(1, "no change"), (2, "force closed"), (3, "force open")];
const INITIAL_TEMP_LABELS: &[(i64, &str)] = &[(0, "20 C"), (1, "0 C"), (2, "25 C"), (3, "35 C")];
const INSTALL_LABELS: &[(i64, &str)] =
    &[(0, "horizontal"), (1, "vertical up"), (2, "vertical down")];
const SENSOR_LABELS: &[(i64, &str)] = &[
    (0, "fast"),
    (1, "standard"),
    (2, "stable"),
    (3, "custom PID"),
];

const SETPOINT: (f64, f64) = (0.0, 50000.0);

/// Azbil MQV-series mass-flow controller.
pub static MASS_FLOW_CONTROLLER: Catalog = Catalog {
    device: "mass_flow_controller",
    identity: "PV_FLOW",
    registers: &[
        Register::new("GAS_TYPE", 0x07E2, ReadWrite)
            .range(0.0, 11.0)
            .describe("gas type, takes 2 s to apply")
            .labels(GAS_LABELS),
        Register::new("FLOW_DECIMAL", 0x07F6, ReadWrite)
            .range(0.0, 3.0)
            .describe("flow decimal places"),
        Register::new("TOTAL_FLOW_DECIMAL", 0x0803, ReadWrite)
            .range(0.0, 3.0)
            .describe("totaliser decimal places"),
        Register::new("FLOW_UNIT", 0x07F5, ReadWrite)
            .range(0.0, 2.0)
            .describe("flow unit")
            .labels(FLOW_UNIT_LABELS),
        Register::new("TOTAL_FLOW_UNIT", 0x07FB, ReadWrite)
            .range(0.0, 2.0)
            .describe("totaliser unit")
            .labels(TOTAL_UNIT_LABELS),
        Register::new("GATE_CONTROL", 0x04B4, ReadWrite)
            .range(0.0, 2.0)
            .describe("valve gate")
            .labels(GATE_LABELS),
        Register::new("SP_NO_SETTING", 0x04B5, ReadWrite)
            .range(0.0, 7.0)
            .describe("active setpoint slot"),
        Register::new("SP_0_SETTING", 0x0579, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_1_SETTING", 0x057A, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_2_SETTING", 0x057B, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_3_SETTING", 0x057C, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_4_SETTING", 0x057D, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_5_SETTING", 0x057E, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_6_SETTING", 0x057F, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SP_7_SETTING", 0x0580, ReadWrite).range(SETPOINT.0, SETPOINT.1),
        Register::new("SETTING_SP_FLOW", 0x04B6, ReadOnly).describe("setpoint in use"),
        Register::new("PV_FLOW", 0x04B7, ReadOnly).describe("measured flow"),
        Register::new("FLOW_RATE", 0x04B9, ReadWrite)
            .range(SETPOINT.0, SETPOINT.1)
            .describe("direct flow setpoint"),
        Register::new("KEY_LOCK", 0x07D1, ReadWrite)
            .range(0.0, 2.0)
            .labels(KEY_LOCK_LABELS),
        Register::new("FLOW_CONTROL_SETTING", 0x07D3, ReadWrite)
            .range(0.0, 2.0)
            .describe("setpoint source")
            .labels(CONTROL_LABELS),
        Register::new("SIMULATION_FLOW", 0x07D6, ReadWrite)
            .range(0.0, 7.0)
            .describe("analog I/O mode"),
        Register::new("FLOW_LIMIT", 0x07DF, ReadWrite)
            .range(0.0, 3.0)
            .labels(LIMIT_LABELS),
        Register::new("GATE_ERROR_FIX", 0x07E0, ReadWrite)
            .range(1.0, 3.0)
            .describe("valve action on gate error")
            .labels(GATE_ERROR_LABELS),
        Register::new("FLOW_INITIAL_TEMP", 0x07E3, ReadWrite)
            .range(0.0, 3.0)
            .describe("reference temperature")
            .labels(INITIAL_TEMP_LABELS),
        Register::new("DEVICE_ID_SETTING", 0x07EE, ReadWrite)
            .range(0.0, 127.0)
            .describe("RS-485 address, 0 disables communication"),
        Register::new("DEVICE_INSTALL_DIR", 0x07F2, ReadWrite)
            .range(0.0, 2.0)
            .labels(INSTALL_LABELS),
        Register::new("FLOW_INPUT_LIMIT", 0x07F3, ReadWrite)
            .range(0.0, 3.0)
            .labels(LIMIT_LABELS),
        Register::new("FLOW_SENSOR_TYPE", 0x07F4, ReadWrite)
            .range(0.0, 3.0)
            .describe("control response")
            .labels(SENSOR_LABELS),
        Register::new("KEY_DIRECTION", 0x0804, ReadWrite)
            .range(0.0, 3.0)
            .describe("display orientation"),
        Register::new("TOTAL_FLOW_RESET", 0x04BC, WriteOnly)
            .range(0.0, 0.0)
            .describe("32-bit totaliser, write 0 to reset")
            .double(),
    ],
};

const TEMPERATURE: (f64, f64) = (0.0, 9999.0);

/// Single-loop temperature controller driving the resistive heater.
pub static HEATER: Catalog = Catalog {
    device: "heater",
    identity: "PV",
    registers: &[
        Register::new("SV", 0x0040, ReadWrite)
            .range(TEMPERATURE.0, TEMPERATURE.1)
            .describe("target temperature"),
        Register::new("PV", 0x0041, ReadOnly).describe("measured temperature"),
        Register::new("SV2", 0x0042, ReadWrite)
            .range(TEMPERATURE.0, TEMPERATURE.1)
            .describe("soft-start temperature"),
        Register::new("GAIN", 0x0034, ReadWrite).range(FULL_WORD.0, FULL_WORD.1),
        Register::new("P", 0x0031, ReadWrite)
            .range(0.0, 9999.0)
            .describe("proportional band"),
        Register::new("I", 0x0032, ReadWrite)
            .range(0.0, 9999.0)
            .describe("integral time"),
        Register::new("D", 0x0033, ReadWrite)
            .range(0.0, 9999.0)
            .describe("derivative time"),
        Register::new("M", 0x0025, ReadWrite)
            .range(0.0, 1.0)
            .describe("control mode")
            .labels(&[(0, "auto"), (1, "manual")]),
        Register::new("RAP", 0x000D, ReadWrite)
            .range(0.0, 9999.0)
            .describe("ramp rate"),
        Register::new("SLH", 0x0007, ReadWrite)
            .range(TEMPERATURE.0, TEMPERATURE.1)
            .describe("setpoint high limit"),
    ],
};

/// Ultrasonic atomizer driver board.
pub static ULTRASONIC: Catalog = Catalog {
    device: "ultrasonic",
    identity: "STATUS",
    registers: &[
        Register::new("COMMAND", 0x0001, ReadWrite)
            .range(0.0, 1.0)
            .describe("run command")
            .labels(&[(0, "stop"), (1, "run")]),
        Register::new("STATUS", 0x0003, ReadOnly).describe("oscillator status"),
        Register::new("DI", 0x0029, ReadOnly).describe("digital inputs"),
    ],
};

/// Power-supply register numbers on the framed protocol.
pub mod power_supply {
    pub const MODE: u16 = 0;
    pub const COMMAND: u16 = 1;
    pub const ERROR_CODE: u16 = 2;
    pub const VOLTAGE_SET: u16 = 13;
    pub const CURRENT_SET: u16 = 14;
    pub const VOLTAGE_ACTUAL: u16 = 20;
    pub const CURRENT_ACTUAL: u16 = 21;
}

/// Pulsed DC power supply on the framed protocol. Ranges on readable
/// registers double as the plausibility window for read-back.
pub static POWER_SUPPLY: Catalog = Catalog {
    device: "power_supply",
    identity: "VOLTAGE_SET",
    registers: &[
        Register::new("MODE", power_supply::MODE, ReadOnly)
            .range(30000.0, 60000.0)
            .describe("operating mode, offset by 0x8000"),
        Register::new("STATUS", power_supply::MODE, ReadOnly)
            .range(FULL_WORD.0, FULL_WORD.1)
            .describe("status bits: DC1 on, power on, error, ready"),
        Register::new("COMMAND", power_supply::COMMAND, WriteOnly)
            .range(0.0, 255.0)
            .describe("control command")
            .labels(&[(3, "clear error"), (32, "DC1 off"), (33, "DC1 on")]),
        Register::new("ERROR_CODE", power_supply::ERROR_CODE, ReadOnly)
            .range(FULL_WORD.0, FULL_WORD.1),
        Register::new("VOLTAGE_SET", power_supply::VOLTAGE_SET, ReadWrite)
            .range(0.0, 4000.0)
            .describe("voltage setpoint, 0.2 V per count"),
        Register::new("CURRENT_SET", power_supply::CURRENT_SET, ReadWrite)
            .range(0.0, 4000.0)
            .describe("current setpoint, 1 mA per count"),
        Register::new("VOLTAGE_ACTUAL", power_supply::VOLTAGE_ACTUAL, ReadOnly)
            .range(0.0, 4000.0)
            .describe("output voltage, 0.2 V per count"),
        Register::new("CURRENT_ACTUAL", power_supply::CURRENT_ACTUAL, ReadOnly)
            .range(0.0, 4000.0)
            .describe("output current, 1 mA per count"),
    ],
};

/// Field identifiers for the laser status word. The controller has no
/// addressable registers; these slots name decoded status fields.
pub mod laser {
    pub const MODE: u16 = 0;
    pub const REMOTE_CONTROL: u16 = 1;
    pub const LASER_ON: u16 = 2;
    pub const GATE_PULL_UP: u16 = 3;
    pub const PWM_FREQUENCY: u16 = 4;
    pub const LASE_ON_POWERUP: u16 = 5;
    pub const MAX_PWM_95: u16 = 6;
    pub const VERSION: u16 = 7;
    pub const PWM_PERCENTAGE: u16 = 8;
    pub const POWER_PERCENTAGE: u16 = 9;
}

const ON_OFF: &[(i64, &str)] = &[(0, "off"), (1, "on")];

/// UC-2000 CO2 laser controller.
pub static LASER: Catalog = Catalog {
    device: "laser",
    identity: "MODE",
    registers: &[
        Register::new("MODE", laser::MODE, ReadWrite)
            .range(0.0, 5.0)
            .describe("operating mode")
            .labels(&[
                (0, "manual"),
                (1, "ANC"),
                (2, "ANV"),
                (3, "manual closed"),
                (4, "ANV closed"),
                (5, "remote"),
            ]),
        Register::new("REMOTE_CONTROL", laser::REMOTE_CONTROL, ReadOnly).labels(ON_OFF),
        Register::new("LASER_ON", laser::LASER_ON, ReadWrite)
            .range(0.0, 1.0)
            .labels(ON_OFF),
        Register::new("GATE_PULL_UP", laser::GATE_PULL_UP, ReadWrite)
            .range(0.0, 1.0)
            .labels(ON_OFF),
        Register::new("PWM_FREQUENCY", laser::PWM_FREQUENCY, ReadWrite)
            .range(5.0, 20.0)
            .describe("PWM frequency in kHz: 5, 10 or 20"),
        Register::new("LASE_ON_POWERUP", laser::LASE_ON_POWERUP, ReadWrite)
            .range(0.0, 1.0)
            .labels(ON_OFF),
        Register::new("MAX_PWM_95", laser::MAX_PWM_95, ReadWrite)
            .range(0.0, 1.0)
            .describe("cap PWM at 95%")
            .labels(ON_OFF),
        Register::new("VERSION", laser::VERSION, ReadOnly),
        Register::new("PWM_PERCENTAGE", laser::PWM_PERCENTAGE, ReadWrite)
            .range(0.0, 99.0)
            .describe("PWM duty cycle in percent"),
        Register::new("POWER_PERCENTAGE", laser::POWER_PERCENTAGE, ReadOnly)
            .describe("output power in percent"),
    ],
};

const SWITCH: (f64, f64) = (0.0, 1.0);

/// Robot-arm PLC reached over Modbus TCP.
pub static ROBOT_ARM: Catalog = Catalog {
    device: "robot_arm",
    identity: "ROBOT_START",
    registers: &[
        Register::new("ROBOT_START", 0x9C41, ReadWrite)
            .range(SWITCH.0, SWITCH.1)
            .describe("start the arm"),
        Register::new("ADJUSTMENT_RATE_ENABLED", 0x9C43, ReadWrite)
            .range(SWITCH.0, SWITCH.1),
        Register::new("ADJUSTMENT_RATE_VALUE", 0x9C45, ReadWrite)
            .range(0.0, 100.0)
            .describe("speed override in percent"),
        Register::new("ACTUAL_OFFSET_VALUE", 0x9C47, ReadOnly)
            .describe("applied height offset"),
        Register::new("HEIGHT_ADJUSTMENT_ENABLED", 0x9C49, ReadWrite)
            .range(SWITCH.0, SWITCH.1),
        Register::new("HEIGHT_OFFSET_VALUE", 0x9C4B, ReadWrite).range(FULL_WORD.0, FULL_WORD.1),
        Register::new("ACTUAL_COUNT_VALUE", 0x9C4F, ReadOnly).describe("applied pass count"),
        Register::new("COUNT_ADJUSTMENT_ENABLED", 0x9C51, ReadWrite)
            .range(SWITCH.0, SWITCH.1),
        Register::new("COUNT_ADJUSTMENT_VALUE", 0x9C53, ReadWrite)
            .range(FULL_WORD.0, FULL_WORD.1),
    ],
};

/// Field identifiers for the Alicat status line. Like the laser, the
/// controller has no registers: reads pick a field of a fresh poll and
/// writes become ASCII commands.
pub mod alicat {
    pub const PRESSURE: u16 = 0;
    pub const TEMPERATURE: u16 = 1;
    pub const VOLUMETRIC_FLOW: u16 = 2;
    pub const MASS_FLOW: u16 = 3;
    pub const SETPOINT: u16 = 4;
    pub const GAS: u16 = 5;
    pub const FLOW_SETPOINT: u16 = 6;
    pub const PRESSURE_SETPOINT: u16 = 7;
}

/// Alicat mass-flow controller on its ASCII serial protocol.
pub static ALICAT: Catalog = Catalog {
    device: "alicat",
    identity: "MASS_FLOW",
    registers: &[
        Register::new("PRESSURE", alicat::PRESSURE, ReadOnly).describe("absolute pressure, psia"),
        Register::new("TEMPERATURE", alicat::TEMPERATURE, ReadOnly).describe("gas temperature, C"),
        Register::new("VOLUMETRIC_FLOW", alicat::VOLUMETRIC_FLOW, ReadOnly),
        Register::new("MASS_FLOW", alicat::MASS_FLOW, ReadOnly)
            .describe("mass flow in the controller's standard unit"),
        Register::new("SETPOINT", alicat::SETPOINT, ReadOnly)
            .describe("setpoint of the active control loop"),
        Register::new("GAS", alicat::GAS, ReadWrite)
            .range(0.0, 255.0)
            .describe("gas number: 0-29 standard, 236-255 mixes"),
        Register::new("FLOW_SETPOINT", alicat::FLOW_SETPOINT, WriteOnly)
            .range(0.0, 10000.0)
            .describe("switch to mass-flow control at this setpoint"),
        Register::new("PRESSURE_SETPOINT", alicat::PRESSURE_SETPOINT, WriteOnly)
            .range(0.0, 160.0)
            .describe("switch to pressure control at this setpoint, psia"),
    ],
};
