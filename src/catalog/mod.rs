//! Static register catalogs.
//!
//! Every device type has one [`Catalog`]: a process-wide constant table that
//! maps a symbolic register name to its address, access mode, valid range and
//! a human label. Catalogs are consulted before any I/O so that unknown names,
//! writes to read-only registers and out-of-range values never reach the wire.

mod tables;

pub use tables::{
    alicat, laser, power_supply, ALICAT, HEATER, LASER, MASS_FLOW_CONTROLLER, POWER_SUPPLY,
    ROBOT_ARM, ULTRASONIC,
};

use crate::error::{AppResult, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who may touch a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Number of 16-bit words a register spans on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Single,
    /// 32-bit quantity, high word first.
    Double,
}

/// One named register or command slot.
#[derive(Debug, Clone, Copy)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub access: Access,
    /// Inclusive bounds in the register's natural unit.
    pub range: Option<(f64, f64)>,
    pub description: &'static str,
    /// Raw value to label pairs for enumerated registers.
    pub labels: &'static [(i64, &'static str)],
    pub width: Width,
}

impl Register {
    pub const fn new(name: &'static str, address: u16, access: Access) -> Self {
        Self {
            name,
            address,
            access,
            range: None,
            description: "",
            labels: &[],
            width: Width::Single,
        }
    }

    pub const fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub const fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn labels(mut self, labels: &'static [(i64, &'static str)]) -> Self {
        self.labels = labels;
        self
    }

    pub const fn double(mut self) -> Self {
        self.width = Width::Double;
        self
    }

    /// Human label for an enumerated raw value.
    pub fn label_for(&self, raw: i64) -> Option<&'static str> {
        self.labels
            .iter()
            .find(|(value, _)| *value == raw)
            .map(|(_, label)| *label)
    }

    /// Reject values outside the declared range.
    pub fn check_range(&self, value: f64) -> AppResult<()> {
        if let Some((min, max)) = self.range {
            if !(min..=max).contains(&value) {
                return Err(ValidationError::OutOfRange {
                    register: self.name.to_string(),
                    value,
                    min,
                    max,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Whether a value read back from the device is plausible.
    pub fn plausible(&self, value: f64) -> bool {
        self.range
            .map(|(min, max)| (min..=max).contains(&value))
            .unwrap_or(true)
    }
}

/// Register table for one device type.
#[derive(Debug)]
pub struct Catalog {
    pub device: &'static str,
    pub registers: &'static [Register],
    /// Register read by the connect-time verification exchange.
    pub identity: &'static str,
}

impl Catalog {
    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> AppResult<&'static Register> {
        self.registers
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ValidationError::UnknownRegister(name.to_string()).into())
    }

    pub fn by_address(&self, address: u16) -> Option<&'static Register> {
        self.registers.iter().find(|r| r.address == address)
    }

    pub fn readable(&self) -> impl Iterator<Item = &'static Register> {
        self.registers.iter().filter(|r| r.access.readable())
    }

    /// Look up a register for reading.
    pub fn for_read(&self, name: &str) -> AppResult<&'static Register> {
        let register = self.get(name)?;
        if !register.access.readable() {
            return Err(ValidationError::WriteOnly(register.name.to_string()).into());
        }
        Ok(register)
    }

    /// Look up a register for writing and check the value against it.
    pub fn validate_write(&self, name: &str, value: &Value) -> AppResult<&'static Register> {
        let register = self.get(name)?;
        if !register.access.writable() {
            return Err(ValidationError::ReadOnly(register.name.to_string()).into());
        }
        let numeric = value.as_f64().ok_or_else(|| ValidationError::TypeMismatch {
            register: register.name.to_string(),
            reason: "expected a numeric value".to_string(),
        })?;
        register.check_range(numeric)?;
        Ok(register)
    }
}

/// A value read from or written to a register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }

    /// Integral view; floats must carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Parse user input: integers stay integral, anything else with a dot is a float.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x") {
            return i64::from_str_radix(hex, 16).ok().map(Value::Integer);
        }
        text.parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| text.parse::<f64>().map(Value::Float))
            .ok()
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bytes(bytes) => {
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[test]
    fn lookup_is_case_insensitive() {
        let reg = MASS_FLOW_CONTROLLER.get("flow_rate").unwrap();
        assert_eq!(reg.address, 0x04B9);
    }

    #[test]
    fn unknown_register_is_a_validation_error() {
        let err = MASS_FLOW_CONTROLLER.get("NOPE").unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Validation(ValidationError::UnknownRegister(_))
        ));
    }

    #[test]
    fn writes_are_checked_against_range_and_access() {
        assert!(MASS_FLOW_CONTROLLER
            .validate_write("FLOW_RATE", &Value::Integer(110))
            .is_ok());
        assert!(matches!(
            MASS_FLOW_CONTROLLER.validate_write("FLOW_RATE", &Value::Integer(60_000)),
            Err(DeviceError::Validation(ValidationError::OutOfRange { .. }))
        ));
        assert!(matches!(
            MASS_FLOW_CONTROLLER.validate_write("GAS_TYPE", &Value::Integer(110)),
            Err(DeviceError::Validation(ValidationError::OutOfRange { .. }))
        ));
        assert!(matches!(
            MASS_FLOW_CONTROLLER.validate_write("PV_FLOW", &Value::Integer(1)),
            Err(DeviceError::Validation(ValidationError::ReadOnly(_)))
        ));
    }

    #[test]
    fn gas_labels_resolve() {
        let gas = MASS_FLOW_CONTROLLER.get("GAS_TYPE").unwrap();
        assert_eq!(gas.label_for(3), Some("Ar"));
        assert_eq!(gas.label_for(99), None);
    }

    #[test]
    fn every_catalog_has_a_readable_identity_and_unique_names() {
        for catalog in [
            &MASS_FLOW_CONTROLLER,
            &HEATER,
            &ULTRASONIC,
            &POWER_SUPPLY,
            &LASER,
            &ROBOT_ARM,
            &ALICAT,
        ] {
            assert!(catalog.for_read(catalog.identity).is_ok(), "{}", catalog.device);
            let mut names: Vec<_> = catalog.registers.iter().map(|r| r.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), catalog.registers.len(), "{}", catalog.device);
        }
    }

    #[test]
    fn value_parsing() {
        assert_eq!(Value::parse("42"), Some(Value::Integer(42)));
        assert_eq!(Value::parse("0x10"), Some(Value::Integer(16)));
        assert_eq!(Value::parse("12.5"), Some(Value::Float(12.5)));
        assert_eq!(Value::parse("abc"), None);
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float(3.5).as_i64(), None);
    }
}
