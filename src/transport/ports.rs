//! Serial port discovery.
//!
//! Lists the ports the operating system exposes and checks whether a given
//! port can currently be opened. USB adapters carry vendor, product and
//! serial information, which is what operators use to tell the MFC cable
//! from the laser cable.

use serde::Serialize;
use serialport::SerialPortType;
use thiserror::Error;

/// Errors raised while scanning ports.
#[derive(Debug, Error)]
pub enum PortScanError {
    /// The OS refused to enumerate ports.
    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),
}

/// One serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Path used to open the port, e.g. `/dev/ttyUSB0` or `COM3`.
    pub device: String,
    /// Short name, the last path component.
    pub name: String,
    pub description: String,
    /// Hardware id in `USB VID:PID=xxxx:xxxx SER=...` form, when known.
    pub hwid: Option<String>,
    pub manufacturer: Option<String>,
}

impl PortInfo {
    fn from_serialport(info: serialport::SerialPortInfo) -> Self {
        let name = info
            .port_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&info.port_name)
            .to_string();
        let (description, hwid, manufacturer) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let mut hwid = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial) = &usb.serial_number {
                    hwid.push_str(&format!(" SER={serial}"));
                }
                (
                    usb.product.clone().unwrap_or_else(|| "USB serial".to_string()),
                    Some(hwid),
                    usb.manufacturer,
                )
            }
            SerialPortType::PciPort => ("PCI serial".to_string(), None, None),
            SerialPortType::BluetoothPort => ("Bluetooth serial".to_string(), None, None),
            SerialPortType::Unknown => ("serial".to_string(), None, None),
        };
        Self {
            device: info.port_name,
            name,
            description,
            hwid,
            manufacturer,
        }
    }
}

/// Enumerate serial ports, sorted by device path.
pub fn list_ports() -> Result<Vec<PortInfo>, PortScanError> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .map(PortInfo::from_serialport)
        .collect();
    ports.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(ports)
}

/// Whether `port` can be opened right now. A port held by a live session is
/// reported as unavailable on platforms with exclusive serial access.
pub fn is_available(port: &str) -> bool {
    serialport::new(port, 9600)
        .timeout(std::time::Duration::from_secs(1))
        .open()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{SerialPortInfo, UsbPortInfo};

    #[test]
    fn usb_ports_carry_hardware_id() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("A50285BI".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R USB UART".to_string()),
            }),
        };
        let port = PortInfo::from_serialport(info);
        assert_eq!(port.name, "ttyUSB0");
        assert_eq!(port.description, "FT232R USB UART");
        assert_eq!(port.hwid.as_deref(), Some("USB VID:PID=0403:6001 SER=A50285BI"));
        assert_eq!(port.manufacturer.as_deref(), Some("FTDI"));
    }

    #[test]
    fn missing_port_is_not_available() {
        assert!(!is_available("/dev/does-not-exist-labbridge"));
    }
}
