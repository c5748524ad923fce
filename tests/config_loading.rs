//! Loading lab configuration files from disk.

use labbridge::config::{DeviceKind, LabConfig, TransportConfig};
use labbridge::logging::{OutputFormat, TracingConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/labbridge.toml");
    let config = LabConfig::load_from(path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.devices.len(), 7);
    let psu = config.device("psu").unwrap();
    assert_eq!(psu.kind, DeviceKind::PowerSupply);
    let psu = psu.device_config().unwrap();
    assert_eq!(psu.response_timeout, Duration::from_secs(1));
    assert_eq!(psu.address(), "/dev/ttyUSB3");

    let robot = config.device("robot").unwrap().device_config().unwrap();
    assert!(matches!(robot.transport, TransportConfig::Tcp { .. }));
    assert_eq!(robot.address(), "192.168.1.5:502");

    let alicat = config.device("alicat").unwrap();
    assert_eq!(alicat.kind, DeviceKind::Alicat);
    assert_eq!(alicat.device_config().unwrap().address(), "/dev/ttyUSB5");
}

#[test]
fn test_minimal_file_falls_back_to_defaults() {
    let file = write_config(
        r#"
        [[devices]]
        id = "atomizer"
        kind = "ultrasonic"
        config = { transport = { port = "/dev/ttyACM0" } }
        "#,
    );
    let config = LabConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.session.queue_capacity, 32);
    let settings = config.session.settings();
    assert_eq!(settings.shutdown_timeout, Duration::from_secs(5));

    let device = config.devices[0].device_config().unwrap();
    assert_eq!(device.label.as_deref(), Some("atomizer"));
    assert_eq!(device.slave_id, 1);
    match device.transport {
        TransportConfig::Serial(serial) => assert_eq!(serial.baud_rate, 38_400),
        other => panic!("expected a serial transport, got {other:?}"),
    }
}

#[test]
fn test_logging_settings_come_from_the_file() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"
        log_format = "json"
        "#,
    );
    let config = LabConfig::load_from(file.path()).unwrap();
    let tracing = TracingConfig::from_lab_config(&config).unwrap();
    assert_eq!(tracing.format, OutputFormat::Json);
}

#[test]
fn test_unknown_device_kind_fails_to_load() {
    let file = write_config(
        r#"
        [[devices]]
        id = "mystery"
        kind = "spectrometer"
        "#,
    );
    let err = LabConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("spectrometer"));
}

#[test]
fn test_out_of_range_slave_id_is_rejected() {
    let file = write_config(
        r#"
        [[devices]]
        id = "mfc"
        kind = "mass_flow_controller"
        config = { transport = { port = "/dev/ttyUSB0" }, slave_id = 0 }
        "#,
    );
    let config = LabConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("slave"));
}
