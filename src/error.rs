//! Error types for the device communication layer.
//!
//! `DeviceError` is the single error type returned by every public operation.
//! It nests one enum per failure family so callers can match on the family
//! (`DeviceError::Transport(_)`) or on the exact condition
//! (`DeviceError::Transport(TransportError::Timeout { .. })`).
//!
//! ## Families
//!
//! - **`Transport`**: the port or socket could not be opened, a read timed
//!   out, or the operating system reported an I/O fault.
//! - **`Framing`**: bytes arrived but do not form a valid reply (bad CRC or
//!   BCC, missing terminator, truncated frame, wrong echo).
//! - **`Protocol`**: the instrument answered correctly but refused the
//!   request (Modbus exception, NAK, `?` reply, laser not in remote mode).
//! - **`Validation`**: the caller asked for something the catalog forbids.
//!   Raised before any byte is written.
//! - **`VerificationFailed`**: a write went through but the read-back never
//!   matched the requested value.
//! - **`Session`**: the session is not in a state that accepts the request.
//!
//! Transport and framing errors are retried by [`crate::retry`] up to the
//! protocol's bounds; everything else is returned immediately.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the device error type.
pub type AppResult<T> = std::result::Result<T, DeviceError>;

/// Primary error type for device operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("verification failed: expected {expected}, observed {observed}")]
    VerificationFailed { expected: String, observed: String },

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Failures of the physical link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("I/O fault: {0}")]
    IoFault(String),

    #[error("transport closed")]
    Closed,
}

/// Replies that arrived but are malformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramingError {
    #[error("checksum mismatch: expected {expected:#06x}, received {received:#06x}")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error("unexpected terminator byte {0:#04x}")]
    UnexpectedTerminator(u8),

    #[error("short frame: expected at least {expected} bytes, received {received}")]
    ShortFrame { expected: usize, received: usize },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("implausible value {value} for {register}")]
    ImplausibleValue { register: &'static str, value: i64 },
}

/// Refusals reported by the instrument itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Modbus exception {code}: {}", exception_name(.code))]
    ModbusException { code: u8 },

    #[error("device answered NAK")]
    DeviceNak,

    #[error("device rejected command '{0}'")]
    CommandRejected(String),

    #[error("{0} requires remote-control mode")]
    RemoteRequired(&'static str),

    #[error("operation needs the {expected} protocol, session speaks {actual}")]
    WrongProtocol {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Caller mistakes, rejected before any I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{register}: value {value} outside {min}..={max}")]
    OutOfRange {
        register: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    #[error("register '{0}' is read-only")]
    ReadOnly(String),

    #[error("register '{0}' is write-only")]
    WriteOnly(String),

    #[error("{register}: {reason}")]
    TypeMismatch { register: String, reason: String },

    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
}

/// Requests that arrive when the session cannot serve them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("a session for {0} is already connected")]
    AlreadyConnected(String),

    #[error("operation cancelled before it started")]
    QueueCancelled,

    #[error("unknown session {0}")]
    UnknownSession(String),
}

impl DeviceError {
    /// Whether the retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Transport(e) => !e.is_fatal(),
            DeviceError::Framing(_) => true,
            _ => false,
        }
    }

    /// Whether the error means the link is gone and the session must fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Transport(e) if e.is_fatal())
    }

    pub(crate) fn verification(expected: impl ToString, observed: impl ToString) -> Self {
        DeviceError::VerificationFailed {
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }
}

impl TransportError {
    /// Hard faults: the port vanished or the OS refused further I/O.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::IoFault(_)
                | TransportError::Closed
                | TransportError::PortUnavailable(_)
                | TransportError::PermissionDenied(_)
        )
    }

    /// Map an OS error raised while opening a port or socket.
    pub fn from_open(err: &io::Error, address: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable => {
                TransportError::PortUnavailable(format!("{address}: {err}"))
            }
            io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(format!("{address}: {err}"))
            }
            io::ErrorKind::TimedOut => TransportError::PortUnavailable(format!(
                "{address}: connection attempt timed out"
            )),
            _ => TransportError::IoFault(format!("{address}: {err}")),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                TransportError::Timeout(Duration::ZERO)
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Closed,
            _ => TransportError::IoFault(err.to_string()),
        }
    }
}

fn exception_name(code: &u8) -> &'static str {
    modbus_exception_text(*code)
}

/// Standard Modbus exception names.
pub fn modbus_exception_text(code: u8) -> &'static str {
    match code {
        1 => "Illegal Function",
        2 => "Illegal Data Address",
        3 => "Illegal Data Value",
        4 => "Device Failure",
        5 => "Acknowledge",
        6 => "Device Busy",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_framing_are_retryable() {
        assert!(DeviceError::from(TransportError::Timeout(Duration::from_millis(5))).is_retryable());
        assert!(DeviceError::from(FramingError::UnexpectedTerminator(0x04)).is_retryable());
        assert!(!DeviceError::from(TransportError::IoFault("gone".into())).is_retryable());
        assert!(!DeviceError::from(ProtocolError::DeviceNak).is_retryable());
        assert!(
            !DeviceError::from(ValidationError::UnknownRegister("X".into())).is_retryable()
        );
    }

    #[test]
    fn only_hard_transport_faults_are_fatal() {
        assert!(DeviceError::from(TransportError::Closed).is_fatal());
        assert!(!DeviceError::from(TransportError::Timeout(Duration::ZERO)).is_fatal());
        assert!(!DeviceError::from(ProtocolError::ModbusException { code: 2 }).is_fatal());
    }

    #[test]
    fn exception_message_names_the_code() {
        let err = DeviceError::from(ProtocolError::ModbusException { code: 2 });
        assert_eq!(
            err.to_string(),
            "protocol error: Modbus exception 2: Illegal Data Address"
        );
    }

    #[test]
    fn open_errors_map_to_contract_variants() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(matches!(
            TransportError::from_open(&missing, "/dev/ttyUSB9"),
            TransportError::PortUnavailable(_)
        ));
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            TransportError::from_open(&denied, "/dev/ttyUSB0"),
            TransportError::PermissionDenied(_)
        ));
    }
}
