//! Byte transports: serial ports, TCP sockets and in-memory mocks.
//!
//! A [`Transport`] owns one physical link. Every read is bounded by a caller
//! supplied timeout, and a timeout is an ordinary recoverable error. Stale
//! input is discarded before each write so a failed exchange cannot leak
//! bytes into the next one.
//!
//! # Implementations
//!
//! - [`StreamTransport`]: any `AsyncRead + AsyncWrite` stream, used for
//!   `tokio_serial::SerialStream`, `TcpStream` and `tokio::io::duplex`
//! - [`mock::MockTransport`]: scripted device with a shared wire log

pub mod mock;
pub mod ports;
mod stream;

pub use stream::{connect_tcp, open_serial, SerialPortIO, StreamTransport};

use crate::config::{DeviceConfig, TransportConfig};
use crate::error::{AppResult, TransportError};
use async_trait::async_trait;
use std::time::Duration;

/// Raw byte I/O with timeouts.
#[async_trait]
pub trait Transport: Send {
    /// Discard stale input, then write all bytes.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived and
    /// [`TransportError::ShortRead`] when only part of the frame did. A partial
    /// frame is discarded, never left pending.
    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Read up to and including `terminator`.
    async fn read_until(&mut self, terminator: u8, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Read at least `min_len` bytes, then keep collecting until the line
    /// goes quiet. Used for replies whose length is not known up front.
    async fn read_burst(&mut self, min_len: usize, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Drop buffered input. Returns the number of bytes discarded.
    async fn clear(&mut self) -> Result<usize, TransportError>;

    /// Release the port or socket. Further I/O fails with `Closed`.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Port name or `host:port`, for logs and events.
    fn describe(&self) -> &str;
}

/// Open the link described by `config`.
pub async fn open(config: &DeviceConfig) -> AppResult<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match &config.transport {
        TransportConfig::Serial(serial) => Box::new(open_serial(serial).await?),
        TransportConfig::Tcp { host, port } => {
            Box::new(connect_tcp(host, *port, config.response_timeout).await?)
        }
    };
    Ok(transport)
}

/// Render bytes as spaced hex for frame logging.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}
