use super::{hex, Transport};
use crate::config::{Parity, SerialSettings};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Anything a transport can be built on.
///
/// This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::net::TcpStream` (Modbus TCP, serial servers)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(5);
const DEFAULT_QUIET_GAP: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// [`Transport`] over an async byte stream.
pub struct StreamTransport<S> {
    stream: Option<S>,
    pending: BytesMut,
    name: String,
    drain_window: Duration,
    quiet_gap: Duration,
}

impl<S: SerialPortIO> StreamTransport<S> {
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            pending: BytesMut::with_capacity(256),
            name: name.into(),
            drain_window: DEFAULT_DRAIN_WINDOW,
            quiet_gap: DEFAULT_QUIET_GAP,
        }
    }

    /// How long `clear` listens for stale bytes before writing.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Silence that ends a `read_burst`.
    pub fn with_quiet_gap(mut self, gap: Duration) -> Self {
        self.quiet_gap = gap;
        self
    }

    fn stream(&mut self) -> Result<&mut S, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    /// Pull whatever is available into `pending`, waiting no later than `deadline`.
    async fn fill(&mut self, deadline: Instant) -> Result<(), TransportError> {
        let mut chunk = [0u8; 256];
        let stream = self.stream()?;
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(Duration::ZERO)),
        }
    }

    /// Wait until at least `len` bytes are pending.
    async fn wait_for(&mut self, len: usize, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < len {
            match self.fill(deadline).await {
                Ok(()) => {}
                Err(TransportError::Timeout(_)) => {
                    let received = self.pending.len();
                    self.pending.clear();
                    return Err(if received == 0 {
                        TransportError::Timeout(timeout)
                    } else {
                        TransportError::ShortRead {
                            expected: len,
                            received,
                        }
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: SerialPortIO> Transport for StreamTransport<S> {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let discarded = self.clear().await?;
        if discarded > 0 {
            debug!(port = %self.name, discarded, "discarded stale bytes");
        }
        trace!(port = %self.name, tx = %hex(bytes), "write");
        let stream = self.stream()?;
        let result = tokio::time::timeout(WRITE_TIMEOUT, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(WRITE_TIMEOUT)),
        }
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.wait_for(len, timeout).await?;
        let frame = self.pending.split_to(len).to_vec();
        trace!(port = %self.name, rx = %hex(&frame), "read");
        Ok(frame)
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == terminator) {
                let frame = self.pending.split_to(pos + 1).to_vec();
                trace!(port = %self.name, rx = %hex(&frame), "read");
                return Ok(frame);
            }
            match self.fill(deadline).await {
                Ok(()) => {}
                Err(TransportError::Timeout(_)) => return Err(TransportError::Timeout(timeout)),
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_burst(
        &mut self,
        min_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.wait_for(min_len, timeout).await?;
        loop {
            match self.fill(Instant::now() + self.quiet_gap).await {
                Ok(()) => {}
                Err(TransportError::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }
        let frame = self.pending.split().to_vec();
        trace!(port = %self.name, rx = %hex(&frame), "read");
        Ok(frame)
    }

    async fn clear(&mut self) -> Result<usize, TransportError> {
        let buffered = self.pending.len();
        self.pending.clear();
        let window = self.drain_window;
        let stream = self.stream()?;
        Ok(buffered + drain_stream(stream, window).await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            debug!(port = %self.name, "closing transport");
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn describe(&self) -> &str {
        &self.name
    }
}

/// Read and discard until nothing arrives within `window`.
async fn drain_stream<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        match timeout_at(deadline, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Open a serial port on the blocking pool with explicit framing.
pub async fn open_serial(
    settings: &SerialSettings,
) -> Result<StreamTransport<tokio_serial::SerialStream>, TransportError> {
    use tokio_serial::SerialPortBuilderExt;

    let settings = settings.clone();
    let name = settings.port.clone();
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(match settings.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .stop_bits(if settings.stop_bits == 2 {
                tokio_serial::StopBits::Two
            } else {
                tokio_serial::StopBits::One
            })
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| TransportError::IoFault(format!("serial open task failed: {e}")))?
    .map_err(|e| serial_open_error(&e, &name))?;

    debug!(port = %name, "serial port opened");
    Ok(StreamTransport::new(stream, name).with_drain_window(Duration::from_millis(10)))
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn serial_open_error(err: &tokio_serial::Error, port: &str) -> TransportError {
    match err.kind() {
        tokio_serial::ErrorKind::NoDevice => {
            TransportError::PortUnavailable(format!("{port}: {}", err.description))
        }
        tokio_serial::ErrorKind::Io(kind) => {
            TransportError::from_open(&std::io::Error::new(kind, err.description.clone()), port)
        }
        _ => TransportError::PortUnavailable(format!("{port}: {}", err.description)),
    }
}

/// Connect to a TCP endpoint within `timeout`.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<StreamTransport<tokio::net::TcpStream>, TransportError> {
    let address = format!("{host}:{port}");
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address))
        .await
        .map_err(|_| TransportError::PortUnavailable(format!("{address}: connect timed out")))?
        .map_err(|e| TransportError::from_open(&e, &address))?;
    stream.set_nodelay(true)?;
    debug!(%address, "tcp connection established");
    Ok(StreamTransport::new(stream, address).with_drain_window(Duration::from_millis(1)))
}
