//! In-memory transport for tests and simulation.
//!
//! A [`MockTransport`] forwards every write to a [`Responder`] (usually one of
//! the device models in [`crate::sim`]) and queues the reply bytes for the
//! next reads. Every write and read is appended to a shared [`WireLog`], so a
//! test can assert exactly what crossed the wire and in which order.

use super::{hex, Transport};
use crate::config::DeviceConfig;
use crate::error::{AppResult, TransportError};
use crate::session::Connector;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Produces the device's reply to one write.
pub trait Responder: Send {
    fn respond(&mut self, request: &[u8]) -> Vec<u8>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Vec<u8> + Send,
{
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

/// One direction of traffic on the mock wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Write(Vec<u8>),
    Read(Vec<u8>),
}

/// Shared, append-only record of wire traffic.
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<WireEvent>>>);

impl WireLog {
    pub fn events(&self) -> Vec<WireEvent> {
        self.0.lock().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                WireEvent::Write(bytes) => Some(bytes.clone()),
                WireEvent::Read(_) => None,
            })
            .collect()
    }

    pub fn bytes_written(&self) -> usize {
        self.writes().iter().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, event: WireEvent) {
        self.0.lock().push(event);
    }
}

/// Switch that makes a mock transport fail with a hard I/O fault.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch(Arc<AtomicBool>);

impl FaultSwitch {
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scripted transport.
pub struct MockTransport {
    name: String,
    responder: Box<dyn Responder>,
    inbox: VecDeque<u8>,
    log: WireLog,
    fault: FaultSwitch,
    closed: bool,
}

impl MockTransport {
    pub fn new(responder: impl Responder + 'static) -> Self {
        Self {
            name: "mock".to_string(),
            responder: Box::new(responder),
            inbox: VecDeque::new(),
            log: WireLog::default(),
            fault: FaultSwitch::default(),
            closed: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Record traffic into an existing log.
    pub fn with_log(mut self, log: WireLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_fault_switch(mut self, fault: FaultSwitch) -> Self {
        self.fault = fault;
        self
    }

    pub fn log(&self) -> WireLog {
        self.log.clone()
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.fault.tripped() {
            return Err(TransportError::IoFault(format!("{}: device unplugged", self.name)));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        let frame: Vec<u8> = self.inbox.drain(..len).collect();
        trace!(port = %self.name, rx = %hex(&frame), "mock read");
        self.log.push(WireEvent::Read(frame.clone()));
        frame
    }

    /// Emulate a line that stays silent for the whole timeout.
    async fn starve(&mut self, expected: usize, timeout: Duration) -> TransportError {
        tokio::time::sleep(timeout).await;
        let received = self.inbox.len();
        self.inbox.clear();
        if received == 0 {
            TransportError::Timeout(timeout)
        } else {
            TransportError::ShortRead { expected, received }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check()?;
        self.inbox.clear();
        trace!(port = %self.name, tx = %hex(bytes), "mock write");
        self.log.push(WireEvent::Write(bytes.to_vec()));
        let reply = self.responder.respond(bytes);
        self.inbox.extend(reply);
        Ok(())
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        if self.inbox.len() >= len {
            return Ok(self.take(len));
        }
        Err(self.starve(len, timeout).await)
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        match self.inbox.iter().position(|b| *b == terminator) {
            Some(pos) => Ok(self.take(pos + 1)),
            None => {
                self.starve(0, timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn read_burst(
        &mut self,
        min_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        if self.inbox.len() >= min_len {
            let len = self.inbox.len();
            return Ok(self.take(len));
        }
        Err(self.starve(min_len, timeout).await)
    }

    async fn clear(&mut self) -> Result<usize, TransportError> {
        let discarded = self.inbox.len();
        self.inbox.clear();
        Ok(discarded)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    fn describe(&self) -> &str {
        &self.name
    }
}

type Factory = Box<dyn Fn() -> MockTransport + Send + Sync>;

/// [`Connector`] that hands out mock transports keyed by device address.
#[derive(Default)]
pub struct MockConnector {
    devices: HashMap<String, Factory>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `address` with transports built by `factory`.
    pub fn with_device<F>(mut self, address: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> MockTransport + Send + Sync + 'static,
    {
        self.devices.insert(address.into(), Box::new(factory));
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, config: &DeviceConfig) -> AppResult<Box<dyn Transport>> {
        let address = config.address();
        match self.devices.get(&address) {
            Some(factory) => Ok(Box::new(factory().named(address))),
            None => Err(TransportError::PortUnavailable(address).into()),
        }
    }
}
