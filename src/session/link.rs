//! The exclusive execution slot of a session.

use crate::catalog::{Catalog, Register, Value};
use crate::codec::{AsciiLine, Framed, Opcode, Protocol};
use crate::config::{DeviceConfig, DeviceKind};
use crate::error::{AppResult, DeviceError};
use crate::retry::{with_verify, RetryPolicy, Verified};
use crate::transport::Transport;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Register name to last value read.
pub type Snapshot = BTreeMap<String, Value>;

/// Register name to per-register outcome.
pub type BatchResult = BTreeMap<String, AppResult<Value>>;

/// A transport and the protocol spoken over it.
///
/// Only the session worker holds a `Link`. Driver code reaches it through
/// [`SessionManager::execute`](super::SessionManager::execute), which runs
/// with the session's queue blocked, so every method here can assume
/// exclusive access to the wire.
pub struct Link {
    kind: DeviceKind,
    transport: Box<dyn Transport>,
    protocol: Protocol,
    writes: Vec<(&'static str, Value)>,
}

impl Link {
    pub(crate) fn new(kind: DeviceKind, config: &DeviceConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            kind,
            transport,
            protocol: Protocol::new(kind, config),
            writes: Vec::new(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn catalog(&self) -> &'static Catalog {
        self.kind.catalog()
    }

    pub(crate) async fn identify(&mut self) -> AppResult<Value> {
        let catalog = self.catalog();
        self.protocol.identify(&mut *self.transport, catalog).await
    }

    pub async fn read(&mut self, name: &str) -> AppResult<Value> {
        let register = self.catalog().for_read(name)?;
        self.read_register(register).await
    }

    pub async fn read_register(&mut self, register: &'static Register) -> AppResult<Value> {
        let value = self.protocol.read(&mut *self.transport, register).await?;
        debug!(register = register.name, %value, "read");
        Ok(value)
    }

    /// Validate against the catalog, then write.
    pub async fn write(&mut self, name: &str, value: &Value) -> AppResult<()> {
        let register = self.catalog().validate_write(name, value)?;
        self.write_register(register, value).await
    }

    /// Write a value the catalog has already accepted.
    pub async fn write_register(&mut self, register: &'static Register, value: &Value) -> AppResult<()> {
        self.protocol
            .write(&mut *self.transport, register, value)
            .await?;
        debug!(register = register.name, %value, "write");
        self.writes.push((register.name, value.clone()));
        Ok(())
    }

    /// Write `value`, read the register back and repeat until they agree.
    pub async fn write_verified(
        &mut self,
        name: &str,
        value: Value,
        policy: &RetryPolicy,
    ) -> AppResult<Verified<Value>> {
        let register = self.catalog().validate_write(name, &value)?;
        let expected = value.as_f64();
        with_verify(
            policy,
            self,
            &value,
            |link| {
                let value = value.clone();
                Box::pin(async move { link.write_register(register, &value).await })
            },
            |link| Box::pin(async move { link.read_register(register).await }),
            |observed| observed.as_f64() == expected,
        )
        .await
    }

    /// Read every readable catalog register. Registers that fail are left out
    /// unless the failure is a hard fault, which is returned.
    pub async fn snapshot(&mut self) -> AppResult<Snapshot> {
        let mut snapshot = Snapshot::new();
        for register in self.catalog().readable() {
            match self.read_register(register).await {
                Ok(value) => {
                    snapshot.insert(register.name.to_string(), value);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(register = register.name, error = %err, "left out of snapshot"),
            }
        }
        Ok(snapshot)
    }

    /// Read each named register. One register failing does not stop the
    /// others, except a hard fault, which every remaining register reports.
    pub async fn batch_read<S: AsRef<str>>(&mut self, names: &[S]) -> BatchResult {
        let mut results = BatchResult::new();
        let mut fault: Option<DeviceError> = None;
        for name in names {
            let name = name.as_ref();
            let result = match &fault {
                Some(err) => Err(err.clone()),
                None => self.read(name).await,
            };
            if let Err(err) = &result {
                if err.is_fatal() {
                    fault = Some(err.clone());
                }
            }
            results.insert(name.to_string(), result);
        }
        results
    }

    /// The framed codec and the transport, for commands that are not
    /// register writes.
    pub fn framed(&mut self) -> AppResult<(&mut Framed, &mut dyn Transport)> {
        let codec = self.protocol.framed()?;
        Ok((codec, &mut *self.transport))
    }

    /// The laser codec and the transport.
    pub fn opcode(&mut self) -> AppResult<(&mut Opcode, &mut dyn Transport)> {
        let codec = self.protocol.opcode()?;
        Ok((codec, &mut *self.transport))
    }

    /// The Alicat codec and the transport.
    pub fn ascii(&mut self) -> AppResult<(&mut AsciiLine, &mut dyn Transport)> {
        let codec = self.protocol.ascii()?;
        Ok((codec, &mut *self.transport))
    }

    pub(crate) fn take_writes(&mut self) -> Vec<(&'static str, Value)> {
        std::mem::take(&mut self.writes)
    }

    /// Hand the device back to local control. Failures are logged only:
    /// the link is about to close either way.
    pub(crate) async fn release(&mut self) {
        if let Err(err) = self.protocol.release(&mut *self.transport).await {
            warn!(port = self.transport.describe(), error = %err, "release failed");
        }
    }

    pub(crate) async fn close(&mut self) {
        if let Err(err) = self.transport.close().await {
            warn!(port = self.transport.describe(), error = %err, "close failed");
        }
    }

    pub fn describe(&self) -> &str {
        self.transport.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, ValidationError};
    use crate::sim::ModbusDevice;
    use crate::transport::mock::FaultSwitch;
    use std::time::Duration;

    fn heater() -> (ModbusDevice, Link) {
        let device = ModbusDevice::rtu(1)
            .with_register(0x0040, 0)
            .with_register(0x0041, 245)
            .with_register(0x0031, 30);
        let config = DeviceKind::Heater
            .config_for("/dev/ttyUSB1")
            .with_response_timeout(Duration::from_millis(50));
        let link = Link::new(DeviceKind::Heater, &config, Box::new(device.transport()));
        (device, link)
    }

    #[tokio::test(start_paused = true)]
    async fn verified_write_reads_back() {
        let (device, mut link) = heater();
        let verified = link
            .write_verified("SV", Value::Integer(300), &RetryPolicy::once())
            .await
            .unwrap();
        assert_eq!(verified.value, Value::Integer(300));
        assert_eq!(device.register(0x0040), Some(300));
        assert_eq!(link.take_writes(), vec![("SV", Value::Integer(300))]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_keeps_going_past_bad_names() {
        let (_device, mut link) = heater();
        let results = link.batch_read(&["PV", "NOPE", "P"]).await;
        assert_eq!(results["PV"], Ok(Value::Integer(245)));
        assert_eq!(
            results["NOPE"],
            Err(ValidationError::UnknownRegister("NOPE".into()).into())
        );
        assert_eq!(results["P"], Ok(Value::Integer(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_stops_on_hard_fault() {
        let device = ModbusDevice::rtu(1).with_register(0x0041, 1);
        let fault = FaultSwitch::default();
        let config = DeviceKind::Heater.config_for("/dev/ttyUSB1");
        let transport = device.transport().with_fault_switch(fault.clone());
        let mut link = Link::new(DeviceKind::Heater, &config, Box::new(transport));
        fault.trip();
        let err = link.snapshot().await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(TransportError::IoFault(_))));
    }
}
