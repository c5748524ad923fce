//! Session registry and the public device API.

use super::events::{ConnectionEvent, Delivery, EventBus, Subscription};
use super::link::{BatchResult, Link, Snapshot};
use super::worker::{Command, Control, Reporter, Worker};
use super::{Connector, SessionId, SessionSettings, State, SystemConnector};
use crate::catalog::{Catalog, Register, Value};
use crate::config::{DeviceConfig, DeviceKind};
use crate::error::{AppResult, DeviceError, SessionError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Result of a successful [`SessionManager::connect`].
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub id: SessionId,
    /// Every readable catalog register, read once after the device identifies itself.
    pub snapshot: Snapshot,
}

/// Identity of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: DeviceKind,
    pub label: String,
    pub address: String,
    pub state: State,
}

/// Sending side of one session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    kind: DeviceKind,
    label: String,
    address: String,
    commands: mpsc::Sender<Command>,
    control: mpsc::Sender<Control>,
    state: watch::Receiver<State>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn catalog(&self) -> &'static Catalog {
        self.kind.catalog()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            label: self.label.clone(),
            address: self.address.clone(),
            state: self.state(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state(), State::Connecting | State::Connected)
    }

    async fn submit<T>(
        &self,
        (command, reply): (Command, oneshot::Receiver<AppResult<T>>),
    ) -> AppResult<T> {
        if self.state() != State::Connected {
            return Err(SessionError::NotConnected.into());
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| DeviceError::from(SessionError::NotConnected))?;
        reply
            .await
            .map_err(|_| DeviceError::from(SessionError::QueueCancelled))?
    }

    pub async fn read(&self, register: &'static Register) -> AppResult<Value> {
        self.submit(Command::read(register)).await
    }

    pub async fn write(&self, register: &'static Register, value: Value) -> AppResult<()> {
        self.submit(Command::write(register, value)).await
    }

    pub async fn batch_read(&self, names: Vec<String>) -> AppResult<BatchResult> {
        self.submit(Command::batch_read(names)).await
    }

    pub async fn execute<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        self.submit(Command::execute(f)).await
    }
}

/// Owns every session and hands out ids.
///
/// Cloning is cheap; clones share the registry and the event bus.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    /// Addresses with a connect in progress.
    pending: Arc<Mutex<HashSet<String>>>,
    connector: Arc<dyn Connector>,
    events: EventBus,
    settings: SessionSettings,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SystemConnector)
    }
}

/// Releases an address reservation when a connect attempt ends.
struct Reservation {
    pending: Arc<Mutex<HashSet<String>>>,
    address: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.address);
    }
}

impl SessionManager {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            connector: Arc::new(connector),
            events: EventBus::new(),
            settings: SessionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Open a session: validate, open the transport, settle, identify, snapshot.
    ///
    /// On failure the transport is closed, a `Faulted` event is published and
    /// the error is returned; nothing is registered.
    #[instrument(skip(self, config), fields(address = %config.address()))]
    pub async fn connect(&self, kind: DeviceKind, config: DeviceConfig) -> AppResult<Connected> {
        config.validate(kind)?;
        let address = config.address();
        let _reservation = self.reserve(&address)?;

        let id = SessionId::new();
        let (reporter, state) = Reporter::new(
            id,
            config.display_name(),
            kind,
            address.clone(),
            self.events.clone(),
        );
        reporter.transition(State::Connecting, None, None);

        let transport = match self.connector.open(&config).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(error = %err, "open failed");
                reporter.transition(State::Faulted, None, Some(&err));
                return Err(err);
            }
        };

        let settle = config.settle_for(kind);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let mut link = Link::new(kind, &config, transport);
        let snapshot = match Self::verify(&mut link).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "verification failed");
                link.close().await;
                reporter.transition(State::Faulted, None, Some(&err));
                return Err(err);
            }
        };

        let (command_tx, command_rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(1);
        let handle = SessionHandle {
            id,
            kind,
            label: reporter.device.clone(),
            address,
            commands: command_tx,
            control: control_tx,
            state,
            task: Arc::new(Mutex::new(None)),
        };
        reporter.transition(State::Connected, Some(snapshot.clone()), None);

        let task = tokio::spawn(Worker::new(link, command_rx, control_rx, reporter).run());
        *handle.task.lock() = Some(task);
        self.sessions.lock().insert(id, handle);

        info!(session = %id, %kind, registers = snapshot.len(), "connected");
        Ok(Connected { id, snapshot })
    }

    async fn verify(link: &mut Link) -> AppResult<Snapshot> {
        let identity = link.identify().await?;
        info!(%identity, "device answered");
        link.snapshot().await
    }

    fn reserve(&self, address: &str) -> AppResult<Reservation> {
        let taken = self
            .sessions
            .lock()
            .values()
            .any(|h| h.address == address && h.is_live());
        if taken || !self.pending.lock().insert(address.to_string()) {
            return Err(SessionError::AlreadyConnected(address.to_string()).into());
        }
        Ok(Reservation {
            pending: self.pending.clone(),
            address: address.to_string(),
        })
    }

    /// Cancel queued work, wait for the in-flight command, close the port.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, id: SessionId) -> AppResult<()> {
        let handle = self
            .sessions
            .lock()
            .remove(&id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle
            .control
            .send(Control::Disconnect { ack: ack_tx })
            .await
            .is_err()
        {
            // Worker already gone (faulted).
            return Ok(());
        }
        match tokio::time::timeout(self.settings.shutdown_timeout, ack_rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(session = %id, "in-flight command did not finish, aborting worker");
                if let Some(task) = handle.task.lock().take() {
                    task.abort();
                }
                Ok(())
            }
        }
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.lock().keys().copied().collect();
        for id in ids {
            if let Err(err) = self.disconnect(id).await {
                warn!(session = %id, error = %err, "disconnect failed");
            }
        }
    }

    pub fn handle(&self, id: SessionId) -> AppResult<SessionHandle> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()).into())
    }

    pub fn state(&self, id: SessionId) -> AppResult<State> {
        Ok(self.handle(id)?.state())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.lock().values().map(SessionHandle::info).collect();
        sessions.sort_by(|a, b| a.label.cmp(&b.label));
        sessions
    }

    pub fn describe_register(&self, id: SessionId, name: &str) -> AppResult<&'static Register> {
        self.handle(id)?.catalog().get(name)
    }

    #[instrument(skip(self))]
    pub async fn read_register(&self, id: SessionId, name: &str) -> AppResult<Value> {
        let handle = self.handle(id)?;
        let register = handle.catalog().for_read(name)?;
        handle.read(register).await
    }

    /// Validated locally first: a rejected value never reaches the wire.
    #[instrument(skip(self))]
    pub async fn write_register(&self, id: SessionId, name: &str, value: Value) -> AppResult<()> {
        let handle = self.handle(id)?;
        let register = handle.catalog().validate_write(name, &value)?;
        handle.write(register, value).await
    }

    /// Per-register outcomes; one failing register does not fail the batch.
    #[instrument(skip(self, names))]
    pub async fn batch_read<S: AsRef<str>>(&self, id: SessionId, names: &[S]) -> AppResult<BatchResult> {
        let names = names.iter().map(|n| n.as_ref().to_string()).collect();
        self.handle(id)?.batch_read(names).await
    }

    /// Run a compound operation with exclusive use of the session's link.
    pub async fn execute<T, F>(&self, id: SessionId, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        self.handle(id)?.execute(f).await
    }

    /// Call `callback` with every event of session `id`, and with
    /// [`Delivery::Missed`] whenever it falls too far behind the bus.
    pub fn subscribe<F>(&self, id: SessionId, callback: F) -> Subscription
    where
        F: FnMut(Delivery<'_>) + Send + 'static,
    {
        self.events.subscribe(move |e| e.session == id, callback)
    }

    /// Events of every session, including failed connect attempts.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ModbusDevice;
    use crate::transport::mock::MockConnector;
    use std::time::Duration;

    fn ultrasonic() -> (ModbusDevice, SessionManager, DeviceConfig) {
        let device = ModbusDevice::rtu(1)
            .with_register(0x0001, 0)
            .with_register(0x0003, 0)
            .with_register(0x0029, 4)
            .mirror(0x0001, 0x0003);
        let sim = device.clone();
        let connector = MockConnector::new().with_device("/dev/ttyUSB3", move || sim.transport());
        let config = DeviceKind::Ultrasonic
            .config_for("/dev/ttyUSB3")
            .with_response_timeout(Duration::from_millis(50));
        (device, SessionManager::new(connector), config)
    }

    #[tokio::test]
    async fn second_connect_to_the_same_port_is_refused() {
        let (_device, manager, config) = ultrasonic();
        let first = manager.connect(DeviceKind::Ultrasonic, config.clone()).await.unwrap();
        let err = manager.connect(DeviceKind::Ultrasonic, config).await.unwrap_err();
        assert_eq!(err, SessionError::AlreadyConnected("/dev/ttyUSB3".into()).into());
        manager.disconnect(first.id).await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_after_disconnect() {
        let (_device, manager, config) = ultrasonic();
        let first = manager.connect(DeviceKind::Ultrasonic, config.clone()).await.unwrap();
        manager.disconnect(first.id).await.unwrap();
        assert!(manager.state(first.id).is_err());
        let second = manager.connect(DeviceKind::Ultrasonic, config).await.unwrap();
        assert_eq!(manager.state(second.id).unwrap(), State::Connected);
        assert_eq!(manager.sessions().len(), 1);
    }

    #[tokio::test]
    async fn read_only_registers_cannot_be_written() {
        let (device, manager, config) = ultrasonic();
        let session = manager.connect(DeviceKind::Ultrasonic, config).await.unwrap();
        let before = device.request_count();
        let err = manager
            .write_register(session.id, "STATUS", Value::Integer(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        assert_eq!(device.request_count(), before);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_opening() {
        let (_device, manager, config) = ultrasonic();
        let mut events = manager.subscribe_all();
        let err = manager
            .connect(DeviceKind::Ultrasonic, config.with_slave_id(0))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        assert!(events.try_recv().is_err());
    }
}
