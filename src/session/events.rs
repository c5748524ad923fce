//! Connection events and their fan-out.

use super::{SessionId, Snapshot, State};
use crate::catalog::Value;
use crate::config::DeviceKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Events buffered per subscriber before the slowest one starts missing them.
pub const EVENT_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    WriteCompleted { register: String, value: Value },
}

/// Everything a connection log or a UI needs to record one transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub session: SessionId,
    /// Device label.
    pub device: String,
    pub kind: DeviceKind,
    pub address: String,
    pub event: EventKind,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What a callback subscription is handed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery<'a> {
    Event(&'a ConnectionEvent),
    /// The subscriber fell behind; this many events were dropped unseen.
    ///
    /// Dropped events cannot be attributed to a session, so every
    /// subscription is told, whatever its filter.
    Missed(u64),
}

impl<'a> Delivery<'a> {
    pub fn event(self) -> Option<&'a ConnectionEvent> {
        match self {
            Delivery::Event(event) => Some(event),
            Delivery::Missed(_) => None,
        }
    }
}

/// Broadcast channel carrying every session's events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    /// A bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ConnectionEvent) {
        trace!(session = %event.session, state = %event.state, "event");
        // No receivers is not an error: nobody subscribed yet.
        let _ = self.sender.send(event);
    }

    pub fn receiver(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Invoke `callback` for each event `filter` accepts, on a background
    /// task, until the returned [`Subscription`] is dropped. A callback too
    /// slow to keep up is handed [`Delivery::Missed`] with the number of
    /// events it lost, then resumes with the oldest event still buffered.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<P, F>(&self, filter: P, mut callback: F) -> Subscription
    where
        P: Fn(&ConnectionEvent) -> bool + Send + 'static,
        F: FnMut(Delivery<'_>) + Send + 'static,
    {
        let mut receiver = self.receiver();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if filter(&event) => callback(Delivery::Event(&event)),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscriber fell behind, events dropped");
                        callback(Delivery::Missed(missed));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

/// Keeps a callback subscription alive.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
