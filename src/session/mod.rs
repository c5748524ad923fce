//! Per-device sessions.
//!
//! A session is one Tokio task that exclusively owns a device's transport and
//! protocol codec. Callers never touch the transport: they submit commands
//! through a bounded mpsc queue and await the result on a oneshot channel.
//! The worker runs commands strictly one at a time in submission order, so
//! bytes of two exchanges can never interleave on the wire, while sessions
//! of different devices proceed in parallel.
//!
//! ```text
//! caller ──Command──▶ mpsc ──▶ worker ──▶ Link { transport, protocol }
//!    ▲                            │
//!    └──────── oneshot ◀──────────┘
//! ```
//!
//! Compound driver operations (write then verify, laser beam off/on around a
//! frequency change) run as a single [`SessionManager::execute`] job that
//! receives `&mut Link`, so nothing can be queued between their steps.
//!
//! ## States
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnecting → Disconnected
//!                     │            │
//!                     └──▶ Faulted ◀┘
//! ```

mod events;
mod link;
mod manager;
mod worker;

pub use events::{ConnectionEvent, Delivery, EventBus, EventKind, Subscription, EVENT_CAPACITY};
pub use link::{BatchResult, Link, Snapshot};
pub use manager::{Connected, SessionHandle, SessionInfo, SessionManager};

use crate::config::DeviceConfig;
use crate::error::{AppResult, SessionError};
use crate::transport::{self, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Identifier handed out by [`SessionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SessionError::UnknownSession(s.to_string()))
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The transport failed hard; the session must be connected again.
    Faulted,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Disconnecting => "disconnecting",
            State::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Tuning shared by every session of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Commands that may wait in one session's queue.
    pub queue_capacity: usize,
    /// How long `disconnect` waits for the in-flight command before aborting
    /// the worker.
    pub shutdown_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens transports for new sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &DeviceConfig) -> AppResult<Box<dyn Transport>>;
}

/// Opens real serial ports and TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    async fn open(&self, config: &DeviceConfig) -> AppResult<Box<dyn Transport>> {
        transport::open(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_round_trip_through_text() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!(
            "not-a-session".parse::<SessionId>(),
            Err(SessionError::UnknownSession("not-a-session".into()))
        );
    }

    #[test]
    fn states_serialize_in_snake_case() {
        assert_eq!(serde_json::to_string(&State::Faulted).unwrap(), "\"faulted\"");
        assert_eq!(State::Disconnecting.to_string(), "disconnecting");
    }
}
