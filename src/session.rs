use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{
    BackendConnector, BackendError, BackendEvent, BackendHandle, BackendTarget, SocketCounter,
};

/// Display-only session identifier sent to the client once after connect.
///
/// Not guaranteed unique with the random strategy; nothing server-side keys
/// on it.
pub type SessionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// True if `msg`, trimmed and compared case-insensitively, is a non-empty
/// prefix of `quit` ("q", "qu", "QUI", " quit ").
pub fn is_quit_command(msg: &str) -> bool {
    let trimmed = msg.trim();
    !trimmed.is_empty() && "quit".starts_with(trimmed.to_ascii_lowercase().as_str())
}

/// How session identifiers are drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Uniform draw from the configured range. Collisions between live
    /// sessions are possible.
    #[default]
    Random,
    /// Counter starting at the low end of the range, wrapping at the top.
    Sequential,
}

pub struct SessionIds {
    strategy: IdStrategy,
    range: RangeInclusive<u32>,
    next: AtomicU32,
}

impl SessionIds {
    pub fn new(strategy: IdStrategy, range: RangeInclusive<u32>) -> Self {
        Self {
            strategy,
            range,
            next: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> SessionId {
        match self.strategy {
            IdStrategy::Random => rand::thread_rng().gen_range(self.range.clone()),
            IdStrategy::Sequential => {
                let start = *self.range.start();
                let span = u64::from(self.range.end().saturating_sub(start)) + 1;
                let n = u64::from(self.next.fetch_add(1, Ordering::Relaxed));
                start + (n % span) as u32
            }
        }
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new(IdStrategy::Random, 0..=100)
    }
}

/// Registry view of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached ({0})")]
    MaxSessionsReached(usize),
}

struct RegistryInner {
    sessions: HashMap<u64, SessionInfo>,
    next_key: u64,
}

/// Live sessions, keyed by an internal connection key that is unique for the
/// life of the process.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    max_sessions: Option<usize>,
    sockets: SocketCounter,
}

impl SessionRegistry {
    const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_key: 0,
            })),
            max_sessions,
            sockets: SocketCounter::new(),
        }
    }

    /// Reserve a registry entry for a new session in the `Connecting` state.
    ///
    /// The entry is removed when the returned slot is dropped.
    pub fn admit(&self, id: SessionId) -> Result<SessionSlot, RegistryError> {
        let mut inner = self.inner.write();
        if let Some(max) = self.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached(max));
            }
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.sessions.insert(
            key,
            SessionInfo {
                id,
                state: SessionState::Connecting,
            },
        );
        drop(inner);

        Ok(SessionSlot {
            key,
            id,
            registry: self.clone(),
        })
    }

    fn set_state(&self, key: u64, state: SessionState) {
        if let Some(info) = self.inner.write().sessions.get_mut(&key) {
            info.state = state;
        }
    }

    fn remove(&self, key: u64) {
        self.inner.write().sessions.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sessions in admission order.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<(u64, SessionInfo)> = self
            .inner
            .read()
            .sessions
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        sessions.sort_by_key(|(k, _)| *k);
        sessions.into_iter().map(|(_, v)| v).collect()
    }

    /// Backend sockets currently open across all sessions.
    pub fn sockets(&self) -> &SocketCounter {
        &self.sockets
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved registry entry. Dropping it removes the entry.
pub struct SessionSlot {
    key: u64,
    id: SessionId,
    registry: SessionRegistry,
}

impl SessionSlot {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}

/// One relayed session: its identifier, lifecycle state, and the backend
/// socket it exclusively owns.
pub struct Session {
    slot: SessionSlot,
    state: SessionState,
    backend: BackendHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.slot.id)
            .field("key", &self.slot.key)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open the backend connection for a freshly admitted session.
    pub fn open(
        slot: SessionSlot,
        target: BackendTarget,
    ) -> (Self, mpsc::Receiver<BackendEvent>) {
        let sockets = slot.registry.sockets().clone();
        let (backend, events) = BackendConnector::connect(target, sockets);
        let session = Session {
            slot,
            state: SessionState::Connecting,
            backend,
        };
        (session, events)
    }

    pub fn id(&self) -> SessionId {
        self.slot.id
    }

    pub fn key(&self) -> u64 {
        self.slot.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::trace!(session = self.id(), from = ?self.state, to = ?next, "ignored state transition");
            return false;
        }
        tracing::debug!(session = self.id(), from = ?self.state, to = ?next, "session state");
        self.state = next;
        self.slot.registry.set_state(self.slot.key, next);
        true
    }

    /// Queue a client command for the backend as one line.
    pub fn forward_command(&self, command: &str) -> Result<(), BackendError> {
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        self.backend.write(Bytes::from(line))
    }

    /// Close the backend socket and finish the session. Idempotent.
    pub fn close(&mut self) {
        self.backend.close();
        if matches!(self.state, SessionState::Connecting | SessionState::Active) {
            self.transition(SessionState::Closing);
        }
        if self.state == SessionState::Closing {
            self.transition(SessionState::Closed);
        }
    }
}
