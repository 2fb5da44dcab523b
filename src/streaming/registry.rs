//! Process-wide table of active streaming sessions.
//!
//! The registry is the single synchronized structure shared between
//! connection tasks: insert on session start, remove on end, lookup by id
//! for external cancellation. Admission is bounded; requests beyond the cap
//! are rejected immediately rather than queued.

use crate::events::{EventBus, SessionEvent};
use crate::streaming::SessionError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a session delivers bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Passthrough,
    Transcode,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Passthrough => write!(f, "passthrough"),
            DeliveryMode::Transcode => write!(f, "transcode"),
        }
    }
}

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initialized,
    Planning,
    Streaming,
    Completed,
    Aborted,
}

/// Terminal result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Aborted,
}

#[derive(Debug)]
struct ActiveSession {
    path: PathBuf,
    started_at: DateTime<Utc>,
    state: SessionState,
    mode: Option<DeliveryMode>,
    cancel: CancellationToken,
}

/// Read-only view of one active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub path: String,
    pub state: SessionState,
    pub mode: Option<DeliveryMode>,
    pub started_at: DateTime<Utc>,
}

/// Lock-guarded table of active sessions, keyed by session id.
///
/// Constructed once at server startup and passed explicitly to the
/// components that need it; there is no ambient singleton.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, ActiveSession>,
    active: AtomicUsize,
    max_sessions: usize,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, events: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            active: AtomicUsize::new(0),
            max_sessions,
            events,
        }
    }

    /// Admit a new session, or reject immediately when the cap is reached.
    /// Admission happens before any probing or process spawn.
    pub fn register(self: &Arc<Self>, path: &Path) -> Result<SessionGuard, SessionError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .map_err(|_| SessionError::ConcurrencyLimitExceeded)?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        self.sessions.insert(
            id,
            ActiveSession {
                path: path.to_path_buf(),
                started_at: now,
                state: SessionState::Initialized,
                mode: None,
                cancel: cancel.clone(),
            },
        );

        tracing::info!(session_id = %id, path = %path.display(), "Session registered");
        self.events.emit(SessionEvent::SessionStarted {
            session_id: id,
            path: path.display().to_string(),
            at: now,
        });

        Ok(SessionGuard {
            registry: Arc::clone(self),
            id,
            token: cancel,
            mode: None,
            outcome: SessionOutcome::Aborted,
            bytes_sent: 0,
        })
    }

    /// Trip a session's cancellation token. Returns false when the id is
    /// not (or no longer) registered.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                tracing::info!(session_id = %id, "Session cancellation requested");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<SessionSnapshot> {
        self.sessions.get(&id).map(|s| snapshot(id, &s))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| snapshot(*entry.key(), entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn set_state(&self, id: Uuid, state: SessionState) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.state = state;
        }
    }

    fn set_mode(&self, id: Uuid, mode: DeliveryMode) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.mode = Some(mode);
        }
    }

    fn finish(
        &self,
        id: Uuid,
        mode: Option<DeliveryMode>,
        outcome: SessionOutcome,
        bytes_sent: u64,
    ) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            let duration = (Utc::now() - session.started_at).num_seconds();
            tracing::info!(
                session_id = %id,
                path = %session.path.display(),
                ?outcome,
                bytes_sent,
                duration_secs = duration,
                "Session ended"
            );
            self.events.emit(SessionEvent::SessionEnded {
                session_id: id,
                path: session.path.display().to_string(),
                mode,
                outcome,
                bytes_sent,
                at: Utc::now(),
            });
        }
    }
}

fn snapshot(id: Uuid, session: &ActiveSession) -> SessionSnapshot {
    SessionSnapshot {
        id,
        path: session.path.display().to_string(),
        state: session.state,
        mode: session.mode,
        started_at: session.started_at,
    }
}

/// Owning handle for one registry entry.
///
/// Dropping the guard removes the session from the registry and emits the
/// end event; a session that never reports completion counts as aborted.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: Uuid,
    token: CancellationToken,
    mode: Option<DeliveryMode>,
    outcome: SessionOutcome,
    bytes_sent: u64,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn set_planning(&self) {
        self.registry.set_state(self.id, SessionState::Planning);
    }

    pub fn set_streaming(&mut self, mode: DeliveryMode) {
        self.mode = Some(mode);
        self.registry.set_mode(self.id, mode);
        self.registry.set_state(self.id, SessionState::Streaming);
    }

    pub fn set_completed(&mut self) {
        self.outcome = SessionOutcome::Completed;
        self.registry.set_state(self.id, SessionState::Completed);
    }

    pub fn add_bytes(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .finish(self.id, self.mode, self.outcome, self.bytes_sent);
    }
}
