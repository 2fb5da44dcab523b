//! Session lifecycle events for observability.
//!
//! Fire-and-forget: emitting never blocks the data path, and a send with no
//! subscribers is not an error.

use crate::streaming::{DeliveryMode, SessionOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A session lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        path: String,
        at: DateTime<Utc>,
    },
    SessionEnded {
        session_id: Uuid,
        path: String,
        mode: Option<DeliveryMode>,
        outcome: SessionOutcome,
        bytes_sent: u64,
        at: DateTime<Utc>,
    },
}

/// Broadcast channel for session events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event; dropped silently when nobody is listening.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for session event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
