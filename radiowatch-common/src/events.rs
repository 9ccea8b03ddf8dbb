//! Event types and event bus for the Radiowatch monitor
//!
//! Provides shared event definitions and the EventBus used to broadcast
//! pipeline milestones to in-process subscribers (dashboard bridge,
//! integration tests). Publishing is fire-and-forget: a failed or missing
//! subscriber never affects pipeline correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Station health as observed by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationHealth {
    Good,
    Degraded,
}

impl StationHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationHealth::Good => "good",
            StationHealth::Degraded => "degraded",
        }
    }
}

/// Radiowatch event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    /// Monitor loop started
    MonitorStarted {
        station_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// One station cycle finished (success or failure)
    StationCycleCompleted {
        station_id: Uuid,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// Music sample no recognition source could identify; carries the
    /// gate's music likelihood as the confidence of that terminal outcome
    MusicUnidentified {
        station_id: Uuid,
        likelihood: f64,
        sample_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    /// A play session opened for a station
    SessionOpened {
        station_id: Uuid,
        track_id: Uuid,
        confidence: f64,
        source: String,
        timestamp: DateTime<Utc>,
    },

    /// A play session was finalized into exactly one Detection
    DetectionFinalized {
        detection_id: Uuid,
        station_id: Uuid,
        track_id: Uuid,
        confidence: f64,
        duration_seconds: i64,
        source: String,
        timestamp: DateTime<Utc>,
    },

    /// Station health transitioned
    StationHealthChanged {
        station_id: Uuid,
        health: StationHealth,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Monitor loop stopped (shutdown complete, open sessions finalized)
    MonitorStopped {
        sessions_finalized: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus for monitor-wide events
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MonitorEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<MonitorEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// The pipeline publishes everything lossily: the event sink is an
    /// observer, never a dependency.
    pub fn emit_lossy(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
