//! Play session tracking
//!
//! Per-station state machine that turns a stream of per-cycle recognition
//! results into at most one finalized Detection per continuous play. A
//! station is either idle or tracking exactly one session; the session map
//! entry is removed atomically with finalization so a session can never be
//! finalized twice.

use crate::db::detections::{self, Detection};
use crate::recognition::RecognizedTrack;
use crate::stats::StatsAggregator;
use chrono::{DateTime, Utc};
use radiowatch_common::events::{EventBus, MonitorEvent};
use radiowatch_common::retry::RetryPolicy;
use radiowatch_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sessions shorter than this are noise; also the provisional duration a
/// session carries until finalized
pub const MIN_PLAY_SECONDS: i64 = 10;
/// Longest duration a single session may claim
pub const MAX_PLAY_SECONDS: i64 = 900;

/// One open play session
#[derive(Debug, Clone)]
struct PlaySession {
    track_id: Uuid,
    detection_id: Uuid,
    started_at: DateTime<Utc>,
    /// Authoritative end time; advances each cycle the same track matches
    end_at: DateTime<Utc>,
    /// Whether any cycle after the opening one matched the same track
    extended: bool,
    confidence: f64,
    source: String,
}

/// Per-station play session tracker
pub struct PlaySessionTracker {
    pool: SqlitePool,
    sessions: Mutex<HashMap<Uuid, PlaySession>>,
    aggregator: StatsAggregator,
    events: EventBus,
    retry: RetryPolicy,
}

impl PlaySessionTracker {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self {
            aggregator: StatsAggregator::new(pool.clone()),
            pool,
            sessions: Mutex::new(HashMap::new()),
            events,
            retry: RetryPolicy::for_database(),
        }
    }

    /// Drive the station's state machine with one cycle's recognition
    /// result. `None` covers no-match, non-music, and fetch failure alike.
    ///
    /// Returns the Detection finalized by this observation, if any. The
    /// orchestrator never runs two cycles for one station concurrently;
    /// the internal lock only guards the map itself.
    pub async fn observe(
        &self,
        station_id: Uuid,
        observed: Option<&RecognizedTrack>,
        at: DateTime<Utc>,
    ) -> Result<Option<Detection>> {
        let current = {
            let mut sessions = self.sessions.lock().await;
            if let (Some(session), Some(observed)) = (sessions.get_mut(&station_id), observed) {
                // Same track still playing: advance the authoritative end
                if session.track_id == observed.track_id {
                    session.end_at = at;
                    session.extended = true;
                    tracing::debug!(
                        station_id = %station_id,
                        track_id = %observed.track_id,
                        "Session extended"
                    );
                    return Ok(None);
                }
            }
            // Track change or end of play: take the session out before any
            // I/O so it cannot be finalized twice
            sessions.remove(&station_id)
        };

        if current.is_none() && observed.is_none() {
            return Ok(None);
        }

        let mut finalized = None;
        if let Some(session) = current {
            finalized = self.finalize_session(station_id, session, at).await?;
        }

        if let Some(observed) = observed {
            self.open_session(station_id, observed, at).await?;
        }

        Ok(finalized)
    }

    async fn open_session(
        &self,
        station_id: Uuid,
        observed: &RecognizedTrack,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let detection = Detection {
            id: Uuid::new_v4(),
            track_id: observed.track_id,
            station_id,
            detected_at: at,
            confidence: observed.confidence,
            duration_seconds: MIN_PLAY_SECONDS,
            source: observed.source.to_string(),
        };

        // Provisional row; survives as-is if the station is never heard
        // from again
        self.retry
            .run("provisional detection insert", || async {
                detections::create_detection(&self.pool, &detection)
                    .await
                    .map_err(Error::from_store)
            })
            .await?;

        let session = PlaySession {
            track_id: observed.track_id,
            detection_id: detection.id,
            started_at: at,
            end_at: at,
            extended: false,
            confidence: observed.confidence,
            source: observed.source.to_string(),
        };
        self.sessions.lock().await.insert(station_id, session);

        tracing::info!(
            station_id = %station_id,
            track_id = %observed.track_id,
            source = observed.source,
            confidence = observed.confidence,
            "Play session opened"
        );
        self.events.emit_lossy(MonitorEvent::SessionOpened {
            station_id,
            track_id: observed.track_id,
            confidence: observed.confidence,
            source: observed.source.to_string(),
            timestamp: at,
        });

        Ok(())
    }

    /// Close a session: validate its duration, write the one-time duration
    /// correction, and fold the detection into the aggregates.
    ///
    /// If the duration write fails the session is restored so a later cycle
    /// retries the finalize; aggregate failures after the write are logged
    /// but not retried through this path (the detection row is already
    /// authoritative and must not be folded twice).
    async fn finalize_session(
        &self,
        station_id: Uuid,
        session: PlaySession,
        at: DateTime<Utc>,
    ) -> Result<Option<Detection>> {
        let raw_seconds = (session.end_at - session.started_at).num_seconds();

        let duration_seconds = if !session.extended {
            // Single-cycle session: the provisional duration stands
            MIN_PLAY_SECONDS
        } else if raw_seconds < MIN_PLAY_SECONDS {
            // Noise (rapid track flapping): drop the provisional detection
            tracing::debug!(
                station_id = %station_id,
                track_id = %session.track_id,
                raw_seconds,
                "Session below minimum duration, discarding as noise"
            );
            let pool = &self.pool;
            let detection_id = session.detection_id;
            if let Err(e) = self
                .retry
                .run("provisional detection delete", || async move {
                    detections::delete_detection(pool, detection_id)
                        .await
                        .map_err(Error::from_store)
                })
                .await
            {
                self.sessions.lock().await.insert(station_id, session);
                return Err(e);
            }
            return Ok(None);
        } else if raw_seconds > MAX_PLAY_SECONDS {
            tracing::warn!(
                station_id = %station_id,
                track_id = %session.track_id,
                raw_seconds,
                capped = MAX_PLAY_SECONDS,
                "Session exceeded maximum duration, capping"
            );
            MAX_PLAY_SECONDS
        } else {
            raw_seconds
        };

        let write = {
            let pool = &self.pool;
            let detection_id = session.detection_id;
            self.retry
                .run("detection duration write", || async move {
                    detections::update_detection_duration(pool, detection_id, duration_seconds)
                        .await
                        .map_err(Error::from_store)
                })
                .await
        };
        if let Err(e) = write {
            // Keep the session open so the next cycle retries the finalize
            self.sessions.lock().await.insert(station_id, session);
            return Err(e);
        }

        let detection = Detection {
            id: session.detection_id,
            track_id: session.track_id,
            station_id,
            detected_at: session.started_at,
            confidence: session.confidence,
            duration_seconds,
            source: session.source.clone(),
        };

        if let Err(e) = self.aggregator.apply(&detection).await {
            tracing::error!(
                detection_id = %detection.id,
                error = %e,
                "Failed to fold finalized detection into aggregates"
            );
        }

        tracing::info!(
            station_id = %station_id,
            track_id = %detection.track_id,
            duration_seconds,
            confidence = detection.confidence,
            source = %detection.source,
            ended_at = %at,
            "Play session finalized"
        );
        self.events.emit_lossy(MonitorEvent::DetectionFinalized {
            detection_id: detection.id,
            station_id,
            track_id: detection.track_id,
            confidence: detection.confidence,
            duration_seconds,
            source: detection.source.clone(),
            timestamp: at,
        });

        Ok(Some(detection))
    }

    /// Best-effort finalize of every open session (shutdown path, treated
    /// like a fetch failure per station). Returns how many finalized.
    pub async fn finalize_all(&self, at: DateTime<Utc>) -> usize {
        let drained: Vec<(Uuid, PlaySession)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().collect()
        };

        let mut finalized = 0;
        for (station_id, session) in drained {
            match self.finalize_session(station_id, session, at).await {
                Ok(Some(_)) => finalized += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        station_id = %station_id,
                        error = %e,
                        "Failed to finalize session during shutdown"
                    );
                }
            }
        }
        finalized
    }

    /// Whether the station currently has an open session
    pub async fn has_session(&self, station_id: Uuid) -> bool {
        self.sessions.lock().await.contains_key(&station_id)
    }

    /// Number of open sessions
    pub async fn open_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
