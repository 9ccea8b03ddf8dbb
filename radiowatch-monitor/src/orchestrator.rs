//! Station orchestration
//!
//! Owns the bounded worker pool and drives the full pipeline for every
//! active station each polling round: fetch, gate, recognize, track the
//! session, aggregate. Two semaphores bound the work: one caps concurrent
//! station cycles, a tighter one caps the memory-heavy decode and feature
//! extraction stages. A station is never scheduled while its previous
//! cycle is still running.

use crate::analysis::{decode_sample, FeatureGate};
use crate::config::MonitorConfig;
use crate::db::detections;
use crate::db::stations::{self, Station};
use crate::fetch::StreamFetcher;
use crate::recognition::{
    AudioIdClient, AudioSample, LocalStore, MetadataIdClient, RecognitionCascade,
    RecognitionProvider,
};
use crate::session::PlaySessionTracker;
use crate::stats::StatsAggregator;
use chrono::{Duration as ChronoDuration, Utc};
use radiowatch_common::events::{EventBus, MonitorEvent, StationHealth};
use radiowatch_common::retry::RetryPolicy;
use radiowatch_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Top-level monitor coordinator
pub struct StationOrchestrator {
    pool: SqlitePool,
    config: MonitorConfig,
    fetcher: StreamFetcher,
    cascade: RecognitionCascade,
    tracker: PlaySessionTracker,
    aggregator: StatsAggregator,
    events: EventBus,
    station_permits: Arc<Semaphore>,
    analysis_permits: Arc<Semaphore>,
    /// Stations with a cycle currently running; prevents overlapping cycles
    /// for one station
    in_flight: Mutex<HashSet<Uuid>>,
    /// Consecutive failed cycles per station
    failures: Mutex<HashMap<Uuid, u32>>,
    cancel: CancellationToken,
}

impl StationOrchestrator {
    pub fn new(
        pool: SqlitePool,
        config: MonitorConfig,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let fetcher = StreamFetcher::new(
            config.fetch_timeout(),
            config.max_sample_bytes,
            RetryPolicy::default(),
        )?;

        let mut providers: Vec<Box<dyn RecognitionProvider>> =
            vec![Box::new(LocalStore::new(pool.clone()))];
        match &config.audio_id_api_key {
            Some(key) => providers.push(Box::new(AudioIdClient::new(
                key.clone(),
                config.provider_timeout(),
            )?)),
            None => {
                tracing::warn!("No acoustic-ID API key configured, skipping that source");
            }
        }
        if config.metadata_id_enabled {
            providers.push(Box::new(MetadataIdClient::new(config.provider_timeout())?));
        }
        let cascade = RecognitionCascade::new(pool.clone(), providers);

        let station_permits = Arc::new(Semaphore::new(config.station_concurrency));
        let analysis_permits = Arc::new(Semaphore::new(config.analysis_concurrency));

        Ok(Arc::new(Self {
            fetcher,
            cascade,
            tracker: PlaySessionTracker::new(pool.clone(), events.clone()),
            aggregator: StatsAggregator::new(pool.clone()),
            pool,
            config,
            events,
            station_permits,
            analysis_permits,
            in_flight: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            cancel,
        }))
    }

    /// Main monitor loop: schedule a round per poll tick until cancelled,
    /// then drain in-flight cycles and finalize open sessions.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let stations = self.active_stations().await?;
        tracing::info!(
            station_count = stations.len(),
            station_concurrency = self.config.station_concurrency,
            analysis_concurrency = self.config.analysis_concurrency,
            "Monitor started"
        );
        self.events.emit_lossy(MonitorEvent::MonitorStarted {
            station_count: stations.len(),
            timestamp: Utc::now(),
        });

        let mut poll = tokio::time::interval(self.config.poll_interval());
        let mut recompute = tokio::time::interval(std::time::Duration::from_secs(
            self.config.recompute_interval_hours.max(1) * 3600,
        ));
        recompute.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = poll.tick() => {
                    self.schedule_round().await;
                }
                _ = recompute.tick(), if self.config.recompute_interval_hours > 0 => {
                    self.reconcile_aggregates().await;
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutdown requested, draining in-flight cycles");

        // All permits held back means every spawned cycle has finished
        let _drain = self
            .station_permits
            .acquire_many(self.config.station_concurrency as u32)
            .await
            .map_err(|_| Error::Internal("station semaphore closed".to_string()))?;

        let finalized = self.tracker.finalize_all(Utc::now()).await;
        tracing::info!(sessions_finalized = finalized, "Monitor stopped");
        self.events.emit_lossy(MonitorEvent::MonitorStopped {
            sessions_finalized: finalized,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Read-only station snapshot for one round
    async fn active_stations(&self) -> Result<Vec<Station>> {
        RetryPolicy::for_database()
            .run("active station list", || async {
                stations::list_active_stations(&self.pool)
                    .await
                    .map_err(Error::from_store)
            })
            .await
    }

    /// Spawn one cycle task per active station not already in flight
    async fn schedule_round(self: &Arc<Self>) {
        let snapshot = match self.active_stations().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load station list, skipping round");
                return;
            }
        };

        for station in snapshot {
            if self.cancel.is_cancelled() {
                return;
            }

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(station.id) {
                    tracing::debug!(
                        station_id = %station.id,
                        "Previous cycle still running, skipping station"
                    );
                    continue;
                }
            }

            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.station_task(station).await;
            });
        }
    }

    /// One complete station cycle, permit-bounded. The permit and the
    /// in-flight entry are released on every exit path.
    async fn station_task(self: Arc<Self>, station: Station) {
        let permit = match Arc::clone(&self.station_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.in_flight.lock().await.remove(&station.id);
                return;
            }
        };

        // The shutdown drain may hand this permit back after open sessions
        // were already finalized; no new cycle may start then
        if self.cancel.is_cancelled() {
            drop(permit);
            self.in_flight.lock().await.remove(&station.id);
            return;
        }

        let station_id = station.id;
        let result = self.run_cycle(&station).await;
        let success = result.is_ok();

        if let Err(e) = &result {
            tracing::warn!(
                station_id = %station_id,
                station = %station.name,
                error = %e,
                "Station cycle failed"
            );
            // A failed cycle ends whatever was playing
            if let Err(e) = self.tracker.observe(station_id, None, Utc::now()).await {
                tracing::error!(
                    station_id = %station_id,
                    error = %e,
                    "Failed to finalize session after cycle failure"
                );
            }
        }

        self.update_station_health(&station, success).await;
        self.events.emit_lossy(MonitorEvent::StationCycleCompleted {
            station_id,
            success,
            timestamp: Utc::now(),
        });

        self.in_flight.lock().await.remove(&station_id);
        drop(permit);
    }

    /// Fetch, gate, recognize and observe one sample for one station
    async fn run_cycle(&self, station: &Station) -> Result<()> {
        let now = Utc::now();
        if let Err(e) = stations::touch_station_checked(&self.pool, station.id, now).await {
            tracing::warn!(station_id = %station.id, error = %e, "Failed to stamp check time");
        }

        // Degraded stations get a cheap reachability probe before the full
        // fetch (the reconnection path)
        if station.health == StationHealth::Degraded {
            let health = self.fetcher.probe(&station.stream_url).await?;
            if !health.is_healthy() {
                return Err(Error::Fetch(format!(
                    "probe unhealthy: status {} content-type {:?}",
                    health.status, health.content_type
                )));
            }
            tracing::info!(
                station_id = %station.id,
                station = %station.name,
                "Degraded station reachable again"
            );
        }

        let sample = self.fetcher.fetch_sample(&station.stream_url).await?;

        // Decode and feature extraction are the memory-heavy stages; hold
        // the tighter permit only for their duration
        let (audio, verdict) = {
            let _permit = self
                .analysis_permits
                .acquire()
                .await
                .map_err(|_| Error::Internal("analysis semaphore closed".to_string()))?;

            let threshold = self.config.music_threshold;
            let bytes = sample.bytes.clone();
            let content_type = sample.content_type.clone();
            tokio::task::spawn_blocking(move || {
                let audio = decode_sample(bytes, content_type.as_deref())?;
                let verdict = FeatureGate::new(threshold).analyze(&audio)?;
                Ok::<_, Error>((audio, verdict))
            })
            .await
            .map_err(|e| Error::Internal(format!("analysis task failed: {}", e)))??
        };

        if !verdict.is_music {
            tracing::debug!(
                station_id = %station.id,
                likelihood = format!("{:.1}", verdict.likelihood),
                "Sample classified as non-music"
            );
            self.tracker.observe(station.id, None, now).await?;
            return Ok(());
        }

        let prepared = AudioSample::prepare(sample.bytes, audio).await?;
        let recognized = self.cascade.identify(&prepared).await?;

        if recognized.is_none() {
            // Music, but no source knows it: ends any open session
            tracing::info!(
                station_id = %station.id,
                likelihood = format!("{:.1}", verdict.likelihood),
                duration_seconds = format!("{:.1}", prepared.duration_seconds()),
                "Unidentified music"
            );
            self.events.emit_lossy(MonitorEvent::MusicUnidentified {
                station_id: station.id,
                likelihood: verdict.likelihood,
                sample_seconds: prepared.duration_seconds(),
                timestamp: now,
            });
        }
        self.tracker
            .observe(station.id, recognized.as_ref(), now)
            .await?;

        Ok(())
    }

    /// Health transitions: any failed cycle degrades the station, any
    /// successful cycle restores it.
    async fn update_station_health(&self, station: &Station, success: bool) {
        let consecutive_failures = {
            let mut failures = self.failures.lock().await;
            if success {
                failures.remove(&station.id);
                0
            } else {
                let count = failures.entry(station.id).or_insert(0);
                *count += 1;
                *count
            }
        };

        let new_health = if success {
            StationHealth::Good
        } else {
            StationHealth::Degraded
        };
        if new_health == station.health {
            return;
        }

        if let Err(e) = stations::set_station_health(&self.pool, station.id, new_health).await {
            tracing::error!(
                station_id = %station.id,
                error = %e,
                "Failed to persist station health"
            );
            return;
        }

        tracing::info!(
            station_id = %station.id,
            station = %station.name,
            health = new_health.as_str(),
            consecutive_failures,
            "Station health changed"
        );
        self.events.emit_lossy(MonitorEvent::StationHealthChanged {
            station_id: station.id,
            health: new_health,
            consecutive_failures,
            timestamp: Utc::now(),
        });
    }

    /// Periodic reconciliation: rebuild the aggregates from the finalized
    /// detection log. The rows hold lifetime totals, so the rebuild spans
    /// from the first finalized detection through the next hour boundary;
    /// a finalize racing the rebuild is picked up by the following pass.
    async fn reconcile_aggregates(&self) {
        let earliest = match detections::earliest_finalized_at(&self.pool).await {
            Ok(Some(earliest)) => earliest,
            Ok(None) => {
                tracing::debug!("No finalized detections yet, skipping reconciliation");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load detection range for reconciliation");
                return;
            }
        };

        let start = crate::db::stats::Granularity::Hourly.truncate(earliest);
        let end =
            crate::db::stats::Granularity::Hourly.truncate(Utc::now()) + ChronoDuration::hours(1);

        match self.aggregator.recompute_window(start, end).await {
            Ok(summary) => {
                tracing::info!(
                    detections = summary.detections,
                    rows = summary.rows_overwritten,
                    "Aggregates reconciled"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Aggregate reconciliation failed");
            }
        }
    }

    /// Tracker handle (integration tests observe session state through this)
    pub fn tracker(&self) -> &PlaySessionTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::detections::Detection;
    use crate::db::stats::{self, StatsKey};
    use crate::db::tracks::{self, TrackMetadata};
    use chrono::TimeZone;

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            audio_id_api_key: Some("test-key".to_string()),
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_orchestrator_builds_with_full_cascade() {
        let pool = db::init_memory_pool().await.unwrap();
        let orchestrator = StationOrchestrator::new(
            pool,
            test_config(),
            EventBus::new(16),
            CancellationToken::new(),
        );
        assert!(orchestrator.is_ok());
    }

    #[tokio::test]
    async fn test_orchestrator_builds_without_provider_key() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = MonitorConfig {
            audio_id_api_key: None,
            metadata_id_enabled: false,
            ..MonitorConfig::default()
        };
        let orchestrator =
            StationOrchestrator::new(pool, config, EventBus::new(16), CancellationToken::new());
        assert!(orchestrator.is_ok());
    }

    #[tokio::test]
    async fn test_reconciliation_keeps_older_detections() {
        let pool = db::init_memory_pool().await.unwrap();
        let station = Station::new("KTST".to_string(), "http://example.com/ktst".to_string());
        stations::save_station(&pool, &station).await.unwrap();
        let track = tracks::create_or_update_track(
            &pool,
            &TrackMetadata {
                title: "Static Bloom".to_string(),
                artist: "Copper Field".to_string(),
                ..Default::default()
            },
            Some("fp-1"),
        )
        .await
        .unwrap();

        let orchestrator = StationOrchestrator::new(
            pool.clone(),
            MonitorConfig::default(),
            EventBus::new(16),
            CancellationToken::new(),
        )
        .unwrap();

        // Two finalized plays a day apart, folded incrementally
        for day in [1, 2] {
            let detection = Detection {
                id: Uuid::new_v4(),
                track_id: track.id,
                station_id: station.id,
                detected_at: Utc.with_ymd_and_hms(2026, 5, day, 10, 0, 0).unwrap(),
                confidence: 100.0,
                duration_seconds: 120,
                source: "local".to_string(),
            };
            detections::create_detection(&pool, &detection).await.unwrap();
            detections::update_detection_duration(&pool, detection.id, 120)
                .await
                .unwrap();
            orchestrator.aggregator.apply(&detection).await.unwrap();
        }

        // Plus a provisional row for a session still open
        let provisional = Detection {
            id: Uuid::new_v4(),
            track_id: track.id,
            station_id: station.id,
            detected_at: Utc.with_ymd_and_hms(2026, 5, 2, 11, 0, 0).unwrap(),
            confidence: 100.0,
            duration_seconds: 10,
            source: "local".to_string(),
        };
        detections::create_detection(&pool, &provisional).await.unwrap();

        orchestrator.reconcile_aggregates().await;

        // Both days survive the rebuild; the open session is not counted
        let row = stats::load_stats(&pool, StatsKey::Track(track.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.count, 2);
        assert_eq!(row.total_play_time_seconds, 240);
    }

    #[tokio::test]
    async fn test_station_task_skips_cycle_after_cancellation() {
        let pool = db::init_memory_pool().await.unwrap();
        let station = Station::new("KTST".to_string(), "http://example.com/ktst".to_string());
        stations::save_station(&pool, &station).await.unwrap();

        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let orchestrator =
            StationOrchestrator::new(pool, test_config(), events, cancel.clone()).unwrap();

        cancel.cancel();
        orchestrator.in_flight.lock().await.insert(station.id);
        Arc::clone(&orchestrator).station_task(station).await;

        // No cycle ran: nothing emitted, in-flight entry cleared
        assert!(orchestrator.in_flight.lock().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_and_reports() {
        let pool = db::init_memory_pool().await.unwrap();
        let events = EventBus::new(16);
        let cancel = CancellationToken::new();
        let orchestrator =
            StationOrchestrator::new(pool, test_config(), events.clone(), cancel.clone()).unwrap();

        let mut rx = events.subscribe();
        cancel.cancel();
        orchestrator.run().await.unwrap();

        match rx.recv().await.unwrap() {
            MonitorEvent::MonitorStarted { station_count, .. } => assert_eq!(station_count, 0),
            other => panic!("Unexpected first event: {:?}", other),
        }
        loop {
            match rx.recv().await.unwrap() {
                MonitorEvent::MonitorStopped { sessions_finalized, .. } => {
                    assert_eq!(sessions_finalized, 0);
                    break;
                }
                _ => continue,
            }
        }
    }
}
