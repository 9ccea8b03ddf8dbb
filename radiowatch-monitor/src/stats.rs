//! Statistics aggregation
//!
//! Folds each finalized detection into the per-entity aggregate rows and
//! time-bucket rollups, and provides the batch recompute path that rebuilds
//! the same aggregates from the finalized detection log. Both paths produce
//! identical rows; provisional rows for still-open sessions carry no
//! finalized mark and are invisible to the batch path.

use crate::db::detections::{self, Detection};
use crate::db::stats::{self, Granularity, RollupScope, StatsKey, StatsRow};
use crate::db::{stations, tracks};
use chrono::{DateTime, Timelike, Utc};
use radiowatch_common::retry::RetryPolicy;
use radiowatch_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one batch recompute
#[derive(Debug, Clone, Copy)]
pub struct RecomputeSummary {
    pub detections: usize,
    pub rows_overwritten: usize,
}

/// Incremental statistics aggregator
pub struct StatsAggregator {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl StatsAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::for_database(),
        }
    }

    /// Fold one finalized detection into every aggregate it touches.
    ///
    /// All writes for the detection run in one transaction: the four stats
    /// rows, the cumulative track/artist/station fields, and the nine
    /// rollup buckets commit together or not at all.
    pub async fn apply(&self, detection: &Detection) -> Result<()> {
        let track = tracks::load_track(&self.pool, detection.track_id)
            .await
            .map_err(Error::from_store)?
            .ok_or_else(|| {
                Error::NotFound(format!("track {} for detection", detection.track_id))
            })?;

        self.retry
            .run("stats apply", || self.apply_once(detection, track.artist_id))
            .await
    }

    async fn apply_once(&self, detection: &Detection, artist_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let conn = tx.as_mut();

        let keys = [
            StatsKey::Track(detection.track_id),
            StatsKey::Artist(artist_id),
            StatsKey::Station(detection.station_id),
            StatsKey::StationTrack {
                station_id: detection.station_id,
                track_id: detection.track_id,
            },
        ];
        for key in keys {
            stats::apply_detection_to_stats(
                conn,
                key,
                detection.confidence,
                detection.duration_seconds,
                detection.detected_at,
            )
            .await
            .map_err(Error::from_store)?;
        }

        tracks::add_track_play(conn, detection.track_id, detection.duration_seconds)
            .await
            .map_err(Error::from_store)?;
        tracks::add_artist_play(conn, artist_id, detection.duration_seconds)
            .await
            .map_err(Error::from_store)?;
        stations::add_station_play(
            conn,
            detection.station_id,
            detection.duration_seconds,
            detection.detected_at,
        )
        .await
        .map_err(Error::from_store)?;

        for granularity in Granularity::ALL {
            let scopes = [
                (RollupScope::Track, Some(detection.track_id)),
                (RollupScope::Artist, Some(artist_id)),
                (RollupScope::Global, None),
            ];
            for (scope, entity_id) in scopes {
                stats::increment_rollup(
                    conn,
                    granularity,
                    scope,
                    entity_id,
                    detection.detected_at,
                    detection.duration_seconds,
                )
                .await
                .map_err(Error::from_store)?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            detection_id = %detection.id,
            track_id = %detection.track_id,
            station_id = %detection.station_id,
            "Detection folded into aggregates"
        );

        Ok(())
    }

    /// Rebuild the aggregate rows from the finalized detections in
    /// `[start, end)` and overwrite them in one transaction.
    ///
    /// The aggregate rows are lifetime totals, so the window must cover the
    /// whole finalized history: both bounds must be hour-aligned and `start`
    /// must not postdate the earliest finalized detection. A window that
    /// misses older history is rejected rather than allowed to erase it.
    pub async fn recompute_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RecomputeSummary> {
        if start >= end {
            return Err(Error::Internal(format!(
                "recompute window is empty: {} >= {}",
                start, end
            )));
        }
        for bound in [start, end] {
            if bound.minute() != 0 || bound.second() != 0 || bound.nanosecond() != 0 {
                return Err(Error::Internal(format!(
                    "recompute bound {} is not hour-aligned",
                    bound
                )));
            }
        }
        if let Some(earliest) = detections::earliest_finalized_at(&self.pool)
            .await
            .map_err(Error::from_store)?
        {
            if earliest < start {
                return Err(Error::Internal(format!(
                    "finalized detections predate recompute window start {}",
                    start
                )));
            }
        }

        let window = detections::detections_in_window(&self.pool, start, end)
            .await
            .map_err(Error::from_store)?;

        let mut artist_of_track: HashMap<Uuid, Uuid> = HashMap::new();
        for detection in &window {
            if !artist_of_track.contains_key(&detection.track_id) {
                let track = tracks::load_track(&self.pool, detection.track_id)
                    .await
                    .map_err(Error::from_store)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("track {} for detection", detection.track_id))
                    })?;
                artist_of_track.insert(detection.track_id, track.artist_id);
            }
        }

        let mut rows: HashMap<StatsKey, StatsRow> = HashMap::new();
        for detection in &window {
            let artist_id = artist_of_track[&detection.track_id];
            let keys = [
                StatsKey::Track(detection.track_id),
                StatsKey::Artist(artist_id),
                StatsKey::Station(detection.station_id),
                StatsKey::StationTrack {
                    station_id: detection.station_id,
                    track_id: detection.track_id,
                },
            ];
            for key in keys {
                fold_detection(rows.entry(key).or_insert_with(|| empty_row(detection)), detection);
            }
        }

        let mut tx = self.pool.begin().await?;
        for (key, row) in &rows {
            stats::overwrite_stats(tx.as_mut(), *key, row)
                .await
                .map_err(Error::from_store)?;
        }
        tx.commit().await?;

        let summary = RecomputeSummary {
            detections: window.len(),
            rows_overwritten: rows.len(),
        };

        tracing::info!(
            start = %start,
            end = %end,
            detections = summary.detections,
            rows = summary.rows_overwritten,
            "Aggregate window recomputed"
        );

        Ok(summary)
    }
}

fn empty_row(detection: &Detection) -> StatsRow {
    StatsRow {
        count: 0,
        total_play_time_seconds: 0,
        average_confidence: 0.0,
        last_detected: detection.detected_at,
    }
}

fn fold_detection(row: &mut StatsRow, detection: &Detection) {
    row.average_confidence = (row.average_confidence * row.count as f64 + detection.confidence)
        / (row.count as f64 + 1.0);
    row.count += 1;
    row.total_play_time_seconds += detection.duration_seconds;
    row.last_detected = row.last_detected.max(detection.detected_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::stations::Station;
    use crate::db::tracks::TrackMetadata;
    use chrono::TimeZone;

    async fn seeded(pool: &SqlitePool) -> (Uuid, Uuid, Uuid) {
        let station = Station::new("KTST".to_string(), "http://example.com/ktst".to_string());
        stations::save_station(pool, &station).await.unwrap();

        let metadata = TrackMetadata {
            title: "Static Bloom".to_string(),
            artist: "Copper Field".to_string(),
            ..Default::default()
        };
        let track = tracks::create_or_update_track(pool, &metadata, Some("fp-1"))
            .await
            .unwrap();

        (station.id, track.id, track.artist_id)
    }

    fn detection_at(
        track_id: Uuid,
        station_id: Uuid,
        at: DateTime<Utc>,
        confidence: f64,
        duration: i64,
    ) -> Detection {
        Detection {
            id: Uuid::new_v4(),
            track_id,
            station_id,
            detected_at: at,
            confidence,
            duration_seconds: duration,
            source: "local".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_updates_all_aggregates() {
        let pool = db::init_memory_pool().await.unwrap();
        let (station_id, track_id, artist_id) = seeded(&pool).await;
        let aggregator = StatsAggregator::new(pool.clone());

        let at = Utc.with_ymd_and_hms(2026, 5, 2, 14, 30, 0).unwrap();
        let detection = detection_at(track_id, station_id, at, 100.0, 180);
        detections::create_detection(&pool, &detection).await.unwrap();
        aggregator.apply(&detection).await.unwrap();

        let track_row = stats::load_stats(&pool, StatsKey::Track(track_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(track_row.count, 1);
        assert_eq!(track_row.total_play_time_seconds, 180);
        assert!((track_row.average_confidence - 100.0).abs() < 1e-9);

        for key in [
            StatsKey::Artist(artist_id),
            StatsKey::Station(station_id),
            StatsKey::StationTrack { station_id, track_id },
        ] {
            let row = stats::load_stats(&pool, key).await.unwrap().unwrap();
            assert_eq!(row.count, 1);
        }

        // Cumulative entity fields
        let track = tracks::load_track(&pool, track_id).await.unwrap().unwrap();
        assert_eq!(track.play_count, 1);
        assert_eq!(track.total_play_time_seconds, 180);

        let station = stations::load_station(&pool, station_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(station.total_play_time_seconds, 180);
        assert_eq!(station.last_detected_at, Some(at));

        // Hourly global rollup bucket
        let bucket = Granularity::Hourly.truncate(at);
        let (plays, seconds) =
            stats::load_rollup(&pool, Granularity::Hourly, RollupScope::Global, None, bucket)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(plays, 1);
        assert_eq!(seconds, 180);
    }

    #[tokio::test]
    async fn test_running_mean_matches_arithmetic_mean() {
        let pool = db::init_memory_pool().await.unwrap();
        let (station_id, track_id, _) = seeded(&pool).await;
        let aggregator = StatsAggregator::new(pool.clone());

        let confidences = [100.0, 90.0, 85.0, 100.0, 90.0];
        let base = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap();
        for (i, &confidence) in confidences.iter().enumerate() {
            let at = base + chrono::Duration::minutes(5 * i as i64);
            let detection = detection_at(track_id, station_id, at, confidence, 120);
            detections::create_detection(&pool, &detection).await.unwrap();
            aggregator.apply(&detection).await.unwrap();
        }

        let row = stats::load_stats(&pool, StatsKey::Track(track_id))
            .await
            .unwrap()
            .unwrap();
        let expected = confidences.iter().sum::<f64>() / confidences.len() as f64;
        assert_eq!(row.count, confidences.len() as i64);
        assert!((row.average_confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_incremental_matches_batch_recompute() {
        let pool = db::init_memory_pool().await.unwrap();
        let (station_id, track_id, artist_id) = seeded(&pool).await;
        let aggregator = StatsAggregator::new(pool.clone());

        let start = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();

        for (minutes, confidence, duration) in [(3, 100.0, 200), (40, 90.0, 95), (95, 85.0, 240)] {
            let at = start + chrono::Duration::minutes(minutes);
            let detection = detection_at(track_id, station_id, at, confidence, duration);
            detections::create_detection(&pool, &detection).await.unwrap();
            detections::update_detection_duration(&pool, detection.id, duration)
                .await
                .unwrap();
            aggregator.apply(&detection).await.unwrap();
        }

        let keys = [
            StatsKey::Track(track_id),
            StatsKey::Artist(artist_id),
            StatsKey::Station(station_id),
            StatsKey::StationTrack { station_id, track_id },
        ];
        let mut incremental = Vec::new();
        for key in keys {
            incremental.push(stats::load_stats(&pool, key).await.unwrap().unwrap());
        }

        let summary = aggregator.recompute_window(start, end).await.unwrap();
        assert_eq!(summary.detections, 3);
        assert_eq!(summary.rows_overwritten, 4);

        for (key, before) in keys.iter().zip(&incremental) {
            let after = stats::load_stats(&pool, *key).await.unwrap().unwrap();
            assert_eq!(after.count, before.count);
            assert_eq!(after.total_play_time_seconds, before.total_play_time_seconds);
            assert!((after.average_confidence - before.average_confidence).abs() < 1e-9);
            assert_eq!(after.last_detected, before.last_detected);
        }
    }

    #[tokio::test]
    async fn test_recompute_preserves_history_across_days() {
        let pool = db::init_memory_pool().await.unwrap();
        let (station_id, track_id, _) = seeded(&pool).await;
        let aggregator = StatsAggregator::new(pool.clone());

        // Two finalized plays a day apart, folded incrementally
        let day1 = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap();
        for at in [day1, day2] {
            let detection = detection_at(track_id, station_id, at, 100.0, 120);
            detections::create_detection(&pool, &detection).await.unwrap();
            detections::update_detection_duration(&pool, detection.id, 120)
                .await
                .unwrap();
            aggregator.apply(&detection).await.unwrap();
        }

        // A trailing window that misses day 1 must not erase it
        let trailing_start = Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();
        assert!(aggregator
            .recompute_window(trailing_start, end)
            .await
            .is_err());

        // The full span rebuilds the lifetime row intact
        let summary = aggregator.recompute_window(day1, end).await.unwrap();
        assert_eq!(summary.detections, 2);

        let row = stats::load_stats(&pool, StatsKey::Track(track_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.count, 2);
        assert_eq!(row.total_play_time_seconds, 240);
        assert_eq!(row.last_detected, day2);
    }

    #[tokio::test]
    async fn test_recompute_rejects_unaligned_window() {
        let pool = db::init_memory_pool().await.unwrap();
        let aggregator = StatsAggregator::new(pool);

        let start = Utc.with_ymd_and_hms(2026, 5, 2, 10, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();
        assert!(aggregator.recompute_window(start, end).await.is_err());

        let start = Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap();
        assert!(aggregator.recompute_window(start, start).await.is_err());
    }
}
