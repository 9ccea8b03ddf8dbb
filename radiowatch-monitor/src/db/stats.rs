//! Aggregate-row database operations
//!
//! One row per track, artist, station and (station, track) pair, plus the
//! hourly/daily/monthly play rollups used by dashboard trend queries.
//! The running-mean arithmetic lives in SQL so seed-or-update is a single
//! statement per row; right-hand sides of DO UPDATE read the pre-update row.
//!
//! Write helpers take a connection rather than the pool: one detection's
//! writes span four aggregate tables and must commit or roll back together,
//! so the caller owns the transaction.

use anyhow::Result;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// One aggregate record
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    pub count: i64,
    pub total_play_time_seconds: i64,
    pub average_confidence: f64,
    pub last_detected: DateTime<Utc>,
}

/// Key addressing one aggregate row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsKey {
    Track(Uuid),
    Artist(Uuid),
    Station(Uuid),
    StationTrack { station_id: Uuid, track_id: Uuid },
}

/// Fold one detection into the addressed aggregate row: seed on first
/// detection, otherwise running-mean update.
pub async fn apply_detection_to_stats(
    conn: &mut SqliteConnection,
    key: StatsKey,
    confidence: f64,
    duration_seconds: i64,
    detected_at: DateTime<Utc>,
) -> Result<()> {
    let detected = detected_at.to_rfc3339();
    match key {
        StatsKey::Track(id) => {
            sqlx::query(
                r#"
                INSERT INTO track_stats (track_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, 1, ?, ?, ?)
                ON CONFLICT(track_id) DO UPDATE SET
                    count = track_stats.count + 1,
                    total_play_time_seconds = track_stats.total_play_time_seconds + excluded.total_play_time_seconds,
                    average_confidence = (track_stats.average_confidence * track_stats.count + excluded.average_confidence)
                                         / (track_stats.count + 1),
                    last_detected = MAX(track_stats.last_detected, excluded.last_detected)
                "#,
            )
            .bind(id.to_string())
            .bind(duration_seconds)
            .bind(confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::Artist(id) => {
            sqlx::query(
                r#"
                INSERT INTO artist_stats (artist_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, 1, ?, ?, ?)
                ON CONFLICT(artist_id) DO UPDATE SET
                    count = artist_stats.count + 1,
                    total_play_time_seconds = artist_stats.total_play_time_seconds + excluded.total_play_time_seconds,
                    average_confidence = (artist_stats.average_confidence * artist_stats.count + excluded.average_confidence)
                                         / (artist_stats.count + 1),
                    last_detected = MAX(artist_stats.last_detected, excluded.last_detected)
                "#,
            )
            .bind(id.to_string())
            .bind(duration_seconds)
            .bind(confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::Station(id) => {
            sqlx::query(
                r#"
                INSERT INTO station_stats (station_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, 1, ?, ?, ?)
                ON CONFLICT(station_id) DO UPDATE SET
                    count = station_stats.count + 1,
                    total_play_time_seconds = station_stats.total_play_time_seconds + excluded.total_play_time_seconds,
                    average_confidence = (station_stats.average_confidence * station_stats.count + excluded.average_confidence)
                                         / (station_stats.count + 1),
                    last_detected = MAX(station_stats.last_detected, excluded.last_detected)
                "#,
            )
            .bind(id.to_string())
            .bind(duration_seconds)
            .bind(confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::StationTrack { station_id, track_id } => {
            sqlx::query(
                r#"
                INSERT INTO station_track_stats (station_id, track_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, ?, 1, ?, ?, ?)
                ON CONFLICT(station_id, track_id) DO UPDATE SET
                    count = station_track_stats.count + 1,
                    total_play_time_seconds = station_track_stats.total_play_time_seconds + excluded.total_play_time_seconds,
                    average_confidence = (station_track_stats.average_confidence * station_track_stats.count + excluded.average_confidence)
                                         / (station_track_stats.count + 1),
                    last_detected = MAX(station_track_stats.last_detected, excluded.last_detected)
                "#,
            )
            .bind(station_id.to_string())
            .bind(track_id.to_string())
            .bind(duration_seconds)
            .bind(confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

fn stats_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StatsRow> {
    let detected_str: String = row.get("last_detected");
    Ok(StatsRow {
        count: row.get("count"),
        total_play_time_seconds: row.get("total_play_time_seconds"),
        average_confidence: row.get("average_confidence"),
        last_detected: DateTime::parse_from_rfc3339(&detected_str)?.with_timezone(&Utc),
    })
}

/// Load one aggregate row
pub async fn load_stats(pool: &SqlitePool, key: StatsKey) -> Result<Option<StatsRow>> {
    let row = match key {
        StatsKey::Track(id) => {
            sqlx::query("SELECT * FROM track_stats WHERE track_id = ?")
                .bind(id.to_string())
                .fetch_optional(pool)
                .await?
        }
        StatsKey::Artist(id) => {
            sqlx::query("SELECT * FROM artist_stats WHERE artist_id = ?")
                .bind(id.to_string())
                .fetch_optional(pool)
                .await?
        }
        StatsKey::Station(id) => {
            sqlx::query("SELECT * FROM station_stats WHERE station_id = ?")
                .bind(id.to_string())
                .fetch_optional(pool)
                .await?
        }
        StatsKey::StationTrack { station_id, track_id } => {
            sqlx::query("SELECT * FROM station_track_stats WHERE station_id = ? AND track_id = ?")
                .bind(station_id.to_string())
                .bind(track_id.to_string())
                .fetch_optional(pool)
                .await?
        }
    };

    match row {
        Some(row) => Ok(Some(stats_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Overwrite one aggregate row with recomputed values (batch recompute path)
pub async fn overwrite_stats(
    conn: &mut SqliteConnection,
    key: StatsKey,
    stats: &StatsRow,
) -> Result<()> {
    let detected = stats.last_detected.to_rfc3339();
    match key {
        StatsKey::Track(id) => {
            sqlx::query(
                r#"
                INSERT INTO track_stats (track_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(track_id) DO UPDATE SET
                    count = excluded.count,
                    total_play_time_seconds = excluded.total_play_time_seconds,
                    average_confidence = excluded.average_confidence,
                    last_detected = excluded.last_detected
                "#,
            )
            .bind(id.to_string())
            .bind(stats.count)
            .bind(stats.total_play_time_seconds)
            .bind(stats.average_confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::Artist(id) => {
            sqlx::query(
                r#"
                INSERT INTO artist_stats (artist_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(artist_id) DO UPDATE SET
                    count = excluded.count,
                    total_play_time_seconds = excluded.total_play_time_seconds,
                    average_confidence = excluded.average_confidence,
                    last_detected = excluded.last_detected
                "#,
            )
            .bind(id.to_string())
            .bind(stats.count)
            .bind(stats.total_play_time_seconds)
            .bind(stats.average_confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::Station(id) => {
            sqlx::query(
                r#"
                INSERT INTO station_stats (station_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(station_id) DO UPDATE SET
                    count = excluded.count,
                    total_play_time_seconds = excluded.total_play_time_seconds,
                    average_confidence = excluded.average_confidence,
                    last_detected = excluded.last_detected
                "#,
            )
            .bind(id.to_string())
            .bind(stats.count)
            .bind(stats.total_play_time_seconds)
            .bind(stats.average_confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
        StatsKey::StationTrack { station_id, track_id } => {
            sqlx::query(
                r#"
                INSERT INTO station_track_stats (station_id, track_id, count, total_play_time_seconds, average_confidence, last_detected)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(station_id, track_id) DO UPDATE SET
                    count = excluded.count,
                    total_play_time_seconds = excluded.total_play_time_seconds,
                    average_confidence = excluded.average_confidence,
                    last_detected = excluded.last_detected
                "#,
            )
            .bind(station_id.to_string())
            .bind(track_id.to_string())
            .bind(stats.count)
            .bind(stats.total_play_time_seconds)
            .bind(stats.average_confidence)
            .bind(&detected)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

// ============================================================================
// Time-bucket rollups
// ============================================================================

/// Rollup bucket granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub const ALL: [Granularity; 3] =
        [Granularity::Hourly, Granularity::Daily, Granularity::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }

    /// Truncate a timestamp to the start of its bucket
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let t = match self {
            Granularity::Hourly => Utc
                .with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0),
            Granularity::Daily => Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0),
            Granularity::Monthly => Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0),
        };
        // UTC with zeroed components is always a single valid instant
        t.single().unwrap_or(at)
    }
}

/// Rollup scope (which entity dimension the bucket counts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupScope {
    Track,
    Artist,
    Global,
}

impl RollupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupScope::Track => "track",
            RollupScope::Artist => "artist",
            RollupScope::Global => "global",
        }
    }
}

/// Append-or-increment one rollup counter
pub async fn increment_rollup(
    conn: &mut SqliteConnection,
    granularity: Granularity,
    scope: RollupScope,
    entity_id: Option<Uuid>,
    detected_at: DateTime<Utc>,
    play_seconds: i64,
) -> Result<()> {
    let bucket_start = granularity.truncate(detected_at);
    sqlx::query(
        r#"
        INSERT INTO play_rollups (granularity, scope, entity_id, bucket_start, play_count, play_time_seconds)
        VALUES (?, ?, ?, ?, 1, ?)
        ON CONFLICT(granularity, scope, entity_id, bucket_start) DO UPDATE SET
            play_count = play_rollups.play_count + 1,
            play_time_seconds = play_rollups.play_time_seconds + excluded.play_time_seconds
        "#,
    )
    .bind(granularity.as_str())
    .bind(scope.as_str())
    .bind(entity_id.map(|id| id.to_string()).unwrap_or_default())
    .bind(bucket_start.to_rfc3339())
    .bind(play_seconds)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Read one rollup counter (dashboard/test helper)
pub async fn load_rollup(
    pool: &SqlitePool,
    granularity: Granularity,
    scope: RollupScope,
    entity_id: Option<Uuid>,
    bucket_start: DateTime<Utc>,
) -> Result<Option<(i64, i64)>> {
    let row = sqlx::query(
        "SELECT play_count, play_time_seconds FROM play_rollups
         WHERE granularity = ? AND scope = ? AND entity_id = ? AND bucket_start = ?",
    )
    .bind(granularity.as_str())
    .bind(scope.as_str())
    .bind(entity_id.map(|id| id.to_string()).unwrap_or_default())
    .bind(bucket_start.to_rfc3339())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| (r.get("play_count"), r.get("play_time_seconds"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_hourly() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let bucket = Granularity::Hourly.truncate(at);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_truncate_daily_and_monthly() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(
            Granularity::Daily.truncate(at),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Monthly.truncate(at),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }
}
