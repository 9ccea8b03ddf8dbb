//! Detection database operations
//!
//! A Detection is an immutable fact created once per finalized play session.
//! The only permitted correction is the one-time duration write at
//! finalization; nothing else updates a detection after creation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Detection record: (track, station, detected-at, confidence, duration, source)
#[derive(Debug, Clone)]
pub struct Detection {
    pub id: Uuid,
    pub track_id: Uuid,
    pub station_id: Uuid,
    pub detected_at: DateTime<Utc>,
    /// Recognition confidence, 0–100
    pub confidence: f64,
    pub duration_seconds: i64,
    /// Recognition source tag ("local", "audio_id", "metadata_id")
    pub source: String,
}

fn detection_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Detection> {
    let id_str: String = row.get("id");
    let track_str: String = row.get("track_id");
    let station_str: String = row.get("station_id");
    let detected_str: String = row.get("detected_at");

    Ok(Detection {
        id: Uuid::parse_str(&id_str)?,
        track_id: Uuid::parse_str(&track_str)?,
        station_id: Uuid::parse_str(&station_str)?,
        detected_at: DateTime::parse_from_rfc3339(&detected_str)?.with_timezone(&Utc),
        confidence: row.get("confidence"),
        duration_seconds: row.get("duration_seconds"),
        source: row.get("source"),
    })
}

/// Create a detection row (provisional at session open)
pub async fn create_detection(pool: &SqlitePool, detection: &Detection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO detections (id, track_id, station_id, detected_at, confidence, duration_seconds, source)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(detection.id.to_string())
    .bind(detection.track_id.to_string())
    .bind(detection.station_id.to_string())
    .bind(detection.detected_at.to_rfc3339())
    .bind(detection.confidence)
    .bind(detection.duration_seconds)
    .bind(&detection.source)
    .execute(pool)
    .await?;

    Ok(())
}

/// One-time authoritative duration correction at finalization.
///
/// Also marks the row finalized; only finalized rows count toward the
/// batch recompute.
pub async fn update_detection_duration(
    pool: &SqlitePool,
    detection_id: Uuid,
    duration_seconds: i64,
) -> Result<()> {
    sqlx::query("UPDATE detections SET duration_seconds = ?, finalized = 1 WHERE id = ?")
        .bind(duration_seconds)
        .bind(detection_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a provisional detection whose session was discarded as noise
pub async fn delete_detection(pool: &SqlitePool, detection_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM detections WHERE id = ?")
        .bind(detection_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Load one detection by id
pub async fn load_detection(pool: &SqlitePool, detection_id: Uuid) -> Result<Option<Detection>> {
    let row = sqlx::query("SELECT * FROM detections WHERE id = ?")
        .bind(detection_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(detection_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Finalized detections in a closed time window `[start, end)`, ordered by
/// detected_at. Used by the batch recompute path; provisional rows for
/// still-open sessions are excluded.
pub async fn detections_in_window(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Detection>> {
    let rows = sqlx::query(
        "SELECT * FROM detections WHERE finalized = 1 AND detected_at >= ? AND detected_at < ? ORDER BY detected_at",
    )
    .bind(start.to_rfc3339())
    .bind(end.to_rfc3339())
    .fetch_all(pool)
    .await?;

    rows.iter().map(detection_from_row).collect()
}

/// Timestamp of the oldest finalized detection, if any
pub async fn earliest_finalized_at(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query("SELECT MIN(detected_at) AS earliest FROM detections WHERE finalized = 1")
        .fetch_one(pool)
        .await?;
    let earliest: Option<String> = row.get("earliest");
    match earliest {
        Some(raw) => Ok(Some(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))),
        None => Ok(None),
    }
}

/// Detections for one station, ordered by detected_at (per-station timeline)
pub async fn detections_for_station(
    pool: &SqlitePool,
    station_id: Uuid,
) -> Result<Vec<Detection>> {
    let rows = sqlx::query("SELECT * FROM detections WHERE station_id = ? ORDER BY detected_at")
        .bind(station_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(detection_from_row).collect()
}
