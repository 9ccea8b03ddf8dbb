//! Station database operations
//!
//! The monitor mutates only operational fields (health, timestamps,
//! cumulative play time). Stations are created and deleted by the
//! collaborator CRUD layer, never by this crate.

use anyhow::Result;
use chrono::{DateTime, Utc};
use radiowatch_common::events::StationHealth;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Station record
#[derive(Debug, Clone)]
pub struct Station {
    pub id: Uuid,
    pub name: String,
    pub stream_url: String,
    pub active: bool,
    pub health: StationHealth,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_detected_at: Option<DateTime<Utc>>,
    pub total_play_time_seconds: i64,
}

impl Station {
    /// New active station with good health and no history
    pub fn new(name: String, stream_url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            stream_url,
            active: true,
            health: StationHealth::Good,
            last_checked_at: None,
            last_detected_at: None,
            total_play_time_seconds: 0,
        }
    }
}

fn station_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Station> {
    let id_str: String = row.get("id");
    let health_str: String = row.get("health");
    let last_checked: Option<String> = row.get("last_checked_at");
    let last_detected: Option<String> = row.get("last_detected_at");

    Ok(Station {
        id: Uuid::parse_str(&id_str)?,
        name: row.get("name"),
        stream_url: row.get("stream_url"),
        active: row.get::<i64, _>("active") != 0,
        health: if health_str == "degraded" {
            StationHealth::Degraded
        } else {
            StationHealth::Good
        },
        last_checked_at: parse_opt_time(last_checked)?,
        last_detected_at: parse_opt_time(last_detected)?,
        total_play_time_seconds: row.get("total_play_time_seconds"),
    })
}

fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => Ok(Some(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))),
        None => Ok(None),
    }
}

/// Save a station (used by tests and seed tooling; upserts on id)
pub async fn save_station(pool: &SqlitePool, station: &Station) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stations (id, name, stream_url, active, health, last_checked_at, last_detected_at, total_play_time_seconds)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            stream_url = excluded.stream_url,
            active = excluded.active
        "#,
    )
    .bind(station.id.to_string())
    .bind(&station.name)
    .bind(&station.stream_url)
    .bind(station.active as i64)
    .bind(station.health.as_str())
    .bind(station.last_checked_at.map(|t| t.to_rfc3339()))
    .bind(station.last_detected_at.map(|t| t.to_rfc3339()))
    .bind(station.total_play_time_seconds)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read-only snapshot of active stations for one orchestration cycle
pub async fn list_active_stations(pool: &SqlitePool) -> Result<Vec<Station>> {
    let rows = sqlx::query("SELECT * FROM stations WHERE active = 1 ORDER BY name")
        .fetch_all(pool)
        .await?;

    rows.iter().map(station_from_row).collect()
}

/// Load one station by id
pub async fn load_station(pool: &SqlitePool, station_id: Uuid) -> Result<Option<Station>> {
    let row = sqlx::query("SELECT * FROM stations WHERE id = ?")
        .bind(station_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(station_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Record that a cycle checked this station
pub async fn touch_station_checked(
    pool: &SqlitePool,
    station_id: Uuid,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE stations SET last_checked_at = ? WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(station_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Update station health marker
pub async fn set_station_health(
    pool: &SqlitePool,
    station_id: Uuid,
    health: StationHealth,
) -> Result<()> {
    sqlx::query("UPDATE stations SET health = ? WHERE id = ?")
        .bind(health.as_str())
        .bind(station_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Roll a finalized play into the station row: cumulative play time plus the
/// last-detected marker (monotonic; never moves backwards)
pub async fn add_station_play(
    conn: &mut SqliteConnection,
    station_id: Uuid,
    play_seconds: i64,
    detected_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE stations
        SET total_play_time_seconds = total_play_time_seconds + ?,
            last_detected_at = MAX(COALESCE(last_detected_at, ''), ?)
        WHERE id = ?
        "#,
    )
    .bind(play_seconds)
    .bind(detected_at.to_rfc3339())
    .bind(station_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
