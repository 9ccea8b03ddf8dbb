//! Database access for the monitor pipeline
//!
//! Shared SQLite database holding stations, tracks, artists, detections and
//! the aggregate tables. The web/report collaborators read the same file;
//! this crate only writes what the pipeline produces.

pub mod detections;
pub mod stats;
pub mod stations;
pub mod tracks;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to the monitor database, creating it (and its parent directory)
/// when missing, and runs schema initialization.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests and collaborator tooling.
///
/// Pinned to one connection: every pooled connection to `:memory:` would
/// otherwise get its own empty database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Initialize monitor tables
///
/// Idempotent; every table uses CREATE TABLE IF NOT EXISTS.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            stream_url TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            health TEXT NOT NULL DEFAULT 'good',
            last_checked_at TEXT,
            last_detected_at TEXT,
            total_play_time_seconds INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            total_plays INTEGER NOT NULL DEFAULT 0,
            total_play_time_seconds INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artist_id TEXT NOT NULL REFERENCES artists(id),
            album TEXT,
            isrc TEXT,
            label TEXT,
            external_id TEXT,
            fingerprint TEXT UNIQUE,
            play_count INTEGER NOT NULL DEFAULT 0,
            total_play_time_seconds INTEGER NOT NULL DEFAULT 0,
            UNIQUE(title, artist_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Cache mapping raw sample hashes to content fingerprints, so a byte-for-
    // byte repeated sample resolves without recomputing the fingerprint path.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sample_hashes (
            sample_hash TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detections (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id),
            station_id TEXT NOT NULL REFERENCES stations(id),
            detected_at TEXT NOT NULL,
            confidence REAL NOT NULL,
            duration_seconds INTEGER NOT NULL,
            source TEXT NOT NULL,
            finalized INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_detections_detected_at ON detections(detected_at)",
    )
    .execute(pool)
    .await?;

    for table in [
        "CREATE TABLE IF NOT EXISTS track_stats (
            track_id TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            total_play_time_seconds INTEGER NOT NULL,
            average_confidence REAL NOT NULL,
            last_detected TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS artist_stats (
            artist_id TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            total_play_time_seconds INTEGER NOT NULL,
            average_confidence REAL NOT NULL,
            last_detected TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS station_stats (
            station_id TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            total_play_time_seconds INTEGER NOT NULL,
            average_confidence REAL NOT NULL,
            last_detected TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS station_track_stats (
            station_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            count INTEGER NOT NULL,
            total_play_time_seconds INTEGER NOT NULL,
            average_confidence REAL NOT NULL,
            last_detected TEXT NOT NULL,
            PRIMARY KEY (station_id, track_id)
        )",
        "CREATE TABLE IF NOT EXISTS play_rollups (
            granularity TEXT NOT NULL,
            scope TEXT NOT NULL,
            entity_id TEXT NOT NULL DEFAULT '',
            bucket_start TEXT NOT NULL,
            play_count INTEGER NOT NULL,
            play_time_seconds INTEGER NOT NULL,
            PRIMARY KEY (granularity, scope, entity_id, bucket_start)
        )",
    ] {
        sqlx::query(table).execute(pool).await?;
    }

    tracing::info!("Database tables initialized");

    Ok(())
}
