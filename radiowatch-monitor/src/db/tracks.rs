//! Track and artist database operations
//!
//! Tracks and artists are created lazily on first unmatched recognition
//! result and enriched on later matches that carry fuller metadata.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Track record
#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub title: String,
    pub artist_id: Uuid,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub external_id: Option<String>,
    pub fingerprint: Option<String>,
    pub play_count: i64,
    pub total_play_time_seconds: i64,
}

/// Artist record
#[derive(Debug, Clone)]
pub struct Artist {
    pub id: Uuid,
    pub name: String,
    pub total_plays: i64,
    pub total_play_time_seconds: i64,
}

/// Metadata for a track as reported by an external recognition provider
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub external_id: Option<String>,
}

fn track_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Track> {
    let id_str: String = row.get("id");
    let artist_str: String = row.get("artist_id");
    Ok(Track {
        id: Uuid::parse_str(&id_str)?,
        title: row.get("title"),
        artist_id: Uuid::parse_str(&artist_str)?,
        album: row.get("album"),
        isrc: row.get("isrc"),
        label: row.get("label"),
        external_id: row.get("external_id"),
        fingerprint: row.get("fingerprint"),
        play_count: row.get("play_count"),
        total_play_time_seconds: row.get("total_play_time_seconds"),
    })
}

/// Load track by exact content fingerprint
pub async fn find_track_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &str,
) -> Result<Option<Track>> {
    let row = sqlx::query("SELECT * FROM tracks WHERE fingerprint = ?")
        .bind(fingerprint)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(track_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Load track by id
pub async fn load_track(pool: &SqlitePool, track_id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query("SELECT * FROM tracks WHERE id = ?")
        .bind(track_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(track_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Look up the fingerprint cached for a raw sample hash
pub async fn find_fingerprint_by_sample_hash(
    pool: &SqlitePool,
    sample_hash: &str,
) -> Result<Option<String>> {
    let row = sqlx::query("SELECT fingerprint FROM sample_hashes WHERE sample_hash = ?")
        .bind(sample_hash)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get("fingerprint")))
}

/// Cache a raw-sample-hash → fingerprint mapping
pub async fn cache_sample_hash(
    pool: &SqlitePool,
    sample_hash: &str,
    fingerprint: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sample_hashes (sample_hash, fingerprint) VALUES (?, ?)
         ON CONFLICT(sample_hash) DO NOTHING",
    )
    .bind(sample_hash)
    .bind(fingerprint)
    .execute(pool)
    .await?;
    Ok(())
}

/// Upsert an artist by name, returning the stored record
pub async fn upsert_artist(pool: &SqlitePool, name: &str) -> Result<Artist> {
    sqlx::query(
        "INSERT INTO artists (id, name) VALUES (?, ?)
         ON CONFLICT(name) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(name)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT * FROM artists WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;

    let id_str: String = row.get("id");
    Ok(Artist {
        id: Uuid::parse_str(&id_str)?,
        name: row.get("name"),
        total_plays: row.get("total_plays"),
        total_play_time_seconds: row.get("total_play_time_seconds"),
    })
}

/// Create or update a track from provider metadata, attaching the sample's
/// content fingerprint so the local store matches it next time.
///
/// Matching key is (title, artist); richer fields fill in whatever the
/// earlier source left empty.
pub async fn create_or_update_track(
    pool: &SqlitePool,
    metadata: &TrackMetadata,
    fingerprint: Option<&str>,
) -> Result<Track> {
    let artist = upsert_artist(pool, &metadata.artist).await?;

    sqlx::query(
        r#"
        INSERT INTO tracks (id, title, artist_id, album, isrc, label, external_id, fingerprint)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(title, artist_id) DO UPDATE SET
            album = COALESCE(tracks.album, excluded.album),
            isrc = COALESCE(tracks.isrc, excluded.isrc),
            label = COALESCE(tracks.label, excluded.label),
            external_id = COALESCE(tracks.external_id, excluded.external_id),
            fingerprint = COALESCE(tracks.fingerprint, excluded.fingerprint)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&metadata.title)
    .bind(artist.id.to_string())
    .bind(&metadata.album)
    .bind(&metadata.isrc)
    .bind(&metadata.label)
    .bind(&metadata.external_id)
    .bind(fingerprint)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT * FROM tracks WHERE title = ? AND artist_id = ?")
        .bind(&metadata.title)
        .bind(artist.id.to_string())
        .fetch_one(pool)
        .await?;

    track_from_row(&row)
}

/// Fold one finalized play into the track's cumulative fields.
/// Runs on the caller's transaction alongside the stats writes.
pub async fn add_track_play(
    conn: &mut SqliteConnection,
    track_id: Uuid,
    play_seconds: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE tracks SET play_count = play_count + 1,
             total_play_time_seconds = total_play_time_seconds + ?
         WHERE id = ?",
    )
    .bind(play_seconds)
    .bind(track_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fold one finalized play into the artist's cumulative fields
pub async fn add_artist_play(
    conn: &mut SqliteConnection,
    artist_id: Uuid,
    play_seconds: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE artists SET total_plays = total_plays + 1,
             total_play_time_seconds = total_play_time_seconds + ?
         WHERE id = ?",
    )
    .bind(play_seconds)
    .bind(artist_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
