//! Track recognition
//!
//! Orders recognition sources by priority and returns the first confident
//! match. A source that errors or times out counts as "no match from that
//! source" and the next one is tried; only exhausting every source yields
//! an unidentified outcome.

pub mod audio_id;
pub mod local_store;
pub mod metadata_id;

use crate::analysis::DecodedAudio;
use crate::db::tracks::{self, TrackMetadata};
use async_trait::async_trait;
use radiowatch_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

pub use audio_id::AudioIdClient;
pub use local_store::LocalStore;
pub use metadata_id::MetadataIdClient;

/// Fixed per-source confidence: exact local fingerprint match
pub const CONFIDENCE_LOCAL: f64 = 100.0;
/// Fixed per-source confidence: primary external (acoustic) provider
pub const CONFIDENCE_AUDIO_ID: f64 = 90.0;
/// Fixed per-source confidence: secondary external (metadata) provider
pub const CONFIDENCE_METADATA_ID: f64 = 85.0;

/// One audio sample prepared for recognition: raw bytes, decoded PCM, and
/// the two content hashes every source keys on. Hashed once here so no
/// source recomputes them.
#[derive(Debug, Clone)]
pub struct AudioSample {
    /// Raw container bytes as fetched from the stream
    pub raw_bytes: Vec<u8>,
    /// Decoded mono PCM
    pub audio: DecodedAudio,
    /// SHA-256 of the decoded PCM (content fingerprint, codec-independent)
    pub fingerprint: String,
    /// SHA-256 of the raw container bytes (cheap pre-decode cache key)
    pub sample_hash: String,
}

impl AudioSample {
    /// Hash the sample on a blocking thread and bundle it for the cascade
    pub async fn prepare(raw_bytes: Vec<u8>, audio: DecodedAudio) -> Result<Self> {
        let pcm = audio.samples.clone();
        let raw = raw_bytes.clone();

        let (fingerprint, sample_hash) = tokio::task::spawn_blocking(move || {
            let mut hasher = Sha256::new();
            for sample in &pcm {
                hasher.update(sample.to_le_bytes());
            }
            let fingerprint = format!("{:x}", hasher.finalize());

            let mut hasher = Sha256::new();
            hasher.update(&raw);
            let sample_hash = format!("{:x}", hasher.finalize());

            (fingerprint, sample_hash)
        })
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))?;

        Ok(Self {
            raw_bytes,
            audio,
            fingerprint,
            sample_hash,
        })
    }

    /// Decoded sample length in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.audio.duration_seconds
    }
}

/// What a single recognition source reports for a sample
#[derive(Debug, Clone)]
pub enum ProviderMatch {
    /// The sample matched a track already in the local store
    Existing { track_id: Uuid },
    /// An external provider identified the track; metadata still has to be
    /// resolved to a local Track row
    External(TrackMetadata),
}

/// A resolved cascade match
#[derive(Debug, Clone)]
pub struct RecognizedTrack {
    pub track_id: Uuid,
    pub confidence: f64,
    /// Which source matched ("local", "audio_id", "metadata_id")
    pub source: &'static str,
}

/// One recognition source in the cascade
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Source tag recorded on detections this provider produces
    fn source(&self) -> &'static str;

    /// Fixed confidence assigned to this source's matches
    fn confidence(&self) -> f64;

    /// Try to identify the sample. `Ok(None)` means this source has no
    /// match; `Err` is treated the same by the cascade.
    async fn identify(&self, sample: &AudioSample) -> Result<Option<ProviderMatch>>;
}

/// Ordered recognition cascade, first match wins
pub struct RecognitionCascade {
    pool: SqlitePool,
    providers: Vec<Box<dyn RecognitionProvider>>,
}

impl RecognitionCascade {
    pub fn new(pool: SqlitePool, providers: Vec<Box<dyn RecognitionProvider>>) -> Self {
        Self { pool, providers }
    }

    /// Try each source in priority order; resolve the first match to a
    /// local track id. Returns `Ok(None)` when every source passed.
    pub async fn identify(&self, sample: &AudioSample) -> Result<Option<RecognizedTrack>> {
        for provider in &self.providers {
            let result = match provider.identify(sample).await {
                Ok(result) => result,
                Err(e) => {
                    // Provider failure is a pass, not a cascade abort
                    tracing::warn!(
                        source = provider.source(),
                        error = %e,
                        "Recognition source failed, trying next"
                    );
                    continue;
                }
            };

            let provider_match = match result {
                Some(m) => m,
                None => {
                    tracing::debug!(source = provider.source(), "No match from source");
                    continue;
                }
            };

            let track_id = self.resolve_match(sample, provider_match).await?;

            tracing::info!(
                source = provider.source(),
                track_id = %track_id,
                confidence = provider.confidence(),
                "Track recognized"
            );

            return Ok(Some(RecognizedTrack {
                track_id,
                confidence: provider.confidence(),
                source: provider.source(),
            }));
        }

        tracing::debug!(
            fingerprint = %&sample.fingerprint[..12],
            "Sample unidentified by all sources"
        );
        Ok(None)
    }

    /// Turn a provider match into a local track id, creating or enriching
    /// the track row for external matches and caching the sample hash so
    /// the local store short-circuits the same audio next time.
    async fn resolve_match(
        &self,
        sample: &AudioSample,
        provider_match: ProviderMatch,
    ) -> Result<Uuid> {
        match provider_match {
            ProviderMatch::Existing { track_id } => Ok(track_id),
            ProviderMatch::External(metadata) => {
                let track =
                    tracks::create_or_update_track(&self.pool, &metadata, Some(sample.fingerprint.as_str()))
                        .await
                        .map_err(|e| Error::Internal(e.to_string()))?;
                tracks::cache_sample_hash(&self.pool, &sample.sample_hash, &sample.fingerprint)
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(track.id)
            }
        }
    }
}
