//! Local fingerprint store
//!
//! First cascade step: matches the sample against tracks already known to
//! this installation, by raw-sample-hash cache first (skips nothing here,
//! but survives re-encodes of the identical capture) and then by content
//! fingerprint. No network involved, so this source never rate limits.

use super::{AudioSample, ProviderMatch, RecognitionProvider, CONFIDENCE_LOCAL};
use crate::db::tracks;
use async_trait::async_trait;
use radiowatch_common::{Error, Result};
use sqlx::SqlitePool;

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecognitionProvider for LocalStore {
    fn source(&self) -> &'static str {
        "local"
    }

    fn confidence(&self) -> f64 {
        CONFIDENCE_LOCAL
    }

    async fn identify(&self, sample: &AudioSample) -> Result<Option<ProviderMatch>> {
        // Exact raw-bytes capture seen before: reuse its fingerprint
        let fingerprint =
            match tracks::find_fingerprint_by_sample_hash(&self.pool, &sample.sample_hash)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
            {
                Some(cached) => cached,
                None => sample.fingerprint.clone(),
            };

        let track = tracks::find_track_by_fingerprint(&self.pool, &fingerprint)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        match track {
            Some(track) => {
                tracks::cache_sample_hash(&self.pool, &sample.sample_hash, &fingerprint)
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(Some(ProviderMatch::Existing { track_id: track.id }))
            }
            None => Ok(None),
        }
    }
}
