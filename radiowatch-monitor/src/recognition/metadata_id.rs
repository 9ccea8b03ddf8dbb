//! Secondary external provider: metadata catalogue lookup
//!
//! Searches a MusicBrainz-style catalogue by the sample's content
//! fingerprint. Matches are rarer than the acoustic provider's but carry
//! richer metadata (album, ISRC, label, catalogue ids) that gets merged
//! into the track row. Rate limited to 1 request per second.

use super::audio_id::RateLimiter;
use super::{AudioSample, ProviderMatch, RecognitionProvider, CONFIDENCE_METADATA_ID};
use crate::db::tracks::TrackMetadata;
use async_trait::async_trait;
use radiowatch_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://musicbrainz.org/ws/2";
const USER_AGENT: &str = "Radiowatch/0.1.0 (+https://github.com/radiowatch/radiowatch)";
const RATE_LIMIT_MS: u64 = 1000; // 1 request per second

/// Catalogue search response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueResponse {
    #[serde(default)]
    pub recordings: Vec<CatalogueRecording>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueRecording {
    pub id: String,
    pub title: String,
    pub length: Option<u64>,
    #[serde(rename = "artist-credit", default)]
    pub artist_credit: Vec<CatalogueArtistCredit>,
    pub releases: Option<Vec<CatalogueRelease>>,
    #[serde(default)]
    pub isrcs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueArtistCredit {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueRelease {
    pub id: String,
    pub title: String,
    pub date: Option<String>,
    #[serde(rename = "label-info", default)]
    pub label_info: Vec<CatalogueLabelInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueLabelInfo {
    pub label: Option<CatalogueLabel>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogueLabel {
    pub name: String,
}

/// Metadata catalogue client
pub struct MetadataIdClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    base_url: String,
}

impl MetadataIdClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(e.to_string()))?;

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn search(&self, fingerprint: &str) -> Result<CatalogueResponse> {
        self.rate_limiter.wait().await;

        let url = format!(
            "{}/recording?query=fingerprint:{}&fmt=json&limit=1",
            self.base_url, fingerprint
        );

        tracing::debug!("Querying metadata catalogue");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "catalogue returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("parse failed: {}", e)))
    }

    /// Flatten a catalogue recording into provider metadata
    fn metadata_from(recording: &CatalogueRecording) -> Option<TrackMetadata> {
        if recording.title.is_empty() {
            return None;
        }
        let artist = recording.artist_credit.first()?.name.clone();

        let release = recording.releases.as_ref().and_then(|r| r.first());
        let album = release.map(|r| r.title.clone());
        let label = release.and_then(|r| {
            r.label_info
                .iter()
                .find_map(|info| info.label.as_ref().map(|l| l.name.clone()))
        });

        Some(TrackMetadata {
            title: recording.title.clone(),
            artist,
            album,
            isrc: recording.isrcs.first().cloned(),
            label,
            external_id: Some(recording.id.clone()),
        })
    }
}

#[async_trait]
impl RecognitionProvider for MetadataIdClient {
    fn source(&self) -> &'static str {
        "metadata_id"
    }

    fn confidence(&self) -> f64 {
        CONFIDENCE_METADATA_ID
    }

    async fn identify(&self, sample: &AudioSample) -> Result<Option<ProviderMatch>> {
        let response = self.search(&sample.fingerprint).await?;

        let metadata = match response.recordings.first().and_then(Self::metadata_from) {
            Some(metadata) => metadata,
            None => return Ok(None),
        };

        tracing::info!(
            title = %metadata.title,
            artist = %metadata.artist,
            album = ?metadata.album,
            "Metadata catalogue match"
        );

        Ok(Some(ProviderMatch::External(metadata)))
    }
}
