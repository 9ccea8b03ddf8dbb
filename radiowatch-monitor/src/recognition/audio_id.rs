//! Primary external provider: acoustic-ID lookup
//!
//! Posts the sample's content fingerprint and decoded duration to an
//! AcoustID-style endpoint and takes the best-scoring recording. Rate
//! limited to 3 requests per second per the service's usage policy.

use super::{AudioSample, ProviderMatch, RecognitionProvider, CONFIDENCE_AUDIO_ID};
use crate::db::tracks::TrackMetadata;
use async_trait::async_trait;
use radiowatch_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "https://api.acoustid.org/v2/lookup";
const USER_AGENT: &str = "Radiowatch/0.1.0 (+https://github.com/radiowatch/radiowatch)";
const RATE_LIMIT_MS: u64 = 334; // 3 requests per second
const MIN_SCORE: f64 = 0.5;

/// Lookup response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioIdResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<AudioIdResult>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioIdResult {
    pub id: String,
    pub score: f64, // 0.0 to 1.0
    pub recordings: Option<Vec<AudioIdRecording>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioIdRecording {
    pub id: String,
    pub title: Option<String>,
    pub artists: Option<Vec<AudioIdArtist>>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioIdArtist {
    pub id: String,
    pub name: String,
}

/// Minimum-interval rate limiter shared across concurrent cycles
pub(crate) struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub(crate) fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    pub(crate) async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Provider rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// Acoustic-ID provider client
pub struct AudioIdClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    api_key: String,
    base_url: String,
}

impl AudioIdClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(e.to_string()))?;

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn lookup(&self, fingerprint: &str, duration_seconds: u64) -> Result<AudioIdResponse> {
        self.rate_limiter.wait().await;

        let params = [
            ("client", self.api_key.as_str()),
            ("meta", "recordings recordingids"),
            ("duration", &duration_seconds.to_string()),
            ("fingerprint", fingerprint),
        ];

        tracing::debug!(duration_seconds, "Querying acoustic-ID provider");

        let response = self
            .http_client
            .post(&self.base_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {}", e)))?;

        let status = response.status();

        if status == 401 {
            return Err(Error::Provider("invalid API key".to_string()));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "provider returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("parse failed: {}", e)))
    }

    /// Best recording from a lookup, filtered by minimum match score
    fn best_recording(response: &AudioIdResponse) -> Option<&AudioIdRecording> {
        let top = response.results.iter().find(|r| r.score >= MIN_SCORE)?;
        top.recordings.as_ref()?.first()
    }
}

#[async_trait]
impl RecognitionProvider for AudioIdClient {
    fn source(&self) -> &'static str {
        "audio_id"
    }

    fn confidence(&self) -> f64 {
        CONFIDENCE_AUDIO_ID
    }

    async fn identify(&self, sample: &AudioSample) -> Result<Option<ProviderMatch>> {
        let duration = sample.duration_seconds().round() as u64;
        let response = self.lookup(&sample.fingerprint, duration).await?;

        let recording = match Self::best_recording(&response) {
            Some(recording) => recording,
            None => return Ok(None),
        };

        let title = match &recording.title {
            Some(title) if !title.is_empty() => title.clone(),
            _ => return Ok(None),
        };
        let artist = match recording.artists.as_ref().and_then(|a| a.first()) {
            Some(artist) => artist.name.clone(),
            None => return Ok(None),
        };

        tracing::info!(
            recording_id = %recording.id,
            title = %title,
            artist = %artist,
            "Acoustic-ID match"
        );

        Ok(Some(ProviderMatch::External(TrackMetadata {
            title,
            artist,
            external_id: Some(recording.id.clone()),
            ..Default::default()
        })))
    }
}
