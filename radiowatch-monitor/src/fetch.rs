//! Stream fetching
//!
//! Downloads a bounded-size audio sample from a station's stream URL and
//! performs the lightweight health probe. Both paths run under the shared
//! retry policy; a fetch that exhausts its retries surfaces as a
//! station-cycle failure, never as an orchestrator fault.

use futures::StreamExt;
use radiowatch_common::retry::RetryPolicy;
use radiowatch_common::{Error, Result};
use std::time::Duration;

const USER_AGENT: &str = "Radiowatch/0.1.0 (+https://github.com/radiowatch/radiowatch)";

/// One fetched sample: raw container bytes plus the stream's content type
#[derive(Debug, Clone)]
pub struct FetchedSample {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Health probe result
#[derive(Debug, Clone)]
pub struct StreamHealth {
    pub reachable: bool,
    pub status: u16,
    pub content_type: Option<String>,
}

impl StreamHealth {
    /// Status 2xx and an audio-ish content type
    pub fn is_healthy(&self) -> bool {
        self.reachable
            && (200..300).contains(&(self.status as i32))
            && self
                .content_type
                .as_deref()
                .map(is_audio_content_type)
                .unwrap_or(false)
    }
}

fn is_audio_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("audio/") || ct.starts_with("application/ogg")
}

/// Stream sample fetcher
pub struct StreamFetcher {
    http: reqwest::Client,
    fetch_timeout: Duration,
    max_sample_bytes: usize,
    retry: RetryPolicy,
}

impl StreamFetcher {
    pub fn new(fetch_timeout: Duration, max_sample_bytes: usize, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;

        Ok(Self {
            http,
            fetch_timeout,
            max_sample_bytes,
            retry,
        })
    }

    /// Download up to `max_sample_bytes` from the stream, with retries.
    ///
    /// Live streams never end, so the read stops at the byte bound or the
    /// per-station timeout, whichever comes first. A timeout after some
    /// audio arrived is a usable (shorter) sample; a timeout with nothing
    /// read is a fetch failure.
    pub async fn fetch_sample(&self, stream_url: &str) -> Result<FetchedSample> {
        self.retry
            .run("stream sample fetch", || self.fetch_once(stream_url))
            .await
    }

    async fn fetch_once(&self, stream_url: &str) -> Result<FetchedSample> {
        tracing::debug!(url = stream_url, "Fetching stream sample");

        let fetch = async {
            let response = self
                .http
                .get(stream_url)
                .send()
                .await
                .map_err(|e| Error::Fetch(format!("request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Fetch(format!("stream returned status {}", status)));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let mut bytes = Vec::with_capacity(self.max_sample_bytes.min(1 << 20));
            let mut body = response.bytes_stream();

            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| Error::Fetch(format!("read failed: {}", e)))?;
                let remaining = self.max_sample_bytes - bytes.len();
                bytes.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                if bytes.len() >= self.max_sample_bytes {
                    break;
                }
            }

            Ok(FetchedSample {
                bytes,
                content_type,
            })
        };

        let sample = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Fetch(format!(
                    "timed out after {:?}",
                    self.fetch_timeout
                )))
            }
        };

        if sample.bytes.is_empty() {
            return Err(Error::Fetch("stream produced no data".to_string()));
        }

        tracing::debug!(
            url = stream_url,
            bytes = sample.bytes.len(),
            content_type = ?sample.content_type,
            "Stream sample fetched"
        );

        Ok(sample)
    }

    /// Lightweight stream-health probe: status and content-type only, body
    /// dropped immediately. Retried like the fetch.
    pub async fn probe(&self, stream_url: &str) -> Result<StreamHealth> {
        self.retry
            .run("stream health probe", || self.probe_once(stream_url))
            .await
    }

    async fn probe_once(&self, stream_url: &str) -> Result<StreamHealth> {
        let probe = async {
            let response = self
                .http
                .get(stream_url)
                .send()
                .await
                .map_err(|e| Error::Fetch(format!("probe failed: {}", e)))?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            Ok(StreamHealth {
                reachable: true,
                status,
                content_type,
            })
        };

        match tokio::time::timeout(self.fetch_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(Error::Fetch(format!(
                "probe timed out after {:?}",
                self.fetch_timeout
            ))),
        }
    }
}
