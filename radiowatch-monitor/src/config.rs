//! Monitor configuration
//!
//! Defaults compiled in, overridden by `monitor.toml` (located through the
//! shared config search path), overridden by environment variables. The
//! policy constants (duration clamps, gate weights) are compiled into their
//! owning modules; this covers the operational knobs.

use radiowatch_common::config::{env_override, load_toml, locate_config_file, resolve_api_key};
use radiowatch_common::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const AUDIO_ID_KEY_ENV: &str = "RADIOWATCH_AUDIO_ID_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Seconds between polling rounds over the active station list
    pub poll_interval_seconds: u64,

    /// Cap on concurrent station cycles
    pub station_concurrency: usize,

    /// Tighter cap on concurrent decode + feature extraction stages
    pub analysis_concurrency: usize,

    /// Per-station stream fetch timeout in seconds
    pub fetch_timeout_seconds: u64,

    /// Bytes to capture per stream sample
    pub max_sample_bytes: usize,

    /// Music-likelihood threshold (0-100) below which a sample is non-music
    pub music_threshold: f64,

    /// Timeout for external recognition provider calls in seconds
    pub provider_timeout_seconds: u64,

    /// Event bus channel capacity
    pub event_capacity: usize,

    /// Hours between aggregate reconciliation passes (0 disables)
    pub recompute_interval_hours: u64,

    /// Acoustic-ID provider API key (environment variable wins)
    pub audio_id_api_key: Option<String>,

    /// Whether to query the metadata catalogue provider
    pub metadata_id_enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("radiowatch.db"),
            poll_interval_seconds: 60,
            station_concurrency: 10,
            analysis_concurrency: 4,
            fetch_timeout_seconds: 30,
            max_sample_bytes: 1024 * 1024,
            music_threshold: crate::analysis::DEFAULT_MUSIC_THRESHOLD,
            provider_timeout_seconds: 10,
            event_capacity: 256,
            recompute_interval_hours: 24,
            audio_id_api_key: None,
            metadata_id_enabled: true,
        }
    }
}

impl MonitorConfig {
    /// Load configuration: TOML file if present, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match locate_config_file("monitor") {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading monitor configuration");
                load_toml(&path)?
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RADIOWATCH_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        self.poll_interval_seconds =
            env_override("RADIOWATCH_POLL_INTERVAL", self.poll_interval_seconds);
        self.station_concurrency =
            env_override("RADIOWATCH_STATION_CONCURRENCY", self.station_concurrency);
        self.analysis_concurrency =
            env_override("RADIOWATCH_ANALYSIS_CONCURRENCY", self.analysis_concurrency);
        self.music_threshold = env_override("RADIOWATCH_MUSIC_THRESHOLD", self.music_threshold);
        self.audio_id_api_key =
            resolve_api_key(AUDIO_ID_KEY_ENV, self.audio_id_api_key.as_deref());
    }

    fn validate(&self) -> Result<()> {
        if self.station_concurrency == 0 {
            return Err(Error::Config("station_concurrency must be > 0".to_string()));
        }
        if self.analysis_concurrency == 0 {
            return Err(Error::Config(
                "analysis_concurrency must be > 0".to_string(),
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(Error::Config("poll_interval_seconds must be > 0".to_string()));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(Error::Config("fetch_timeout_seconds must be > 0".to_string()));
        }
        if self.max_sample_bytes == 0 {
            return Err(Error::Config("max_sample_bytes must be > 0".to_string()));
        }
        if !(0.0..=100.0).contains(&self.music_threshold) {
            return Err(Error::Config(format!(
                "music_threshold must be within 0-100, got {}",
                self.music_threshold
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }
}
