//! Configuration loading helpers
//!
//! Resolution priority, highest first: environment variable, TOML config
//! file, compiled default. Each service deserializes its own TOML section;
//! this module only knows how to locate and parse the file.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Locate the configuration file for a service.
///
/// Checks, in order:
/// 1. `RADIOWATCH_CONFIG` environment variable
/// 2. `~/.config/radiowatch/<service>.toml` (platform config dir)
/// 3. `/etc/radiowatch/<service>.toml` (linux system-wide)
///
/// Returns `None` when no file exists; callers fall back to defaults.
pub fn locate_config_file(service: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("RADIOWATCH_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(
            path = %path.display(),
            "RADIOWATCH_CONFIG points at a missing file, ignoring"
        );
    }

    let file_name = format!("{}.toml", service);

    if let Some(dir) = dirs::config_dir() {
        let path = dir.join("radiowatch").join(&file_name);
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let path = PathBuf::from("/etc/radiowatch").join(&file_name);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Parse a TOML config file into the service's config type
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Environment variable override: returns the parsed value when the variable
/// is set and parses, otherwise the fallback.
pub fn env_override<T: std::str::FromStr>(var: &str, fallback: T) -> T {
    match std::env::var(var) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var, value = %raw, "Unparseable environment override, using fallback");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

/// Validate a credential value (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve a provider credential from ENV then TOML.
///
/// Warns when both sources carry a value (potential misconfiguration);
/// ENV wins. Returns `None` when neither source has a usable key.
pub fn resolve_api_key(env_var: &str, toml_value: Option<&str>) -> Option<String> {
    let env_key = std::env::var(env_var).ok().filter(|k| is_valid_key(k));
    let toml_key = toml_value.filter(|k| is_valid_key(k)).map(str::to_string);

    if env_key.is_some() && toml_key.is_some() {
        tracing::warn!(
            env_var,
            "API key found in both environment and TOML config. Using environment (highest priority)."
        );
    }

    match (env_key, toml_key) {
        (Some(key), _) => {
            tracing::info!(env_var, "API key loaded from environment variable");
            Some(key)
        }
        (None, Some(key)) => {
            tracing::info!(env_var, "API key loaded from TOML config");
            Some(key)
        }
        (None, None) => None,
    }
}
