//! Engine configuration stored as `config.toml` in the data directory.
//!
//! Missing file means defaults; unknown fields are ignored so older data
//! directories keep working after upgrades.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_SAFE_RADIUS_METERS: f64 = 500.0;
pub const DEFAULT_CACHE_TTL_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TendConfig {
    /// Base URL of the remote link authority (`/links/check`, `/links/dissolve`).
    #[serde(default)]
    pub authority_url: Option<String>,
    /// URL the alert sender posts payloads to.
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default = "default_safe_radius")]
    pub safe_radius_m: f64,
    /// Bound on every remote verification / notification call.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,
    /// TTL of the last-known-location fast path.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
}

fn default_safe_radius() -> f64 {
    DEFAULT_SAFE_RADIUS_METERS
}

fn default_verify_timeout() -> u64 {
    DEFAULT_VERIFY_TIMEOUT_MS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

impl Default for TendConfig {
    fn default() -> Self {
        Self {
            authority_url: None,
            notify_url: None,
            safe_radius_m: DEFAULT_SAFE_RADIUS_METERS,
            verify_timeout_ms: DEFAULT_VERIFY_TIMEOUT_MS,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Toml(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load the config, returning defaults if the file doesn't exist.
pub fn load_config(data_dir: &Path) -> Result<TendConfig, ConfigError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(TendConfig::default());
    }
    let contents = fs::read_to_string(&path)?;
    toml::from_str(&contents).map_err(|e| ConfigError::Toml(e.to_string()))
}

/// Save the config.
pub fn save_config(data_dir: &Path, config: &TendConfig) -> Result<(), ConfigError> {
    let path = config_path(data_dir);
    let contents =
        toml::to_string_pretty(config).map_err(|e| ConfigError::Toml(e.to_string()))?;
    fs::write(&path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let dir = std::env::temp_dir().join("tend-config-test-absent");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = load_config(&dir).unwrap();
        assert_eq!(config.safe_radius_m, DEFAULT_SAFE_RADIUS_METERS);
        assert_eq!(config.verify_timeout_ms, DEFAULT_VERIFY_TIMEOUT_MS);
        assert!(config.authority_url.is_none());
    }

    #[test]
    fn roundtrip() {
        let dir = std::env::temp_dir().join("tend-config-test-roundtrip");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = TendConfig {
            authority_url: Some("http://auth.example".to_string()),
            notify_url: Some("http://notify.example/send".to_string()),
            safe_radius_m: 750.0,
            verify_timeout_ms: 2500,
            cache_ttl_ms: 1000,
        };
        save_config(&dir, &config).unwrap();
        let back = load_config(&dir).unwrap();
        assert_eq!(back.authority_url.as_deref(), Some("http://auth.example"));
        assert_eq!(back.safe_radius_m, 750.0);
        assert_eq!(back.verify_timeout_ms, 2500);
    }
}
