//! Configuration
//!
//! Handles the inputs the embedding application provides to the persistence
//! layer. Supports TOML config files with serde defaults for every field.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Persistence layer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for all data
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Payload size of every chunk record, in bytes
    #[serde(default = "default_chunk_len")]
    pub chunk_len: usize,

    /// Force dirty recovery at startup
    #[serde(default)]
    pub dirty: bool,

    /// KV cache for the archived fingerprint → metric index
    #[serde(default = "default_fingerprint_to_metric_cache")]
    pub fingerprint_to_metric_cache_size_bytes: usize,

    /// KV cache for the archived fingerprint → time-range index
    #[serde(default = "default_fingerprint_time_range_cache")]
    pub fingerprint_time_range_cache_size_bytes: usize,

    /// KV cache for the label name → label values index
    #[serde(default = "default_label_name_to_label_values_cache")]
    pub label_name_to_label_values_cache_size_bytes: usize,

    /// KV cache for the label pair → fingerprints index
    #[serde(default = "default_label_pair_to_fingerprints_cache")]
    pub label_pair_to_fingerprints_cache_size_bytes: usize,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./vigil_data")
}

fn default_chunk_len() -> usize {
    1024
}

fn default_fingerprint_to_metric_cache() -> usize {
    25 * 1024 * 1024
}

fn default_fingerprint_time_range_cache() -> usize {
    5 * 1024 * 1024
}

fn default_label_name_to_label_values_cache() -> usize {
    25 * 1024 * 1024
}

fn default_label_pair_to_fingerprints_cache() -> usize {
    25 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            chunk_len: default_chunk_len(),
            dirty: false,
            fingerprint_to_metric_cache_size_bytes: default_fingerprint_to_metric_cache(),
            fingerprint_time_range_cache_size_bytes: default_fingerprint_time_range_cache(),
            label_name_to_label_values_cache_size_bytes:
                default_label_name_to_label_values_cache(),
            label_pair_to_fingerprints_cache_size_bytes:
                default_label_pair_to_fingerprints_cache(),
        }
    }
}

impl Config {
    /// A default configuration rooted at the given directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_len, 1024);
        assert!(!config.dirty);
        assert_eq!(config.fingerprint_to_metric_cache_size_bytes, 25 * 1024 * 1024);
        assert_eq!(config.fingerprint_time_range_cache_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            base_path = "/var/lib/vigil"
            chunk_len = 512
            dirty = true
            "#,
        )
        .unwrap();

        assert_eq!(config.base_path, PathBuf::from("/var/lib/vigil"));
        assert_eq!(config.chunk_len, 512);
        assert!(config.dirty);
        // Untouched fields keep their defaults.
        assert_eq!(
            config.label_pair_to_fingerprints_cache_size_bytes,
            25 * 1024 * 1024
        );
    }
}
