use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

/// Per-origin synchronization trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronizationMode {
    Manual,
    Startup,
    Interval,
}

/// Per-origin transcode policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeMode {
    No,
    Unsupported,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub synchronization: SynchronizationMode,
    #[serde(default)]
    pub synchronization_interval_minutes: Option<u64>,
    pub transcode: TranscodeMode,
    #[serde(default)]
    pub transcode_unsupported: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub database_path: String,
    pub item_cache_dir: String,
    pub item_cache_size_mb: u64,
    pub item_cache_prune_threshold: f64,
    pub artwork_cache_dir: String,
    pub artwork_cache_size_mb: u64,
    pub artwork_cache_prune_threshold: f64,
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

fn default_state_path() -> String {
    "state.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(rename = "origin", default)]
    pub origins: Vec<OriginConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.item_cache_prune_threshold <= 0.0
            || self.provider.item_cache_prune_threshold >= 1.0
        {
            return Err(ConfigError::Invalid(
                "item_cache_prune_threshold must be in (0, 1)".to_string(),
            ));
        }

        if self.provider.artwork_cache_prune_threshold <= 0.0
            || self.provider.artwork_cache_prune_threshold >= 1.0
        {
            return Err(ConfigError::Invalid(
                "artwork_cache_prune_threshold must be in (0, 1)".to_string(),
            ));
        }

        for origin in &self.origins {
            if origin.synchronization == SynchronizationMode::Interval
                && origin.synchronization_interval_minutes.is_none()
            {
                return Err(ConfigError::Invalid(
                    "synchronization_interval_minutes is required when synchronization = interval"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_prune_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [provider]
            name = "home"
            database_path = "catalog.db"
            item_cache_dir = "cache/items"
            item_cache_size_mb = 10
            item_cache_prune_threshold = 1.5
            artwork_cache_dir = "cache/artwork"
            artwork_cache_size_mb = 10
            artwork_cache_prune_threshold = 0.2
            "#,
        )
        .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn interval_origin_requires_interval_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [provider]
            name = "home"
            database_path = "catalog.db"
            item_cache_dir = "cache/items"
            item_cache_size_mb = 10
            item_cache_prune_threshold = 0.2
            artwork_cache_dir = "cache/artwork"
            artwork_cache_size_mb = 10
            artwork_cache_prune_threshold = 0.2

            [[origin]]
            url = "https://example.com"
            username = "a"
            password = "b"
            synchronization = "interval"
            transcode = "no"
            "#,
        )
        .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
