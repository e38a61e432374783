use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::TourError;

pub const DEFAULT_CONFIG_FILE: &str = "tours.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub remote: Option<RemoteEntry>,
    #[serde(default)]
    pub fetch: Option<FetchEntry>,
    #[serde(default)]
    pub mapping_ttl_secs: Option<u64>,
    #[serde(default)]
    pub size_estimates: Option<SizeEstimateEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RemoteEntry {
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FetchEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SizeEstimateEntry {
    #[serde(default)]
    pub audio_bytes: Option<u64>,
    #[serde(default)]
    pub image_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Fallback sizes used when a downloaded file cannot be stat'ed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimates {
    pub audio_bytes: u64,
    pub image_bytes: u64,
}

impl Default for SizeEstimates {
    fn default() -> Self {
        Self {
            audio_bytes: 2 * 1024 * 1024,
            image_bytes: 500 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_dir: Option<Utf8PathBuf>,
    pub remote: Option<RemoteSettings>,
    pub fetch: FetchSettings,
    pub mapping_ttl: Duration,
    pub size_estimates: SizeEstimates,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            data_dir: None,
            remote: None,
            fetch: FetchSettings::default(),
            mapping_ttl: Duration::from_secs(300),
            size_estimates: SizeEstimates::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, TourError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| TourError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| TourError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, TourError> {
        let defaults = ResolvedConfig::default();

        let remote = match config.remote {
            Some(entry) => {
                let base_url = entry.base_url.trim().trim_end_matches('/').to_string();
                if base_url.is_empty() {
                    return Err(TourError::ConfigParse(
                        "remote.base_url must not be empty".to_string(),
                    ));
                }
                let api_key = entry
                    .api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty());
                Some(RemoteSettings {
                    base_url,
                    api_key,
                    timeout: Duration::from_secs(entry.timeout_secs.unwrap_or(15)),
                })
            }
            None => None,
        };

        let fetch = config
            .fetch
            .map(|entry| FetchSettings {
                max_attempts: entry
                    .max_attempts
                    .unwrap_or(defaults.fetch.max_attempts)
                    .max(1),
                backoff_base: entry
                    .backoff_base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.fetch.backoff_base),
                timeout: entry
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.fetch.timeout),
            })
            .unwrap_or(defaults.fetch);

        let size_estimates = config
            .size_estimates
            .map(|entry| SizeEstimates {
                audio_bytes: entry
                    .audio_bytes
                    .unwrap_or(defaults.size_estimates.audio_bytes),
                image_bytes: entry
                    .image_bytes
                    .unwrap_or(defaults.size_estimates.image_bytes),
            })
            .unwrap_or(defaults.size_estimates);

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            data_dir: config.data_dir.map(Utf8PathBuf::from),
            remote,
            fetch,
            mapping_ttl: config
                .mapping_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.mapping_ttl),
            size_estimates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert!(resolved.remote.is_none());
        assert_eq!(resolved.fetch.max_attempts, 3);
        assert_eq!(resolved.fetch.backoff_base, Duration::from_secs(1));
        assert_eq!(resolved.mapping_ttl, Duration::from_secs(300));
    }

    #[test]
    fn zero_attempts_is_clamped() {
        let config = Config {
            fetch: Some(FetchEntry {
                max_attempts: Some(0),
                ..FetchEntry::default()
            }),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.fetch.max_attempts, 1);
    }
}
