//! Configuration loading and parsing.
//!
//! Defines the server config schema and resolves defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use favsongs_types::{Settings, SettingsPatch};

use crate::collection_cache::DEFAULT_CACHE_TTL_MS;

pub const DEFAULT_DB_PATH: &str = "data/favsongs.db";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_COLLECTION_DESCRIPTION: &str = "Tracks played most often, collected automatically.";

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// SQLite database path.
    pub db_path: Option<String>,
    /// Lifetime of cached collection membership in seconds.
    pub collection_cache_ttl_secs: Option<u64>,
    /// Provider web API settings.
    pub provider: Option<ProviderConfig>,
    /// Initial settings for newly linked accounts.
    pub defaults: Option<DefaultsConfig>,
}

/// Provider web API settings.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderConfig {
    /// Base URL (defaults to https://api.spotify.com/v1).
    pub api_base_url: Option<String>,
    /// Per-request timeout in seconds (default: 20).
    pub request_timeout_secs: Option<u64>,
    /// Description used when a collection has to be created.
    pub collection_description: Option<String>,
}

/// Per-account settings defaults; same ranges as a settings update.
#[derive(Debug, Default, Deserialize)]
pub struct DefaultsConfig {
    pub favorite_threshold: Option<u32>,
    pub min_completion_ratio: Option<f64>,
    pub check_interval_secs: Option<u64>,
    pub min_play_gap_ms: Option<u64>,
    pub restart_margin_ms: Option<u64>,
    pub collection_name: Option<String>,
    pub collection_public: Option<bool>,
    pub auto_add_enabled: Option<bool>,
}

/// Resolved provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfigResolved {
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub collection_description: String,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Database path from config, falling back to `data/favsongs.db`.
pub fn db_path_from_config(cfg: &ServerConfig) -> PathBuf {
    cfg.db_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

/// Collection cache TTL in milliseconds.
pub fn cache_ttl_from_config(cfg: &ServerConfig) -> Result<i64> {
    let Some(secs) = cfg.collection_cache_ttl_secs else {
        return Ok(DEFAULT_CACHE_TTL_MS);
    };
    if secs == 0 {
        return Err(anyhow::anyhow!("collection_cache_ttl_secs must be positive"));
    }
    i64::try_from(secs.saturating_mul(1000))
        .with_context(|| format!("collection_cache_ttl_secs too large: {secs}"))
}

pub fn provider_from_config(cfg: &ServerConfig) -> Result<ProviderConfigResolved> {
    let provider = cfg.provider.as_ref();
    let api_base_url = provider
        .and_then(|p| p.api_base_url.as_deref())
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(DEFAULT_API_BASE_URL)
        .trim_end_matches('/')
        .to_string();
    if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
        return Err(anyhow::anyhow!(
            "provider.api_base_url must be an http(s) URL, got {api_base_url}"
        ));
    }
    let timeout_secs = provider
        .and_then(|p| p.request_timeout_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(anyhow::anyhow!("provider.request_timeout_secs must be positive"));
    }
    let collection_description = provider
        .and_then(|p| p.collection_description.clone())
        .unwrap_or_else(|| DEFAULT_COLLECTION_DESCRIPTION.to_string());
    Ok(ProviderConfigResolved {
        api_base_url,
        request_timeout: Duration::from_secs(timeout_secs),
        collection_description,
    })
}

/// Settings applied to accounts whose settings row does not exist yet.
pub fn defaults_from_config(cfg: &ServerConfig) -> Result<Settings> {
    let mut settings = Settings::default();
    let Some(defaults) = cfg.defaults.as_ref() else {
        return Ok(settings);
    };
    let patch = SettingsPatch {
        favorite_threshold: defaults.favorite_threshold,
        min_completion_ratio: defaults.min_completion_ratio,
        check_interval_secs: defaults.check_interval_secs,
        min_play_gap_ms: defaults.min_play_gap_ms,
        restart_margin_ms: defaults.restart_margin_ms,
        collection_name: defaults.collection_name.clone(),
        collection_public: defaults.collection_public,
        auto_add_enabled: defaults.auto_add_enabled,
    };
    patch
        .validate()
        .map_err(|msg| anyhow::anyhow!("invalid [defaults]: {msg}"))?;
    patch.apply_to(&mut settings);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(db_path_from_config(&cfg), PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cache_ttl_from_config(&cfg).unwrap(), 300_000);
        assert_eq!(defaults_from_config(&cfg).unwrap(), Settings::default());

        let provider = provider_from_config(&cfg).unwrap();
        assert_eq!(provider.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(provider.request_timeout, Duration::from_secs(20));
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"
            db_path = "/var/lib/favsongs/db.sqlite"
            collection_cache_ttl_secs = 60

            [provider]
            api_base_url = "http://127.0.0.1:9000/v1/"
            request_timeout_secs = 5

            [defaults]
            favorite_threshold = 3
            check_interval_secs = 30
            collection_name = "Keepers"
            collection_public = false
        "#;
        let cfg: ServerConfig = toml::from_str(raw).unwrap();

        assert_eq!(db_path_from_config(&cfg), PathBuf::from("/var/lib/favsongs/db.sqlite"));
        assert_eq!(cache_ttl_from_config(&cfg).unwrap(), 60_000);

        let provider = provider_from_config(&cfg).unwrap();
        assert_eq!(provider.api_base_url, "http://127.0.0.1:9000/v1");
        assert_eq!(provider.request_timeout, Duration::from_secs(5));

        let defaults = defaults_from_config(&cfg).unwrap();
        assert_eq!(defaults.favorite_threshold, 3);
        assert_eq!(defaults.check_interval_secs, 30);
        assert_eq!(defaults.collection_name, "Keepers");
        assert!(!defaults.collection_public);
        assert_eq!(defaults.min_completion_ratio, 0.8);
    }

    #[test]
    fn rejects_out_of_range_defaults() {
        let cfg = ServerConfig {
            defaults: Some(DefaultsConfig {
                min_completion_ratio: Some(0.1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(defaults_from_config(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_provider_url_and_zero_ttl() {
        let cfg = ServerConfig {
            collection_cache_ttl_secs: Some(0),
            provider: Some(ProviderConfig {
                api_base_url: Some("ftp://example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(provider_from_config(&cfg).is_err());
        assert!(cache_ttl_from_config(&cfg).is_err());
    }

    #[test]
    fn blank_db_path_falls_back() {
        let cfg = ServerConfig {
            db_path: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(db_path_from_config(&cfg), PathBuf::from(DEFAULT_DB_PATH));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/favsongs.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
