//! Configuration file support for coinproxy.
//!
//! Loads optional TOML config from `~/.config/coinproxy/config.toml`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::Asset;

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Server bind address (e.g., "127.0.0.1:8080")
    pub bind: Option<String>,
    /// Provider API root (default: public CoinGecko v3)
    pub upstream_base_url: Option<String>,
    /// Provider API key, sent on every upstream request when set
    pub upstream_api_key: Option<String>,
    /// Header carrying the API key (default: "x-cg-demo-api-key")
    pub upstream_api_key_header: Option<String>,
    /// Upstream request timeout in milliseconds (default: 10000)
    pub upstream_timeout_ms: Option<u64>,
    /// Extra attempts for transient upstream failures (default: 0)
    pub upstream_retries: Option<u32>,
    /// Delay between retries in milliseconds (default: 250)
    pub retry_backoff_ms: Option<u64>,
    /// TTL for current prices in seconds (default: 60)
    pub snapshot_ttl_seconds: Option<u64>,
    /// TTL for chart and price-history series in seconds (default: 300)
    pub series_ttl_seconds: Option<u64>,
    /// Serve expired entries when a refetch fails (default: true)
    pub serve_stale_on_error: Option<bool>,
    /// How long a health-check ping result is reused, in seconds (default: 30)
    pub reachability_ttl_seconds: Option<u64>,
    /// One in-flight upstream fetch per cache key (default: true)
    pub coalesce_requests: Option<bool>,
    /// Tracked assets (default: BTC, ETH, SOL, ADA, DOGE)
    pub tracked_assets: Option<Vec<Asset>>,
    /// Asset shown by the fixed 7-day chart endpoint (default: "bitcoin")
    pub chart_asset: Option<String>,
    /// Rate limit in requests per minute per IP
    pub rate_limit_rpm: Option<u32>,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
    /// API keys for authentication (None/empty = no auth)
    pub api_keys: Option<Vec<String>>,
    /// Maximum number of cache keys (default: 1000)
    pub cache_max_entries: Option<u64>,
}

impl Config {
    /// Default config location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("coinproxy")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load config from `path`, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            bind = "0.0.0.0:9000"
            snapshot_ttl_seconds = 30
            serve_stale_on_error = false
            chart_asset = "ethereum"
            api_keys = ["k1"]

            [[tracked_assets]]
            id = "bitcoin"
            symbol = "BTC"

            [[tracked_assets]]
            id = "ethereum"
            symbol = "ETH"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.snapshot_ttl_seconds, Some(30));
        assert_eq!(config.serve_stale_on_error, Some(false));
        assert_eq!(config.tracked_assets.as_ref().map(Vec::len), Some(2));
        assert_eq!(config.series_ttl_seconds, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/coinproxy/config.toml"));
        assert!(config.bind.is_none());
        assert!(config.tracked_assets.is_none());
    }
}
