//! Configuration loading

use anyhow::Result;
use plugfest_bridge::BridgeConfig;
use plugfest_discovery::CrawlerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Resource fetches allowed in flight during a crawl
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Per-fetch timeout in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Rediscovery interval in seconds (0 to discover once)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            interval_secs: default_interval(),
        }
    }
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_interval() -> u64 {
    300
}

impl Config {
    pub fn to_crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            max_concurrent_fetches: self.discovery.max_concurrent_fetches,
            fetch_timeout_ms: self.discovery.fetch_timeout_ms,
        }
    }

    pub fn rediscovery_interval(&self) -> Option<Duration> {
        (self.discovery.interval_secs > 0).then(|| Duration::from_secs(self.discovery.interval_secs))
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugfest_bridge::{ModelKind, QueuePolicy};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("plugfest.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bridge.url, None);
        assert_eq!(config.bridge.poll, 30);
        assert_eq!(config.discovery.interval_secs, 300);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[bridge]
url = "coap://192.168.1.20"
poll = 0
model = "generic"
queue = "last_value_wins"

[discovery]
fetch_timeout_ms = 1500
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.bridge.url.as_deref(), Some("coap://192.168.1.20"));
        assert_eq!(config.bridge.poll_interval(), None);
        assert_eq!(config.bridge.model, ModelKind::Generic);
        assert_eq!(config.bridge.queue, QueuePolicy::LastValueWins);
        assert_eq!(config.bridge.server_port, 22000);
        assert!(config.bridge.server);

        let crawler = config.to_crawler_config();
        assert_eq!(crawler.fetch_timeout_ms, 1500);
        assert_eq!(crawler.max_concurrent_fetches, 4);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[bridge]\npoll = \"often\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_rediscovery_interval() {
        let mut config = Config::default();
        assert_eq!(config.rediscovery_interval(), Some(Duration::from_secs(300)));
        config.discovery.interval_secs = 0;
        assert_eq!(config.rediscovery_interval(), None);
    }
}
