//! Consenter configuration.
//!
//! Process-wide broker connection options, loaded once from TOML and handed
//! to the [`Consenter`](crate::consenter::Consenter) factory. Per-channel
//! options (batch timeout, the channel's broker list) arrive through
//! [`SharedConfig`](crate::support::SharedConfig) instead.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_BROKER_VERSION: &str = "0.9.0.1";
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 3_000;
pub const DEFAULT_RETRY_STOP_MS: u64 = 60_000;

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Wire protocol version the broker cluster speaks.
    #[serde(default = "default_version")]
    pub version: String,
    /// Seed endpoints. A channel's own broker list, when present in its
    /// shared configuration, takes precedence over this list.
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Backoff policy the broker adapter applies to publish/consume failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_period")]
    pub period_ms: u64,
    #[serde(default = "default_retry_stop")]
    pub stop_ms: u64,
}

impl RetryConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            brokers: vec![],
            retry: RetryConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            period_ms: default_retry_period(),
            stop_ms: default_retry_stop(),
        }
    }
}

fn default_version() -> String {
    DEFAULT_BROKER_VERSION.to_string()
}

fn default_retry_period() -> u64 {
    DEFAULT_RETRY_PERIOD_MS
}

fn default_retry_stop() -> u64 {
    DEFAULT_RETRY_STOP_MS
}

impl KafkaConfig {
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        let file = config::File::from(path);
        let loaded = config::Config::builder().add_source(file).build()?;
        loaded.try_deserialize()
    }
}

#[cfg(test)]
mod test {
    use config::FileFormat;

    use super::*;

    #[test]
    fn test_defaults() {
        let conf = KafkaConfig::default();
        assert_eq!(conf.version, DEFAULT_BROKER_VERSION);
        assert!(conf.brokers.is_empty());
        assert_eq!(conf.retry.period(), Duration::from_secs(3));
        assert_eq!(conf.retry.stop(), Duration::from_secs(60));
        assert!(!conf.tls.enabled);
    }

    #[test]
    fn test_deserialize_toml() {
        let raw = r#"
            version = "2.8.0"
            brokers = ["broker0:9092", "broker1:9092"]

            [retry]
            period_ms = 500
            stop_ms = 10000

            [tls]
            enabled = true
        "#;
        let conf: KafkaConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(conf.version, "2.8.0");
        assert_eq!(conf.brokers.len(), 2);
        assert_eq!(conf.retry.period(), Duration::from_millis(500));
        assert!(conf.tls.enabled);
    }
}
