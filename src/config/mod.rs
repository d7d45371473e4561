//! Configuration for the crawler.
//!
//! Loaded from a YAML file (every field has a default), then selected
//! values can be overridden from the environment:
//!
//! - `METARAID_REDIS_HOST`: Redis host (default: 127.0.0.1)
//! - `METARAID_REDIS_PORT`: Redis port (default: 6379)
//! - `METARAID_REDIS_DATABASE`: Redis logical database (default: 0)
//! - `METARAID_REDIS_PASSWORD`: Redis password (default: none)
//! - `METARAID_SEED_ARTIST_ID`: artist the crawl starts from

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::scheduler::WorkerPoolConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub redis: RedisConfig,
    pub scraper: ScraperConfig,
    pub spotify: SpotifyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Crawl engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScraperConfig {
    /// Artist enqueued when the frontier has nothing pending.
    pub seed_artist_id: String,
    /// Capacity of the channel between the job fetcher and the workers.
    pub channel_capacity: usize,
    /// The fetcher stops pulling while more jobs than this are buffered.
    pub low_watermark: usize,
    /// Jobs claimed per pop.
    pub pop_batch: usize,
    /// Fetcher sleep when the frontier is drained.
    pub idle_backoff_secs: u64,
    /// Fetcher sleep while the channel is above the watermark.
    pub full_backoff_ms: u64,
    /// Worker sleep when the channel is empty.
    pub worker_poll_ms: u64,
    pub stats_interval_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            seed_artist_id: "5D8TBtxnP5GZm9wUBQ8OTc".to_string(),
            channel_capacity: 20,
            low_watermark: 10,
            pop_batch: 5,
            idle_backoff_secs: 3,
            full_backoff_ms: 1000,
            worker_poll_ms: 1000,
            stats_interval_secs: 60,
            health_interval_secs: 5,
        }
    }
}

impl ScraperConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_channel_capacity(self.channel_capacity)
            .with_low_watermark(self.low_watermark)
            .with_pop_batch(self.pop_batch)
            .with_idle_backoff(Duration::from_secs(self.idle_backoff_secs))
            .with_full_backoff(Duration::from_millis(self.full_backoff_ms))
            .with_poll_interval(Duration::from_millis(self.worker_poll_ms))
            .with_stats_interval(Duration::from_secs(self.stats_interval_secs))
            .with_health_interval(Duration::from_secs(self.health_interval_secs))
    }
}

/// One API credential.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    #[serde(default)]
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpotifyConfig {
    pub clients: Vec<CredentialConfig>,
    /// Longest rate-limit wait a credential absorbs before it goes cold.
    pub max_retry_duration_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            clients: Vec::new(),
            max_retry_duration_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

impl SpotifyConfig {
    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Checks the credentials; only needed by commands that crawl.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "spotify.clients must list at least one credential".to_string(),
            ));
        }
        for (i, client) in self.clients.iter().enumerate() {
            if client.client_id.is_empty() || client.client_secret.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "spotify.clients[{}] needs client_id and client_secret",
                    i
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Loads the configuration file at `path` and applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override has an invalid value, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!(path = %path.display(), "loading configs");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// The default configuration as YAML.
    pub fn default_yaml() -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&Self::default())?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = lookup("METARAID_REDIS_HOST") {
            self.redis.host = val;
        }

        if let Some(val) = lookup("METARAID_REDIS_PORT") {
            self.redis.port = parse_env_value(&val, "METARAID_REDIS_PORT")?;
        }

        if let Some(val) = lookup("METARAID_REDIS_DATABASE") {
            self.redis.database = parse_env_value(&val, "METARAID_REDIS_DATABASE")?;
        }

        if let Some(val) = lookup("METARAID_REDIS_PASSWORD") {
            self.redis.password = Some(val);
        }

        if let Some(val) = lookup("METARAID_SEED_ARTIST_ID") {
            self.scraper.seed_artist_id = val;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scraper = &self.scraper;

        if scraper.seed_artist_id.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "scraper.seed_artist_id must not be empty".to_string(),
            ));
        }

        if scraper.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "scraper.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if scraper.low_watermark >= scraper.channel_capacity {
            return Err(ConfigError::ValidationFailed(format!(
                "scraper.low_watermark ({}) must be below channel_capacity ({})",
                scraper.low_watermark, scraper.channel_capacity
            )));
        }

        if scraper.pop_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "scraper.pop_batch must be greater than 0".to_string(),
            ));
        }

        let intervals = [
            ("idle_backoff_secs", scraper.idle_backoff_secs),
            ("full_backoff_ms", scraper.full_backoff_ms),
            ("worker_poll_ms", scraper.worker_poll_ms),
            ("stats_interval_secs", scraper.stats_interval_secs),
            ("health_interval_secs", scraper.health_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationFailed(format!(
                "scraper.{} must be greater than 0",
                name
            )));
        }

        Ok(())
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.redis.host, "127.0.0.1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.scraper.seed_artist_id, "5D8TBtxnP5GZm9wUBQ8OTc");
        assert_eq!(config.scraper.channel_capacity, 20);
        assert_eq!(config.scraper.low_watermark, 10);
        assert_eq!(config.scraper.pop_batch, 5);
        assert_eq!(config.spotify.max_retry_duration(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
redis:
  host: redis.internal
scraper:
  seed_artist_id: 1Xyo4u8uXC1ZmMpatF05PJ
spotify:
  clients:
    - name: primary
      client_id: abc
      client_secret: def
"#;
        let config = Config::from_yaml(yaml).expect("yaml should parse");

        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.scraper.seed_artist_id, "1Xyo4u8uXC1ZmMpatF05PJ");
        assert_eq!(config.scraper.pop_batch, 5);
        assert_eq!(config.spotify.clients.len(), 1);
        assert!(config.spotify.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "scraper:\n  worker_count: 5\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_default_yaml_roundtrip() {
        let yaml = Config::default_yaml().expect("defaults should serialize");
        let parsed = Config::from_yaml(&yaml).expect("defaults should parse back");
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("METARAID_REDIS_HOST", "10.0.0.5"),
                ("METARAID_REDIS_PORT", "6380"),
                ("METARAID_REDIS_DATABASE", "2"),
                ("METARAID_SEED_ARTIST_ID", "seed"),
            ]))
            .expect("overrides should apply");

        assert_eq!(config.redis.url(), "redis://10.0.0.5:6380/2");
        assert_eq!(config.scraper.seed_artist_id, "seed");
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("METARAID_REDIS_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "METARAID_REDIS_PORT"));
    }

    #[test]
    fn test_redis_url_with_password() {
        let redis = RedisConfig {
            password: Some("p@ss".to_string()),
            ..Default::default()
        };
        assert_eq!(redis.url(), "redis://:p%40ss@127.0.0.1:6379/0");
    }

    #[test]
    fn test_validate_watermark() {
        let mut config = Config::default();
        config.scraper.low_watermark = 20;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        for field in ["idle_backoff_secs", "full_backoff_ms", "worker_poll_ms", "stats_interval_secs", "health_interval_secs"] {
            let mut config = Config::default();
            match field {
                "idle_backoff_secs" => config.scraper.idle_backoff_secs = 0,
                "full_backoff_ms" => config.scraper.full_backoff_ms = 0,
                "worker_poll_ms" => config.scraper.worker_poll_ms = 0,
                "stats_interval_secs" => config.scraper.stats_interval_secs = 0,
                _ => config.scraper.health_interval_secs = 0,
            }
            match config.validate() {
                Err(ConfigError::ValidationFailed(message)) => assert!(message.contains(field), "{}", message),
                other => panic!("expected {} to be rejected, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_spotify_validate() {
        let mut spotify = SpotifyConfig::default();
        assert!(spotify.validate().is_err());

        spotify.clients.push(CredentialConfig {
            name: "primary".to_string(),
            client_id: "abc".to_string(),
            client_secret: String::new(),
        });
        assert!(spotify.validate().is_err());
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = CredentialConfig {
            name: "primary".to_string(),
            client_id: "abc".to_string(),
            client_secret: "super-secret".to_string(),
        };
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_pool_config_conversion() {
        let pool = ScraperConfig::default().pool_config();
        assert_eq!(pool.channel_capacity, 20);
        assert_eq!(pool.low_watermark, 10);
        assert_eq!(pool.idle_backoff, Duration::from_secs(3));
        assert_eq!(pool.health_interval, Duration::from_secs(5));
    }
}
