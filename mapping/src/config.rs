use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("{0} must be greater than 0")]
    MustBePositive(&'static str),

    #[error("Snapshot filename cannot be empty")]
    EmptySnapshotFilename,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd1,
    Zstd3,
}

impl Compression {
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            Compression::None => None,
            Compression::Zstd1 => Some(1),
            Compression::Zstd3 => Some(3),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SnapshotConfig {
    pub base_dir: String,
    pub filename: String,
    #[serde(default)]
    pub compression: Compression,
    /// Seconds between periodic snapshots. The store is also written on shutdown.
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
}

fn default_snapshot_interval() -> u64 {
    60
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct StoreConfig {
    /// Without a snapshot the store starts empty and is lost on exit.
    pub snapshot: Option<SnapshotConfig>,
}

/// Whether writes to mappings evict affected resolution cache entries.
#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    /// Stale reads are served for up to one TTL after a change.
    #[default]
    TtlOnly,
    OnWrite,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// TTL for remembered NO_MAPPING results.
    pub negative_ttl_secs: u64,
    pub max_capacity: u64,
    pub invalidation: Invalidation,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 300,
            negative_ttl_secs: 5,
            max_capacity: 10_000,
            invalidation: Invalidation::TtlOnly,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct MappingConfig {
    /// Maximum number of concurrent upserts for a single mapping write.
    pub fanout_concurrency: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig {
            fanout_concurrency: 16,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub queue_size: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        ConsistencyConfig {
            max_retries: 3,
            base_delay_ms: 500,
            queue_size: 1024,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Shared salt for the `x-client-hash` check. Unset disables the check.
    pub client_salt: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            client_salt: None,
            request_timeout_ms: 5_000,
        }
    }
}

impl ResolverConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.cache.ttl_secs == 0 {
            return Err(ValidationError::MustBePositive("cache.ttl_secs"));
        }
        if self.cache.max_capacity == 0 {
            return Err(ValidationError::MustBePositive("cache.max_capacity"));
        }
        if self.mapping.fanout_concurrency == 0 {
            return Err(ValidationError::MustBePositive("mapping.fanout_concurrency"));
        }
        if self.consistency.queue_size == 0 {
            return Err(ValidationError::MustBePositive("consistency.queue_size"));
        }
        if self.resolver.request_timeout_ms == 0 {
            return Err(ValidationError::MustBePositive("resolver.request_timeout_ms"));
        }
        if let Some(snapshot) = &self.store.snapshot {
            if snapshot.filename.is_empty() {
                return Err(ValidationError::EmptySnapshotFilename);
            }
            if snapshot.interval_secs == 0 {
                return Err(ValidationError::MustBePositive("store.snapshot.interval_secs"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
            cache:
                ttl_secs: 3600
                invalidation: on_write
            store:
                snapshot:
                    base_dir: /var/lib/tessera
                    filename: store.snapshot
            "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.cache.negative_ttl_secs, 5);
        assert_eq!(config.cache.invalidation, Invalidation::OnWrite);

        let snapshot = config.store.snapshot.unwrap();
        assert_eq!(snapshot.compression, Compression::Zstd1);
        assert_eq!(snapshot.interval_secs, 60);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = Config::default();
        config.mapping.fanout_concurrency = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::MustBePositive("mapping.fanout_concurrency"))
        );
    }
}
