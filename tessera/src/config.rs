use mapping::config::{Config as ServerConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "tessera".into()
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    pub format: LogFormat,
    /// Default filter directive. `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            format: LogFormat::Text,
            level: "info".into(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(flatten)]
    pub server: ServerConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(metrics) = &self.common.metrics {
            if metrics.statsd_port == 0 {
                return Err(ConfigError::InvalidMetrics("statsd_port cannot be 0".into()));
            }
        }
        self.server.validate()?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error("invalid metrics config: {0}")]
    InvalidMetrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapping::config::{Compression, Invalidation};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example.com/1
                format: json
            listener:
                host: 0.0.0.0
                port: 8080
            store:
                snapshot:
                    base_dir: /var/lib/tessera
                    filename: store.snapshot
                    compression: zstd3
                    interval_secs: 30
            cache:
                ttl_secs: 600
                invalidation: on_write
            mapping:
                fanout_concurrency: 32
            consistency:
                max_retries: 5
            resolver:
                client_salt: pepper
        "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).unwrap();
        assert!(config.validate().is_ok());

        let metrics = config.common.metrics.unwrap();
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "tessera");
        assert_eq!(config.common.logging.format, LogFormat::Json);
        assert_eq!(config.common.logging.level, "info");

        let server = config.server;
        assert_eq!(server.listener.port, 8080);
        assert_eq!(server.cache.ttl_secs, 600);
        assert_eq!(server.cache.invalidation, Invalidation::OnWrite);
        assert_eq!(server.mapping.fanout_concurrency, 32);
        assert_eq!(server.consistency.max_retries, 5);
        assert_eq!(server.consistency.base_delay_ms, 500);
        assert_eq!(server.resolver.client_salt.as_deref(), Some("pepper"));

        let snapshot = server.store.snapshot.unwrap();
        assert_eq!(snapshot.compression, Compression::Zstd3);
        assert_eq!(snapshot.interval_secs, 30);
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("listener:\n  host: 127.0.0.1\n  port: 3000\n");
        let config = Config::from_file(tmp.path()).unwrap();
        assert!(config.common.metrics.is_none());
        assert_eq!(config.common.logging, LoggingConfig::default());
        assert!(config.server.store.snapshot.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_config() {
        let tmp = write_tmp_file("listener:\n  host: 127.0.0.1\n  port: 0\n");
        let config = Config::from_file(tmp.path()).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(ValidationError::InvalidPort))
        ));

        let tmp = write_tmp_file("cache: [1, 2]\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/tessera.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
