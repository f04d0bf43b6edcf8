use crate::config::MetricsConfig;
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a global metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Installs the statsd exporter as the global metrics recorder.
pub fn init(config: &MetricsConfig) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Installed statsd exporter"
    );
    Ok(())
}
