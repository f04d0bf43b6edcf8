pub mod access;
pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod configs;
pub mod consistency;
pub mod cursor;
pub mod errors;
pub mod expander;
pub mod master;
pub mod metrics_defs;
pub mod negative_cache;
pub mod projects;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::ApiError;
use crate::cache::MokaResolutionCache;
use crate::config::{Config, ValidationError};
use crate::service::MappingService;
use crate::store::snapshot::{FilesystemSnapshot, SnapshotError, SnapshotProvider};
use crate::store::{MemoryStore, StoreData};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use crate::expander::expand_filter;

#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

/// Runs the service until ctrl-c, then drains pending propagations and
/// writes a final snapshot.
pub async fn run(config: Config) -> Result<(), MappingError> {
    config.validate()?;
    metrics_defs::describe_all();

    let snapshot: Option<Arc<dyn SnapshotProvider>> = config.store.snapshot.as_ref().map(|s| {
        Arc::new(FilesystemSnapshot::new(&s.base_dir, &s.filename, s.compression))
            as Arc<dyn SnapshotProvider>
    });

    let data = match &snapshot {
        Some(provider) => provider.load()?.unwrap_or_default(),
        None => StoreData::default(),
    };
    tracing::info!(
        projects = data.projects.len(),
        configs = data.configs.len(),
        mappings = data.masters.len(),
        "Loaded store"
    );

    let store = Arc::new(MemoryStore::from_data(data));
    let cache = Arc::new(MokaResolutionCache::new(config.cache.max_capacity));
    let service = MappingService::new(store.clone(), cache, &config);

    let snapshot_task = match (&snapshot, &config.store.snapshot) {
        (Some(provider), Some(settings)) => Some(spawn_snapshot_loop(
            store.clone(),
            provider.clone(),
            Duration::from_secs(settings.interval_secs),
        )),
        _ => None,
    };

    let served = api::serve(&config.listener, service.clone(), shutdown_signal()).await;

    service.shutdown().await;
    if let Some(task) = snapshot_task {
        task.abort();
    }
    if let Some(provider) = snapshot {
        let bytes = persist(&store, provider).await?;
        tracing::info!(bytes, "Wrote final snapshot");
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn persist(
    store: &MemoryStore,
    provider: Arc<dyn SnapshotProvider>,
) -> Result<usize, SnapshotError> {
    let data = store.export();
    tokio::task::spawn_blocking(move || provider.store(&data))
        .await
        .map_err(|e| SnapshotError::Io(std::io::Error::other(e)))?
}

fn spawn_snapshot_loop(
    store: Arc<MemoryStore>,
    provider: Arc<dyn SnapshotProvider>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match persist(&store, provider.clone()).await {
                Ok(bytes) => tracing::debug!(bytes, "Wrote periodic snapshot"),
                Err(e) => tracing::error!(error = %e, "Failed to write periodic snapshot"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::testutils::test_project;
    use crate::store::Store;

    #[tokio::test]
    async fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn SnapshotProvider> = Arc::new(FilesystemSnapshot::new(
            dir.path().to_str().unwrap(),
            "store.snapshot",
            Compression::Zstd1,
        ));

        let store = MemoryStore::new();
        store.insert_project(test_project()).await.unwrap();
        persist(&store, provider.clone()).await.unwrap();

        let restored = MemoryStore::from_data(provider.load().unwrap().unwrap());
        assert_eq!(restored.export(), store.export());
    }
}
