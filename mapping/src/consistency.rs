//! Keeps the snapshots embedded in mapping entries in step with the bundles,
//! config types and projects they were copied from.
//!
//! Mutations enqueue a [`Propagation`] after they have been written. A single
//! worker task applies the jobs in order, retrying failed jobs with
//! exponential backoff. A job that still fails is logged as an inconsistency
//! and dropped; the triggering mutation is never failed after the fact.

use crate::cache::CacheInvalidator;
use crate::config::ConsistencyConfig;
use crate::errors::{CoreError, Result};
use crate::metrics_defs::{
    PROPAGATION_DURATION, PROPAGATION_QUEUE_DEPTH, PROPAGATIONS_APPLIED, PROPAGATIONS_FAILED,
};
use crate::store::{ConfigQuery, MasterQuery, MasterUpdate, Store};
use crate::types::{ConfigBundle, ConfigKind, FilterCombination, MasterEntry, ProjectId, Status};
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq)]
pub enum Propagation {
    /// Overwrite the embedded snapshot of the bundle wherever it is mapped.
    ConfigUpdated(ConfigBundle),
    /// Retire every entry the bundle is mapped into.
    ConfigDeactivated(ConfigBundle),
    /// Deactivate the custom bundles of the type and retire the entries
    /// carrying one.
    ConfigTypeRemoved {
        project_id: ProjectId,
        config_type: String,
    },
    /// Deactivate every bundle and retire every entry of the project.
    ProjectDeactivated { project_id: ProjectId },
}

impl Propagation {
    pub fn kind(&self) -> &'static str {
        match self {
            Propagation::ConfigUpdated(_) => "config_updated",
            Propagation::ConfigDeactivated(_) => "config_deactivated",
            Propagation::ConfigTypeRemoved { .. } => "config_type_removed",
            Propagation::ProjectDeactivated { .. } => "project_deactivated",
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Propagation::ConfigUpdated(bundle) | Propagation::ConfigDeactivated(bundle) => {
                &bundle.project_id
            }
            Propagation::ConfigTypeRemoved { project_id, .. }
            | Propagation::ProjectDeactivated { project_id } => project_id,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Apply(Propagation),
    // Acknowledged once every job queued before it has been processed.
    Flush(oneshot::Sender<()>),
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Applies propagation jobs against the store. Every job is idempotent, so a
/// retry after a partial failure is safe.
struct Propagator {
    store: Arc<dyn Store>,
    invalidator: CacheInvalidator,
    max_retries: u32,
    base_delay_ms: u64,
}

impl Propagator {
    /// Returns the number of mapping entries touched.
    async fn apply(&self, job: &Propagation) -> Result<usize> {
        let touched = match job {
            Propagation::ConfigUpdated(bundle) => {
                let update = MasterUpdate::ReplaceSnapshot {
                    kind: bundle.kind.clone(),
                    snapshot: bundle.snapshot(),
                };
                self.store
                    .update_masters(&MasterQuery::embedding(bundle), &update)
                    .await?
            }
            Propagation::ConfigDeactivated(bundle) => {
                self.retire_masters(&MasterQuery::embedding(bundle)).await?
            }
            Propagation::ConfigTypeRemoved {
                project_id,
                config_type,
            } => {
                let kind = ConfigKind::Custom(config_type.clone());
                let deactivated = self
                    .store
                    .deactivate_configs(&ConfigQuery::active_in(project_id).with_kind(kind))
                    .await?;
                tracing::info!(
                    project_id = %project_id,
                    config_type = %config_type,
                    configs = deactivated.len(),
                    "Deactivated configs of removed type"
                );

                let query = MasterQuery {
                    has_custom_type: Some(config_type.clone()),
                    ..MasterQuery::active_in(project_id)
                };
                self.retire_masters(&query).await?
            }
            Propagation::ProjectDeactivated { project_id } => {
                let deactivated = self
                    .store
                    .deactivate_configs(&ConfigQuery::active_in(project_id))
                    .await?;
                tracing::info!(
                    project_id = %project_id,
                    configs = deactivated.len(),
                    "Deactivated configs of deactivated project"
                );
                self.retire_masters(&MasterQuery::active_in(project_id)).await?
            }
        };

        let filters: Vec<FilterCombination> =
            touched.iter().map(|entry| entry.filter.clone()).collect();
        self.invalidator.invalidate(job.project_id(), &filters).await;

        Ok(touched.len())
    }

    /// Exponential backoff from `base_delay_ms`, capped at one minute.
    fn retry_delay(&self, retries: u32) -> Duration {
        let millis = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(retries));
        Duration::from_millis(millis).min(MAX_RETRY_DELAY)
    }

    async fn retire_masters(&self, query: &MasterQuery) -> Result<Vec<MasterEntry>> {
        let retired = self
            .store
            .update_masters(query, &MasterUpdate::SetStatus(Status::Inactive))
            .await?;
        Ok(retired)
    }

    /// Applies `job`, retrying with exponential backoff. Failures are terminal
    /// only once the retries are exhausted.
    async fn apply_with_retry(&self, job: &Propagation) {
        let start = Instant::now();
        let mut retries = 0;

        loop {
            match self.apply(job).await {
                Ok(touched) => {
                    counter!(PROPAGATIONS_APPLIED, "job" => job.kind()).increment(1);
                    tracing::info!(
                        job = job.kind(),
                        project_id = job.project_id(),
                        entries = touched,
                        "Applied propagation"
                    );
                    break;
                }
                Err(e) if retries < self.max_retries => {
                    let delay = self.retry_delay(retries);
                    tracing::warn!(
                        job = job.kind(),
                        project_id = job.project_id(),
                        error = %e,
                        retry_millis = delay.as_millis() as u64,
                        "Propagation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => {
                    let err = CoreError::Inconsistency(format!(
                        "{} for project {} failed after {retries} retries: {e}",
                        job.kind(),
                        job.project_id()
                    ));
                    counter!(PROPAGATIONS_FAILED, "job" => job.kind()).increment(1);
                    tracing::error!(
                        error = %err,
                        code = err.code().as_str(),
                        job = ?job,
                        "Dropping propagation"
                    );
                    break;
                }
            }
        }

        histogram!(PROPAGATION_DURATION).record(start.elapsed().as_secs_f64());
    }

    async fn run_worker(&self, mut rx: mpsc::Receiver<Command>) {
        // Exits once every sender has been dropped.
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Apply(job) => self.apply_with_retry(&job).await,
                Command::Flush(ack) => {
                    // The waiter may have given up.
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!("Propagation worker stopped");
    }
}

/// Handle used by the mutating services. Cloning shares the worker.
#[derive(Clone)]
pub struct ConsistencyMaintainer {
    propagator: Arc<Propagator>,
    tx: mpsc::Sender<Command>,
}

impl ConsistencyMaintainer {
    /// Spawns the worker on the current runtime.
    pub fn spawn(
        store: Arc<dyn Store>,
        invalidator: CacheInvalidator,
        config: &ConsistencyConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Command>(config.queue_size);

        let propagator = Arc::new(Propagator {
            store,
            invalidator,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
        });

        let worker = propagator.clone();
        let handle = tokio::spawn(async move {
            worker.run_worker(rx).await;
        });

        (ConsistencyMaintainer { propagator, tx }, handle)
    }

    pub async fn on_config_updated(&self, bundle: ConfigBundle) {
        self.enqueue(Propagation::ConfigUpdated(bundle)).await;
    }

    pub async fn on_config_deactivated(&self, bundle: ConfigBundle) {
        self.enqueue(Propagation::ConfigDeactivated(bundle)).await;
    }

    pub async fn on_config_type_removed(&self, project_id: &str, config_type: &str) {
        self.enqueue(Propagation::ConfigTypeRemoved {
            project_id: project_id.to_string(),
            config_type: config_type.to_string(),
        })
        .await;
    }

    pub async fn on_project_deactivated(&self, project_id: &str) {
        self.enqueue(Propagation::ProjectDeactivated {
            project_id: project_id.to_string(),
        })
        .await;
    }

    /// Applies `job` on the calling task without retries.
    pub async fn propagate(&self, job: &Propagation) -> Result<usize> {
        self.propagator.apply(job).await
    }

    /// Waits until every job queued before this call has been processed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    async fn enqueue(&self, job: Propagation) {
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command::Apply(job)).await {
            tracing::error!(
                command = ?cmd,
                code = crate::errors::ErrorCode::Inconsistency.as_str(),
                "Propagation worker is gone, dropping job"
            );
            return;
        }
        let queued = self.tx.max_capacity() - self.tx.capacity();
        gauge!(PROPAGATION_QUEUE_DEPTH).set(queued as f64);
    }
}
