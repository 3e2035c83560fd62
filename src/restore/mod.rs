// dynamotool/src/restore/mod.rs
//! Restore Orchestrator.
//!
//! Discovers backup artifacts under a prefix, derives a table per artifact and
//! restores them concurrently. All jobs share one bound on in-flight batches
//! and one abort signal: the first fatal job error stops new batches for every
//! table and fails the run.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::{Database, ObjectInfo, ObjectStore};
use crate::config::{RestoreConfig, RestoreOptions};
use crate::errors::{AppError, Result};
use crate::job::restore::{RestoreJobContext, run_restore_job};
use crate::job::{EventSink, JobKind, JobStatus, TableJob};
use crate::naming;

/// An artifact the run will restore, and the table it restores into.
#[derive(Debug, Clone)]
pub struct PlannedRestore {
    pub artifact: ObjectInfo,
    pub table: String,
}

#[derive(Debug)]
pub struct RestoreReport {
    /// Final job per planned artifact, in listing order.
    pub jobs: Vec<TableJob>,
    /// Keys whose names could not be turned into a table.
    pub skipped_artifacts: Vec<String>,
}

impl RestoreReport {
    pub fn items_restored(&self) -> u64 {
        self.jobs.iter().map(|j| j.items).sum()
    }
}

pub struct RestoreOrchestrator {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    options: RestoreOptions,
}

/// A submitted restore run. Dropping it does not stop the jobs.
pub struct RestoreRun {
    pub planned: Vec<PlannedRestore>,
    pub skipped_artifacts: Vec<String>,
    handles: Vec<JoinHandle<TableJob>>,
    abort: CancellationToken,
}

impl RestoreOrchestrator {
    pub fn new(db: Arc<dyn Database>, store: Arc<dyn ObjectStore>, options: RestoreOptions) -> Self {
        Self { db, store, options }
    }

    /// Restores every artifact under `source_prefix` and waits for the run.
    pub async fn restore_all(&self, bucket: &str, source_prefix: &str, events: EventSink) -> Result<RestoreReport> {
        self.submit(bucket, source_prefix, events).await?.await_completion().await
    }

    /// Plans the run and launches one job per artifact, in listing order.
    pub async fn submit(&self, bucket: &str, source_prefix: &str, events: EventSink) -> Result<RestoreRun> {
        if self.options.max_concurrent_batches == 0 {
            return Err(AppError::Config("max_concurrent_batches must be at least 1".to_string()));
        }
        let config = Arc::new(RestoreConfig::new(bucket, source_prefix, self.options));

        let artifacts: Vec<ObjectInfo> = self
            .store
            .list_objects(bucket, Some(source_prefix))
            .await?
            .into_iter()
            .filter(|o| naming::is_artifact_key(&o.key))
            .collect();
        if artifacts.is_empty() {
            tracing::warn!(bucket, prefix = source_prefix, "no backup artifacts found");
            return Err(AppError::NoArtifactsFound {
                bucket: bucket.to_string(),
                prefix: source_prefix.to_string(),
            });
        }

        let (planned, skipped_artifacts) = plan(artifacts);
        tracing::info!(
            bucket = %config.bucket,
            prefix = %config.source_prefix,
            artifacts = planned.len(),
            skipped = skipped_artifacts.len(),
            "starting restore"
        );

        let ctx = RestoreJobContext {
            db: self.db.clone(),
            store: self.store.clone(),
            config: config.clone(),
            batch_slots: Arc::new(Semaphore::new(config.max_concurrent_batches)),
            abort: CancellationToken::new(),
        };

        // Artifacts that map to the same table run one after another in
        // listing order: each job waits for its predecessor to finish.
        let mut last_for_table: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut handles = Vec::with_capacity(planned.len());
        for entry in &planned {
            let (done, next) = oneshot::channel();
            let after = last_for_table.insert(entry.table.clone(), next);
            let ctx = ctx.clone();
            let events = events.clone();
            let entry = entry.clone();
            handles.push(tokio::spawn(async move {
                if let Some(after) = after {
                    // Err only if the predecessor's task died, which also ends its turn.
                    let _ = after.await;
                }
                let job = run_restore_job(&ctx, &entry.artifact, &entry.table, &events).await;
                let _ = done.send(());
                job
            }));
        }

        Ok(RestoreRun {
            planned,
            skipped_artifacts,
            handles,
            abort: ctx.abort,
        })
    }
}

fn plan(artifacts: Vec<ObjectInfo>) -> (Vec<PlannedRestore>, Vec<String>) {
    let mut planned = Vec::with_capacity(artifacts.len());
    let mut skipped = Vec::new();
    for artifact in artifacts {
        match naming::table_name_from_key(&artifact.key) {
            Ok(table) => {
                tracing::debug!(key = %artifact.key, bytes = artifact.size_bytes, %table, "artifact mapped to table");
                planned.push(PlannedRestore { artifact, table });
            }
            Err(e) => {
                tracing::warn!(key = %artifact.key, error = %e, "skipping artifact");
                skipped.push(artifact.key);
            }
        }
    }
    (planned, skipped)
}

impl RestoreRun {
    /// Cancelling the returned token stops new batches for every job of
    /// this run. Batches already in flight still finish.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Waits for every job. Fails with `RestoreAborted` naming the first
    /// table whose own error aborted the run.
    pub async fn await_completion(self) -> Result<RestoreReport> {
        let mut jobs = Vec::with_capacity(self.handles.len());
        for (handle, entry) in self.handles.into_iter().zip(&self.planned) {
            let job = match handle.await {
                Ok(job) => job,
                Err(join_err) => {
                    self.abort.cancel();
                    let mut job = TableJob::new(&entry.table, JobKind::Restore);
                    job.status = JobStatus::Failed;
                    job.error = Some(Arc::new(AppError::DatabaseIo(format!(
                        "restore task for {} failed: {}",
                        entry.table, join_err
                    ))));
                    job
                }
            };
            jobs.push(job);
        }

        let cause = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .filter_map(|j| j.error.clone().map(|e| (j.table_name.clone(), e)))
            .find(|(_, e)| !matches!(e.as_ref(), AppError::Cancelled(_)));

        if let Some((table, source)) = cause {
            return Err(AppError::RestoreAborted { table, source });
        }
        if self.abort.is_cancelled() {
            return Err(AppError::Cancelled("restore run aborted".to_string()));
        }

        let report = RestoreReport {
            jobs,
            skipped_artifacts: self.skipped_artifacts,
        };
        tracing::info!(
            tables = report.jobs.len(),
            items = report.items_restored(),
            "restore finished"
        );
        Ok(report)
    }
}
