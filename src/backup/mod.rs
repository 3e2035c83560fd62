// dynamotool/src/backup/mod.rs
//! Backup Orchestrator.
//!
//! `submit` resolves the tables, launches their jobs and returns as soon as
//! they are submitted. Completion is observed through the event sink or by
//! awaiting the returned [`BackupSubmission`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::clients::{Database, ObjectStore};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::job::backup::{BackupJobContext, run_backup_job};
use crate::job::{EventSink, JobKind, JobStatus, TableJob};
use crate::naming;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelector {
    Tables(Vec<String>),
    All,
}

impl TableSelector {
    /// Parses a comma separated table list. Blank entries are dropped.
    pub fn from_csv(list: &str) -> Self {
        TableSelector::Tables(
            list.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTable {
    pub table: String,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct BackupReport {
    pub timestamp: String,
    /// One job per submitted table, in submission order. Tables never started
    /// because of `stop_on_first_failure` stay `Pending`.
    pub jobs: Vec<TableJob>,
    pub skipped: Vec<SkippedTable>,
    pub halted: bool,
}

impl BackupReport {
    pub fn failed(&self) -> impl Iterator<Item = &TableJob> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.status == JobStatus::Succeeded).count()
    }
}

/// Handle to a submitted backup run. Jobs keep running if it is dropped.
pub struct BackupSubmission {
    pub timestamp: String,
    pub submitted: Vec<String>,
    pub skipped: Vec<SkippedTable>,
    driver: JoinHandle<(Vec<TableJob>, bool)>,
}

impl BackupSubmission {
    pub async fn await_completion(self) -> Result<BackupReport> {
        let (jobs, halted) = self
            .driver
            .await
            .map_err(|e| AppError::DatabaseIo(format!("backup driver failed: {}", e)))?;
        Ok(BackupReport {
            timestamp: self.timestamp,
            jobs,
            skipped: self.skipped,
            halted,
        })
    }
}

pub struct BackupOrchestrator {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    config: Arc<BackupConfig>,
}

impl BackupOrchestrator {
    pub fn new(db: Arc<dyn Database>, store: Arc<dyn ObjectStore>, config: BackupConfig) -> Self {
        Self {
            db,
            store,
            config: Arc::new(config),
        }
    }

    /// Resolves `selector` and submits one job per remaining table.
    pub async fn submit(&self, selector: TableSelector, events: EventSink) -> Result<BackupSubmission> {
        let (tables, skipped) = self.resolve(selector).await?;
        let timestamp = naming::snapshot_timestamp(Utc::now());
        tracing::info!(
            bucket = %self.config.bucket,
            tables = tables.len(),
            skipped = skipped.len(),
            %timestamp,
            "submitting backup"
        );

        let ctx = BackupJobContext {
            db: self.db.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            timestamp: timestamp.clone(),
        };
        let driver = tokio::spawn(drive(ctx, tables.clone(), events));

        Ok(BackupSubmission {
            timestamp,
            submitted: tables,
            skipped,
            driver,
        })
    }

    async fn resolve(&self, selector: TableSelector) -> Result<(Vec<String>, Vec<SkippedTable>)> {
        let mut skipped = Vec::new();
        let candidates = match selector {
            TableSelector::All => self.db.list_tables().await?,
            TableSelector::Tables(requested) => {
                let mut seen = HashSet::new();
                let mut existing = Vec::new();
                for table in requested {
                    if !seen.insert(table.clone()) {
                        continue;
                    }
                    if self.db.table_exists(&table).await? {
                        existing.push(table);
                    } else {
                        tracing::warn!(%table, "table does not exist, skipping");
                        skipped.push(SkippedTable {
                            table,
                            reason: SkipReason::NotFound,
                        });
                    }
                }
                existing
            }
        };

        let mut tables = Vec::with_capacity(candidates.len());
        for table in candidates {
            if self.config.excluded_tables.contains(&table) {
                tracing::info!(%table, "table excluded from backup");
                skipped.push(SkippedTable {
                    table,
                    reason: SkipReason::Excluded,
                });
            } else {
                tables.push(table);
            }
        }
        Ok((tables, skipped))
    }
}

/// Runs the jobs, at most `max_concurrent_tables` at a time. With
/// `stop_on_first_failure`, a failure halts the tables not yet started.
async fn drive(ctx: BackupJobContext, tables: Vec<String>, events: EventSink) -> (Vec<TableJob>, bool) {
    let limit = ctx.config.max_concurrent_tables.unwrap_or(tables.len()).max(1);
    let slots = Arc::new(Semaphore::new(limit));
    let halt = CancellationToken::new();
    let stop_on_failure = ctx.config.stop_on_first_failure;

    let mut running = JoinSet::new();
    let mut jobs: Vec<TableJob> = tables
        .iter()
        .map(|t| TableJob::new(t.as_str(), JobKind::Backup))
        .collect();

    for (index, table) in tables.into_iter().enumerate() {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        if halt.is_cancelled() {
            tracing::warn!(%table, "backup halted after a failure, not starting");
            break;
        }
        let ctx = ctx.clone();
        let events = events.clone();
        let halt = halt.clone();
        running.spawn(async move {
            let job = run_backup_job(&ctx, &table, &events).await;
            if stop_on_failure && job.status == JobStatus::Failed {
                halt.cancel();
            }
            drop(permit);
            (index, job)
        });
    }

    while let Some(done) = running.join_next().await {
        match done {
            Ok((index, job)) => jobs[index] = job,
            Err(e) => tracing::error!(error = %e, "backup task failed"),
        }
    }
    (jobs, halt.is_cancelled())
}
