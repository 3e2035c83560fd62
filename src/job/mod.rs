// dynamotool/src/job/mod.rs
//! Per-table jobs and the events they report.
//!
//! A job reports through an [`EventSink`]: `Started`, then exactly one of
//! `Completed` or `Failed`, with `Warning` and `Progress` in between. Every
//! event is logged, and forwarded to the caller's channel when one was given.

pub(crate) mod backup;
pub(crate) mod restore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::errors::AppError;

/// Retries per request for throttling and unprocessed items.
pub(crate) const MAX_RETRIES: usize = 8;

/// Backoff between retries of one scan page or one batch write.
pub(crate) fn retry_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(MAX_RETRIES)
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => write!(f, "backup"),
            JobKind::Restore => write!(f, "restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub enum JobEvent {
    Started {
        table: String,
        kind: JobKind,
        start_time: DateTime<Utc>,
    },
    Completed {
        table: String,
        kind: JobKind,
        duration_ms: u64,
    },
    Failed {
        table: String,
        kind: JobKind,
        error: Arc<AppError>,
    },
    /// Recoverable anomaly, e.g. a throttled batch that will be retried.
    Warning { table: String, message: String },
    Progress {
        table: String,
        batches_sent: usize,
        requests_in_flight: usize,
        bytes_remaining: u64,
    },
}

#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Events are only logged.
    pub fn log_only() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: JobEvent) {
        log_event(&event);
        if let Some(tx) = &self.tx {
            // A caller that dropped its receiver no longer cares.
            let _ = tx.send(event);
        }
    }

    pub fn warning(&self, table: &str, message: impl Into<String>) {
        self.emit(JobEvent::Warning {
            table: table.to_string(),
            message: message.into(),
        });
    }
}

fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Started { table, kind, start_time } => {
            tracing::info!(%table, %kind, %start_time, "job started");
        }
        JobEvent::Completed { table, kind, duration_ms } => {
            tracing::info!(%table, %kind, duration_ms, "job completed");
        }
        JobEvent::Failed { table, kind, error } => {
            tracing::error!(%table, %kind, %error, "job failed");
        }
        JobEvent::Warning { table, message } => {
            tracing::warn!(%table, "{}", message);
        }
        JobEvent::Progress {
            table,
            batches_sent,
            requests_in_flight,
            bytes_remaining,
        } => {
            tracing::debug!(
                %table,
                batches_sent,
                requests_in_flight,
                mb_remaining = *bytes_remaining as f64 / (1024.0 * 1024.0),
                "batch sent"
            );
        }
    }
}

/// One table's backup or restore within an orchestration run.
#[derive(Debug, Clone)]
pub struct TableJob {
    pub table_name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<Arc<AppError>>,
    /// Items scanned (backup) or written (restore).
    pub items: u64,
}

impl TableJob {
    pub fn new(table_name: impl Into<String>, kind: JobKind) -> Self {
        Self {
            table_name: table_name.into(),
            kind,
            status: JobStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            items: 0,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.start_time?, self.end_time?);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    pub(crate) fn start(&mut self, events: &EventSink) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.start_time = Some(now);
        events.emit(JobEvent::Started {
            table: self.table_name.clone(),
            kind: self.kind,
            start_time: now,
        });
    }

    pub(crate) fn succeed(&mut self, events: &EventSink) {
        self.status = JobStatus::Succeeded;
        self.end_time = Some(Utc::now());
        events.emit(JobEvent::Completed {
            table: self.table_name.clone(),
            kind: self.kind,
            duration_ms: self.duration_ms().unwrap_or(0),
        });
    }

    pub(crate) fn fail(&mut self, error: AppError, events: &EventSink) {
        let error = Arc::new(error);
        self.status = JobStatus::Failed;
        self.end_time = Some(Utc::now());
        self.error = Some(error.clone());
        events.emit(JobEvent::Failed {
            table: self.table_name.clone(),
            kind: self.kind,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_emits_started_then_completed() {
        let (events, mut rx) = EventSink::channel();
        let mut job = TableJob::new("orders", JobKind::Backup);
        assert_eq!(job.status, JobStatus::Pending);

        job.start(&events);
        assert_eq!(job.status, JobStatus::Running);
        job.succeed(&events);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.duration_ms().is_some());

        assert!(matches!(rx.recv().await, Some(JobEvent::Started { ref table, .. }) if table == "orders"));
        assert!(matches!(rx.recv().await, Some(JobEvent::Completed { kind: JobKind::Backup, .. })));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_the_job_and_the_event() {
        let (events, mut rx) = EventSink::channel();
        let mut job = TableJob::new("orders", JobKind::Restore);
        job.fail(AppError::TableNotFound("orders".into()), &events);

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.start_time.is_none());
        match rx.recv().await {
            Some(JobEvent::Failed { error, .. }) => assert!(error.is_not_found()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sink_without_receiver_still_accepts_events() {
        let (events, rx) = EventSink::channel();
        drop(rx);
        events.warning("t", "still fine");
        EventSink::log_only().warning("t", "logged");
    }
}
