// dynamotool/src/job/backup.rs
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{EventSink, JobKind, MAX_RETRIES, TableJob, retry_backoff};
use crate::clients::{Database, ObjectStore};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::naming;
use crate::record::encode_line;

/// Buffer between the scan and the upload. The scan waits when it is full.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Everything a backup job needs besides the table name.
#[derive(Clone)]
pub struct BackupJobContext {
    pub db: Arc<dyn Database>,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<BackupConfig>,
    /// Snapshot timestamp shared by the whole run.
    pub timestamp: String,
}

/// Backs up one table to `<prefix>/dynamodb_backup_<timestamp>_<table>.json`.
///
/// A missing table fails with `TableNotFound` before the job starts. The
/// returned job is always terminal.
pub async fn run_backup_job(ctx: &BackupJobContext, table: &str, events: &EventSink) -> TableJob {
    let mut job = TableJob::new(table, JobKind::Backup);

    match ctx.db.table_exists(table).await {
        Ok(true) => {}
        Ok(false) => {
            job.fail(AppError::TableNotFound(table.to_string()), events);
            return job;
        }
        Err(e) => {
            job.fail(e, events);
            return job;
        }
    }

    job.start(events);
    let key = naming::backup_key(&ctx.config.key_prefix, &ctx.timestamp, table);

    match stream_table_to_storage(ctx, table, &key, events).await {
        Ok((items, bytes)) => {
            job.items = items;
            tracing::info!(table, key, items, bytes, "table copied to storage");
            job.succeed(events);
        }
        Err(e) => job.fail(e, events),
    }
    job
}

/// Scans the table into a pipe while the store uploads from the other end.
/// Throttled pages are retried with backoff from where the scan stopped.
async fn stream_table_to_storage(
    ctx: &BackupJobContext,
    table: &str,
    key: &str,
    events: &EventSink,
) -> Result<(u64, u64)> {
    let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let encoding = ctx.config.binary_encoding;
    let mut pages = ctx.db.scan_table(table, ctx.config.read_throttle_fraction);

    let produce = async move {
        let mut items = 0u64;
        let mut backoff = retry_backoff();
        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_throttle() => {
                    let Some(delay) = backoff.next() else {
                        return Err(AppError::DatabaseIo(format!(
                            "gave up scanning {} after {} throttled retries",
                            table, MAX_RETRIES
                        )));
                    };
                    events.warning(table, format!("{}, retrying", e));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            backoff = retry_backoff();
            for record in page {
                writer.write_all(&encode_line(&record, encoding)?).await?;
                items += 1;
            }
        }
        writer.shutdown().await?;
        Ok::<_, AppError>(items)
    };
    let upload = ctx.store.put_object(&ctx.config.bucket, key, Box::pin(reader), None);

    // An error on either side drops the other, so a failed scan never
    // completes a truncated upload.
    tokio::try_join!(produce, upload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryDatabase, MemoryStore, items};
    use crate::job::{JobEvent, JobStatus};
    use crate::record::{AttrValue, BinaryEncoding, decode_line};
    use std::collections::HashSet;

    fn config() -> BackupConfig {
        BackupConfig {
            bucket: "backups".into(),
            excluded_tables: HashSet::new(),
            read_throttle_fraction: 0.5,
            stop_on_first_failure: false,
            binary_encoding: BinaryEncoding::Base64,
            key_prefix: "snapshots".into(),
            max_concurrent_tables: None,
        }
    }

    fn context(db: &MemoryDatabase, store: &MemoryStore) -> BackupJobContext {
        BackupJobContext {
            db: Arc::new(db.clone()),
            store: Arc::new(store.clone()),
            config: Arc::new(config()),
            timestamp: "2024_01_02_03_04_05".into(),
        }
    }

    #[tokio::test]
    async fn test_copies_every_item_as_one_line() -> anyhow::Result<()> {
        let db = MemoryDatabase::new().with_table("user_events", items("u", 37));
        let store = MemoryStore::new().with_bucket("backups");
        let (events, mut rx) = EventSink::channel();

        let job = run_backup_job(&context(&db, &store), "user_events", &events).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.items, 37);

        let key = "snapshots/dynamodb_backup_2024_01_02_03_04_05_user-events.json";
        let body = store.object("backups", key).expect("artifact written");
        let lines: Vec<_> = std::str::from_utf8(&body)?
            .lines()
            .filter_map(|l| decode_line(l).transpose())
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines, items("u", 37));

        assert!(matches!(rx.recv().await, Some(JobEvent::Started { .. })));
        assert!(matches!(rx.recv().await, Some(JobEvent::Completed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_binary_values_follow_the_configured_encoding() -> anyhow::Result<()> {
        let mut record = items("b", 1).remove(0);
        record.insert("blob".into(), AttrValue::B(vec![0, 159, 255]));
        let db = MemoryDatabase::new().with_table("blobs", vec![record]);
        let store = MemoryStore::new().with_bucket("backups");

        run_backup_job(&context(&db, &store), "blobs", &EventSink::log_only()).await;
        let body = store
            .object("backups", "snapshots/dynamodb_backup_2024_01_02_03_04_05_blobs.json")
            .expect("artifact written");
        assert!(std::str::from_utf8(&body)?.contains("\"B\":\"AJ//\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_table_fails_without_starting() {
        let db = MemoryDatabase::new();
        let store = MemoryStore::new().with_bucket("backups");
        let (events, mut rx) = EventSink::channel();

        let job = run_backup_job(&context(&db, &store), "ghost", &events).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.start_time.is_none());
        assert!(job.error.as_ref().is_some_and(|e| e.is_not_found()));

        match rx.recv().await {
            Some(JobEvent::Failed { table, .. }) => assert_eq!(table, "ghost"),
            other => panic!("expected a failure event, got {:?}", other),
        }
        assert!(store.keys("backups").is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_leaves_no_artifact() {
        let db = MemoryDatabase::new()
            .with_table("broken", items("x", 5))
            .fail_scans_of("broken");
        let store = MemoryStore::new().with_bucket("backups");

        let job = run_backup_job(&context(&db, &store), "broken", &EventSink::log_only()).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(matches!(job.error.as_deref(), Some(AppError::DatabaseIo(_))));
        assert!(store.keys("backups").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_scan_pages_are_retried() -> anyhow::Result<()> {
        let db = MemoryDatabase::new()
            .with_table("busy", items("b", 25))
            .throttle_scans_of("busy", 2);
        let store = MemoryStore::new().with_bucket("backups");
        let (events, mut rx) = EventSink::channel();

        let job = run_backup_job(&context(&db, &store), "busy", &events).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.items, 25);

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, JobEvent::Warning { .. }) {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 2);
        let body = store
            .object("backups", "snapshots/dynamodb_backup_2024_01_02_03_04_05_busy.json")
            .expect("artifact written");
        assert_eq!(std::str::from_utf8(&body)?.lines().count(), 25);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_scan_throttling_fails_the_job() {
        let db = MemoryDatabase::new()
            .with_table("busy", items("b", 5))
            .throttle_scans_of("busy", MAX_RETRIES + 1);
        let store = MemoryStore::new().with_bucket("backups");

        let job = run_backup_job(&context(&db, &store), "busy", &EventSink::log_only()).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(matches!(job.error.as_deref(), Some(AppError::DatabaseIo(_))));
        assert!(store.keys("backups").is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let db = MemoryDatabase::new().with_table("t", items("x", 5));
        // No bucket, so the upload fails.
        let store = MemoryStore::new();

        let job = run_backup_job(&context(&db, &store), "t", &EventSink::log_only()).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(matches!(job.error.as_deref(), Some(AppError::StorageIo(_))));
    }
}
