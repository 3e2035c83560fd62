// dynamotool/src/job/restore.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::io::InspectReader;
use tokio_util::sync::CancellationToken;

use super::{EventSink, JobEvent, JobKind, MAX_RETRIES, TableJob, retry_backoff};
use crate::clients::{Database, ObjectInfo, ObjectStore};
use crate::config::RestoreConfig;
use crate::errors::{AppError, Result};
use crate::record::{Record, decode_line};

/// BatchWriteItem accepts at most this many items per request.
pub(crate) const BATCH_SIZE: usize = 25;

/// Shared by every job of one restore run.
#[derive(Clone)]
pub struct RestoreJobContext {
    pub db: Arc<dyn Database>,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<RestoreConfig>,
    /// Global bound on in-flight batches across all tables.
    pub batch_slots: Arc<Semaphore>,
    /// Cancelled on the first fatal error; no batch starts afterwards.
    pub abort: CancellationToken,
}

/// Restores one artifact into `table`.
///
/// Any failure cancels `ctx.abort` before this returns, which stops every
/// other job of the run at its next batch. A job that finds the run already
/// aborted before starting is returned `Pending`.
pub async fn run_restore_job(
    ctx: &RestoreJobContext,
    artifact: &ObjectInfo,
    table: &str,
    events: &EventSink,
) -> TableJob {
    let mut job = TableJob::new(table, JobKind::Restore);
    if ctx.abort.is_cancelled() {
        tracing::debug!(table, key = %artifact.key, "restore run aborted before job start");
        return job;
    }

    job.start(events);
    match restore_artifact(ctx, artifact, table, events).await {
        Ok(items) => {
            job.items = items;
            job.succeed(events);
        }
        Err(e) => {
            ctx.abort.cancel();
            job.fail(e, events);
        }
    }
    job
}

async fn restore_artifact(
    ctx: &RestoreJobContext,
    artifact: &ObjectInfo,
    table: &str,
    events: &EventSink,
) -> Result<u64> {
    if !ctx.db.table_exists(table).await? {
        return Err(AppError::TableNotFound(table.to_string()));
    }

    let body = ctx.store.get_object(&ctx.config.bucket, &artifact.key).await?;
    let consumed = Arc::new(AtomicU64::new(0));
    let counter = consumed.clone();
    let reader = InspectReader::new(body.reader, move |chunk: &[u8]| {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    });
    let mut lines = BufReader::new(reader).lines();

    let mut writer = BatchWriter {
        ctx,
        table,
        events,
        in_flight: JoinSet::new(),
        batches_sent: 0,
        items_written: 0,
        first_error: None,
        content_length: body.content_length,
        consumed,
    };

    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let read_result: Result<()> = async {
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AppError::StorageIo(format!("Failed to read {}: {}", artifact.key, e)))?
        {
            let Some(record) = decode_line(&line)? else { continue };
            batch.push(record);
            if batch.len() == BATCH_SIZE {
                writer.submit(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            writer.submit(batch).await?;
        }
        Ok(())
    }
    .await;

    // Batches already in flight drain either way. A read stopped by the
    // abort reports the batch error that caused it.
    let drained = writer.drain().await;
    match (read_result, drained) {
        (Err(AppError::Cancelled(_)), Err(cause)) => Err(cause),
        (Err(e), _) => Err(e),
        (Ok(()), drained) => drained,
    }
}

struct BatchWriter<'a> {
    ctx: &'a RestoreJobContext,
    table: &'a str,
    events: &'a EventSink,
    in_flight: JoinSet<Result<u64>>,
    batches_sent: usize,
    items_written: u64,
    first_error: Option<AppError>,
    content_length: u64,
    consumed: Arc<AtomicU64>,
}

impl BatchWriter<'_> {
    async fn submit(&mut self, records: Vec<Record>) -> Result<()> {
        while let Some(done) = self.in_flight.try_join_next() {
            self.record(done);
        }
        if let Some(err) = self.first_error.take() {
            return Err(err);
        }

        let permit = tokio::select! {
            biased;
            _ = self.ctx.abort.cancelled() => None,
            permit = self.ctx.batch_slots.clone().acquire_owned() => permit.ok(),
        };
        let permit = match permit {
            Some(permit) if !self.ctx.abort.is_cancelled() => permit,
            _ => return Err(AppError::Cancelled(format!("restore of {} stopped", self.table))),
        };
        // Batches that freed a slot while we waited.
        while let Some(done) = self.in_flight.try_join_next() {
            self.record(done);
        }

        self.in_flight.spawn(write_batch(
            self.ctx.db.clone(),
            self.table.to_string(),
            records,
            self.ctx.config.overwrite_existing,
            self.events.clone(),
            self.ctx.abort.clone(),
            permit,
        ));
        self.batches_sent += 1;

        let consumed = self.consumed.load(Ordering::Relaxed);
        self.events.emit(JobEvent::Progress {
            table: self.table.to_string(),
            batches_sent: self.batches_sent,
            requests_in_flight: self.in_flight.len(),
            bytes_remaining: self.content_length.saturating_sub(consumed),
        });
        Ok(())
    }

    fn record(&mut self, done: std::result::Result<Result<u64>, tokio::task::JoinError>) {
        match done {
            Ok(Ok(written)) => self.items_written += written,
            Ok(Err(e)) => {
                self.first_error.get_or_insert(e);
            }
            Err(join_err) => {
                self.ctx.abort.cancel();
                self.first_error
                    .get_or_insert(AppError::DatabaseIo(format!("batch task failed: {}", join_err)));
            }
        }
    }

    async fn drain(mut self) -> Result<u64> {
        while let Some(done) = self.in_flight.join_next().await {
            self.record(done);
        }
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(self.items_written),
        }
    }
}

/// Writes one batch, retrying throttles and unprocessed items with
/// exponential backoff. The permit is held until the batch is settled, and
/// on a fatal error the run is cancelled before the permit is released.
async fn write_batch(
    db: Arc<dyn Database>,
    table: String,
    records: Vec<Record>,
    overwrite: bool,
    events: EventSink,
    abort: CancellationToken,
    permit: OwnedSemaphorePermit,
) -> Result<u64> {
    let result = write_with_retry(db.as_ref(), &table, records, overwrite, &events).await;
    if result.is_err() {
        abort.cancel();
    }
    drop(permit);
    result
}

async fn write_with_retry(
    db: &dyn Database,
    table: &str,
    records: Vec<Record>,
    overwrite: bool,
    events: &EventSink,
) -> Result<u64> {
    let mut backoff = retry_backoff();
    let mut pending = records;
    let mut written = 0u64;

    loop {
        match db.batch_write(table, pending.clone(), overwrite).await {
            Ok(outcome) => {
                written += (outcome.written + outcome.skipped) as u64;
                if outcome.unprocessed.is_empty() {
                    return Ok(written);
                }
                events.warning(
                    table,
                    format!("{} items unprocessed, retrying", outcome.unprocessed.len()),
                );
                pending = outcome.unprocessed;
            }
            Err(e) if e.is_throttle() => {
                events.warning(table, format!("{}, retrying", e));
            }
            Err(e) => return Err(e),
        }

        match backoff.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                return Err(AppError::DatabaseIo(format!(
                    "gave up on {} items for {} after {} retries",
                    pending.len(),
                    table,
                    MAX_RETRIES
                )));
            }
        }
    }
}
