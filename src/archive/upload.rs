// dynamotool/src/archive/upload.rs
use std::path::Path;
use std::sync::Arc;

use async_zip::base::read::stream::ZipFileReader;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use super::{UploadSummary, ensure_bucket};
use crate::clients::ObjectStore;
use crate::errors::{AppError, Result};

/// Uploads running at once. Each holds one pipe of `PIPE_CAPACITY` bytes.
const MAX_CONCURRENT_UPLOADS: usize = 8;
const PIPE_CAPACITY: usize = 256 * 1024;

/// Unpacks a zip archive straight into `bucket`, creating the bucket if it
/// does not exist. Each file entry becomes one object keyed by its path
/// inside the archive; directory entries are skipped.
///
/// Entries are read in archive order and piped into concurrent uploads, so
/// neither an entry nor the archive is ever held in memory whole.
pub async fn upload_archive(store: Arc<dyn ObjectStore>, bucket: &str, archive_path: &Path) -> Result<UploadSummary> {
    let file = tokio::fs::File::open(archive_path)
        .await
        .map_err(|e| AppError::StorageIo(format!("Failed to open archive {}: {}", archive_path.display(), e)))?;

    let bucket_created = ensure_bucket(store.as_ref(), bucket).await?;
    tracing::info!(bucket, archive = %archive_path.display(), bucket_created, "uploading archive");

    let mut uploads = Uploads::new(store, bucket);
    let read_result = feed_entries(file, &mut uploads).await;
    let summary = uploads.finish(bucket_created).await;

    // A failed upload also breaks the pipe the reader was filling, so its
    // error is the one worth reporting.
    let summary = summary?;
    read_result?;

    tracing::info!(bucket, objects = summary.objects, bytes = summary.bytes, "archive uploaded");
    Ok(summary)
}

async fn feed_entries(file: tokio::fs::File, uploads: &mut Uploads) -> Result<()> {
    let mut zip = ZipFileReader::with_tokio(BufReader::new(file));
    while let Some(mut entry) = zip.next_with_entry().await? {
        if uploads.reap() {
            return Ok(());
        }
        let meta = entry.reader().entry();
        let key = if meta.dir()? {
            None
        } else {
            object_key(meta.filename().as_str()?)
        };
        let Some(key) = key else {
            zip = entry.skip().await?;
            continue;
        };

        let mut pipe = uploads.start(key.clone()).await;
        tokio::io::copy(&mut entry.reader_mut().compat(), &mut pipe)
            .await
            .map_err(|e| AppError::StorageIo(format!("Failed to stream {}: {}", key, e)))?;
        pipe.shutdown()
            .await
            .map_err(|e| AppError::StorageIo(format!("Failed to stream {}: {}", key, e)))?;
        zip = entry.done().await?;
    }
    Ok(())
}

/// Uploads in flight, bounded by `MAX_CONCURRENT_UPLOADS`.
struct Uploads {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    slots: Arc<Semaphore>,
    running: JoinSet<Result<(String, u64)>>,
    summary: UploadSummary,
    error: Option<AppError>,
}

impl Uploads {
    fn new(store: Arc<dyn ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
            running: JoinSet::new(),
            summary: UploadSummary::default(),
            error: None,
        }
    }

    /// Settles finished uploads. True once any of them failed.
    fn reap(&mut self) -> bool {
        while let Some(done) = self.running.try_join_next() {
            self.settle(done);
        }
        self.error.is_some()
    }

    /// Starts uploading `key` and returns the pipe its content goes into.
    async fn start(&mut self, key: String) -> DuplexStream {
        let (pipe, body) = tokio::io::duplex(PIPE_CAPACITY);
        let permit = self.slots.clone().acquire_owned().await.ok();
        let store = self.store.clone();
        let bucket = self.bucket.clone();
        self.running.spawn(async move {
            let stored = store.put_object(&bucket, &key, Box::pin(body), None).await?;
            drop(permit);
            Ok((key, stored))
        });
        pipe
    }

    async fn finish(mut self, bucket_created: bool) -> Result<UploadSummary> {
        while let Some(done) = self.running.join_next().await {
            self.settle(done);
        }
        if let Some(e) = self.error {
            return Err(e);
        }
        self.summary.bucket_created = bucket_created;
        Ok(self.summary)
    }

    fn settle(&mut self, done: std::result::Result<Result<(String, u64)>, tokio::task::JoinError>) {
        match done {
            Ok(Ok((key, bytes))) => {
                tracing::debug!(%key, bytes, "object uploaded");
                self.summary.objects += 1;
                self.summary.bytes += bytes;
            }
            Ok(Err(e)) => {
                self.error.get_or_insert(e);
            }
            Err(e) => {
                self.error
                    .get_or_insert(AppError::StorageIo(format!("upload task failed: {}", e)));
            }
        }
    }
}

/// Archive entry name to object key: `./a/b.json` becomes `a/b.json`. Names
/// that are absolute or climb out of the archive root are rejected.
fn object_key(name: &str) -> Option<String> {
    if name.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part => parts.push(part),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}
