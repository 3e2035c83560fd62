// dynamotool/src/archive/download.rs
use std::sync::Arc;

use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipDateTime, ZipEntryBuilder};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::compat::FuturesAsyncWriteCompatExt;

use super::DownloadSummary;
use crate::clients::{ObjectInfo, ObjectStore};
use crate::errors::{AppError, Result};

/// Streams every object of `bucket` into `writer` as a zip archive.
///
/// Objects are fetched one at a time and copied straight into a deflate
/// entry, so memory stays bounded by one in-flight body no matter how large
/// the bucket is. Directory markers (keys ending in `/`) are skipped.
/// `writer` is shut down once the archive is complete; on failure the
/// central directory is never written and the archive stays unreadable.
pub async fn download_bucket<W>(store: Arc<dyn ObjectStore>, bucket: &str, writer: W) -> Result<DownloadSummary>
where
    W: AsyncWrite + Unpin + Send,
{
    let objects: Vec<_> = store
        .list_objects(bucket, None)
        .await?
        .into_iter()
        .filter(|o| !o.key.ends_with('/'))
        .collect();
    tracing::info!(bucket, objects = objects.len(), "archiving bucket");

    let mut zip = ZipFileWriter::with_tokio(writer);
    let mut summary = DownloadSummary::default();
    for object in &objects {
        let bytes = append_object(&mut zip, store.as_ref(), bucket, object).await?;
        tracing::debug!(key = %object.key, bytes, "object archived");
        summary.objects += 1;
        summary.bytes += bytes;
    }

    let mut writer = zip.close().await?.into_inner();
    writer.shutdown().await?;
    tracing::info!(bucket, objects = summary.objects, bytes = summary.bytes, "bucket archived");
    Ok(summary)
}

async fn append_object<W>(
    zip: &mut ZipFileWriter<W>,
    store: &dyn ObjectStore,
    bucket: &str,
    object: &ObjectInfo,
) -> Result<u64>
where
    W: futures::io::AsyncWrite + Unpin,
{
    let mut body = store.get_object(bucket, &object.key).await?;

    let path = object.key.trim_start_matches('/').to_string();
    let mut entry = ZipEntryBuilder::new(path.into(), Compression::Deflate);
    if let Some(modified) = object.last_modified {
        entry = entry.last_modification_date(ZipDateTime::from_chrono(&modified));
    }

    let mut sink = zip.write_entry_stream(entry).await?.compat_write();
    let copied = tokio::io::copy(&mut body.reader, &mut sink)
        .await
        .map_err(|e| AppError::StorageIo(format!("Failed to archive {}: {}", object.key, e)))?;
    // The entry is sized by what was read, so a short body must fail here.
    if copied != body.content_length {
        return Err(AppError::StorageIo(format!(
            "Body of {} ended after {} of {} bytes",
            object.key, copied, body.content_length
        )));
    }
    sink.into_inner().close().await?;
    Ok(copied)
}
