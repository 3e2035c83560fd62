// dynamotool/src/archive/mod.rs
//! Archive Transfer: a whole bucket to and from one zip archive.
//!
//! Both directions stream through `async_zip`: downloads write deflate
//! entries with trailing data descriptors, uploads read entries in order
//! from the local headers. Neither side holds a whole object or the whole
//! archive.

pub(crate) mod download;
pub(crate) mod upload;

pub use download::download_bucket;
pub use upload::upload_archive;

use crate::clients::{BucketStatus, ObjectStore};
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub objects: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub objects: usize,
    pub bytes: u64,
    pub bucket_created: bool,
}

/// Makes sure `bucket` exists. Returns true when it had to be created.
///
/// Only a definite "not found" leads to creation; any other failure to
/// inspect the bucket is a provisioning error.
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<bool> {
    match store.head_bucket(bucket).await {
        Ok(BucketStatus::Exists) => Ok(false),
        Ok(BucketStatus::NotFound) => {
            let region = store.default_region().to_string();
            tracing::info!(bucket, %region, "bucket not found, creating it");
            store.create_bucket(bucket, &region).await.map_err(|e| match e {
                AppError::BucketProvisioning(_) => e,
                other => AppError::BucketProvisioning(format!("Failed to create bucket {}: {}", bucket, other)),
            })?;
            Ok(true)
        }
        Err(AppError::BucketProvisioning(msg)) => Err(AppError::BucketProvisioning(msg)),
        Err(e) => Err(AppError::BucketProvisioning(format!(
            "Failed to inspect bucket {}: {}",
            bucket, e
        ))),
    }
}
