// dynamotool/src/clients/mod.rs
//! Narrow interfaces to the database and the object store.
//!
//! Orchestrators only see these traits; `dynamodb` and `s3` hold the AWS
//! implementations and `memory` holds in-process fakes used by the tests.

pub(crate) mod dynamodb;
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::io::AsyncRead;

use crate::errors::Result;
use crate::record::Record;

/// Streaming object content.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// One listed object. Also the artifact descriptor used by restore discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct ObjectBody {
    pub content_length: u64,
    pub reader: ObjectReader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Exists,
    NotFound,
}

/// Result of one batch write. Items the database did not accept come back in
/// `unprocessed` and are the caller's to retry.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    pub written: usize,
    /// Items left untouched because they already existed and overwrite was off.
    pub skipped: usize,
    pub unprocessed: Vec<Record>,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn table_exists(&self, name: &str) -> Result<bool>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Lazily scans a table page by page. `read_fraction` caps the share of
    /// provisioned read capacity the scan may consume.
    ///
    /// A `Throttled` item means the page was not read; polling again retries
    /// it from the same position. Any other error ends the stream.
    fn scan_table(&self, name: &str, read_fraction: f64) -> BoxStream<'static, Result<Vec<Record>>>;

    async fn batch_write(&self, name: &str, records: Vec<Record>, overwrite: bool) -> Result<BatchWriteOutcome>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody>;

    /// Uploads `body` under `key` and returns the number of bytes stored.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectReader,
        content_length: Option<u64>,
    ) -> Result<u64>;

    async fn head_bucket(&self, bucket: &str) -> Result<BucketStatus>;

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Region new buckets are created in.
    fn default_region(&self) -> &str;
}
