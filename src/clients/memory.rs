// dynamotool/src/clients/memory.rs
//! In-process fakes of the database and the object store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::io::AsyncReadExt;

use super::{BatchWriteOutcome, BucketStatus, Database, ObjectBody, ObjectInfo, ObjectReader, ObjectStore};
use crate::errors::{AppError, Result};
use crate::record::{AttrValue, Record};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One entry in the database's write log, in the order writes happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteLogEntry {
    Written { table: String, items: usize },
    Failed { table: String },
    Throttled { table: String },
}

#[derive(Default)]
struct DbState {
    tables: BTreeMap<String, Vec<Record>>,
    failing_scans: HashSet<String>,
    scan_throttles: HashMap<String, usize>,
    failing_writes: HashSet<String>,
    throttles_left: HashMap<String, usize>,
    /// Caps items accepted per call; the rest come back unprocessed.
    accept_limit: Option<usize>,
    log: Vec<WriteLogEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DbState>>,
    page_size: usize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            page_size: 10,
        }
    }

    pub fn with_table(self, name: &str, records: Vec<Record>) -> Self {
        lock(&self.state).tables.insert(name.to_string(), records);
        self
    }

    pub fn fail_scans_of(self, name: &str) -> Self {
        lock(&self.state).failing_scans.insert(name.to_string());
        self
    }

    /// The next scan of `name` is throttled `times` times after its first page.
    pub fn throttle_scans_of(self, name: &str, times: usize) -> Self {
        lock(&self.state).scan_throttles.insert(name.to_string(), times);
        self
    }

    pub fn fail_writes_to(self, name: &str) -> Self {
        lock(&self.state).failing_writes.insert(name.to_string());
        self
    }

    pub fn throttle_writes_to(self, name: &str, times: usize) -> Self {
        lock(&self.state).throttles_left.insert(name.to_string(), times);
        self
    }

    pub fn accept_at_most(self, items: usize) -> Self {
        lock(&self.state).accept_limit = Some(items);
        self
    }

    pub fn drop_table(&self, name: &str) {
        lock(&self.state).tables.remove(name);
    }

    pub fn records(&self, name: &str) -> Vec<Record> {
        lock(&self.state).tables.get(name).cloned().unwrap_or_default()
    }

    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        lock(&self.state).log.clone()
    }
}

fn key_of(record: &Record) -> Option<&AttrValue> {
    record.get("id")
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.state).tables.contains_key(name))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state).tables.keys().cloned().collect())
    }

    fn scan_table(&self, name: &str, _read_fraction: f64) -> BoxStream<'static, Result<Vec<Record>>> {
        let mut state = lock(&self.state);
        if state.failing_scans.contains(name) {
            let err = AppError::DatabaseIo(format!("scan of {} failed", name));
            return stream::iter(vec![Err(err)]).boxed();
        }
        let Some(records) = state.tables.get(name) else {
            return stream::iter(vec![Err(AppError::TableNotFound(name.to_string()))]).boxed();
        };
        let mut pages: Vec<Result<Vec<Record>>> = records
            .chunks(self.page_size.max(1))
            .map(|page| Ok(page.to_vec()))
            .collect();
        let throttles = state.scan_throttles.remove(name).unwrap_or(0);
        let at = pages.len().min(1);
        for _ in 0..throttles {
            pages.insert(at, Err(AppError::Throttled(format!("scan of {} throttled", name))));
        }
        stream::iter(pages).boxed()
    }

    async fn batch_write(&self, name: &str, records: Vec<Record>, overwrite: bool) -> Result<BatchWriteOutcome> {
        // Yield so concurrent jobs interleave the way network calls would.
        tokio::task::yield_now().await;

        let mut state = lock(&self.state);
        if state.failing_writes.contains(name) {
            state.log.push(WriteLogEntry::Failed { table: name.to_string() });
            return Err(AppError::DatabaseIo(format!("write to {} failed", name)));
        }
        if let Some(left) = state.throttles_left.get_mut(name).filter(|left| **left > 0) {
            *left -= 1;
            state.log.push(WriteLogEntry::Throttled { table: name.to_string() });
            return Err(AppError::Throttled(format!("write to {} throttled", name)));
        }

        let accept = state.accept_limit.unwrap_or(records.len()).min(records.len());
        let mut records = records;
        let unprocessed = records.split_off(accept);

        let table = state
            .tables
            .get_mut(name)
            .ok_or_else(|| AppError::TableNotFound(name.to_string()))?;
        let mut outcome = BatchWriteOutcome {
            unprocessed,
            ..Default::default()
        };
        for record in records {
            let existing = table
                .iter()
                .position(|r| key_of(r).is_some() && key_of(r) == key_of(&record));
            match existing {
                Some(_) if !overwrite => outcome.skipped += 1,
                Some(index) => {
                    table[index] = record;
                    outcome.written += 1;
                }
                None => {
                    table.push(record);
                    outcome.written += 1;
                }
            }
        }
        let written = outcome.written;
        state.log.push(WriteLogEntry::Written {
            table: name.to_string(),
            items: written,
        });
        Ok(outcome)
    }
}

#[derive(Default)]
struct StoreState {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failing_gets: HashSet<String>,
    short_bodies: HashSet<String>,
    head_error: Option<String>,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    region: String,
    gets: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            region: "eu-west-1".to_string(),
            gets: Arc::default(),
        }
    }

    pub fn with_object(self, bucket: &str, key: &str, content: impl Into<Vec<u8>>) -> Self {
        lock(&self.state)
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), content.into());
        self
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        lock(&self.state).buckets.entry(bucket.to_string()).or_default();
        self
    }

    pub fn fail_gets_of(self, key: &str) -> Self {
        lock(&self.state).failing_gets.insert(key.to_string());
        self
    }

    /// Serves `key` with a content length one byte larger than its body.
    pub fn short_body_of(self, key: &str) -> Self {
        lock(&self.state).short_bodies.insert(key.to_string());
        self
    }

    /// Makes `head_bucket` fail with something other than not-found.
    pub fn fail_head_with(self, message: &str) -> Self {
        lock(&self.state).head_error = Some(message.to_string());
        self
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).buckets.get(bucket)?.get(key).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        lock(&self.state).buckets.contains_key(bucket)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let state = lock(&self.state);
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| AppError::StorageIo(format!("no such bucket {}", bucket)))?;
        Ok(objects
            .iter()
            .filter(|(key, _)| prefix.is_none_or(|p| key.starts_with(p)))
            .map(|(key, content)| ObjectInfo {
                key: key.clone(),
                size_bytes: content.len() as u64,
                last_modified: Some(Utc::now()),
            })
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        if state.failing_gets.contains(key) {
            return Err(AppError::StorageIo(format!("get of {} failed", key)));
        }
        let content = state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| AppError::StorageIo(format!("no such key {}/{}", bucket, key)))?;
        let advertised = content.len() as u64 + u64::from(state.short_bodies.contains(key));
        Ok(ObjectBody {
            content_length: advertised,
            reader: Box::pin(std::io::Cursor::new(content)),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectReader,
        content_length: Option<u64>,
    ) -> Result<u64> {
        let mut content = Vec::new();
        body.read_to_end(&mut content).await?;
        if let Some(expected) = content_length {
            if expected != content.len() as u64 {
                return Err(AppError::StorageIo(format!(
                    "short body for {}: {} of {} bytes",
                    key,
                    content.len(),
                    expected
                )));
            }
        }
        let len = content.len() as u64;
        let mut state = lock(&self.state);
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| AppError::StorageIo(format!("no such bucket {}", bucket)))?;
        objects.insert(key.to_string(), content);
        Ok(len)
    }

    async fn head_bucket(&self, bucket: &str) -> Result<BucketStatus> {
        let state = lock(&self.state);
        if let Some(message) = &state.head_error {
            return Err(AppError::BucketProvisioning(message.clone()));
        }
        Ok(if state.buckets.contains_key(bucket) {
            BucketStatus::Exists
        } else {
            BucketStatus::NotFound
        })
    }

    async fn create_bucket(&self, bucket: &str, _region: &str) -> Result<()> {
        lock(&self.state).buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn default_region(&self) -> &str {
        &self.region
    }
}

/// Builds a record with an `id` and a numeric `n` attribute.
pub fn item(id: &str, n: u32) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), AttrValue::S(id.to_string()));
    record.insert("n".to_string(), AttrValue::N(n.to_string()));
    record
}

/// Builds `count` records keyed `<prefix>-<i>`.
pub fn items(prefix: &str, count: u32) -> Vec<Record> {
    (0..count).map(|i| item(&format!("{}-{}", prefix, i), i)).collect()
}
