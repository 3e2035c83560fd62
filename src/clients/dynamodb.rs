// dynamotool/src/clients/dynamodb.rs
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb as dynamodb;
use aws_sdk_dynamodb::error::SdkError;
use dynamodb::error::DisplayErrorContext;
use dynamodb::primitives::Blob;
use dynamodb::types::{AttributeValue, KeyType, PutRequest, TableDescription, WriteRequest};
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use super::{BatchWriteOutcome, Database};
use crate::config::AwsSettings;
use crate::errors::{AppError, Result};
use crate::record::{AttrValue, Record};
use crate::utils::aws::load_sdk_config;

/// Pause between throttled scan pages. Provisioned capacity refills per second.
const SCAN_PAGE_INTERVAL: Duration = Duration::from_secs(1);

type Item = HashMap<String, AttributeValue>;

fn db_error<E>(what: String, err: E) -> AppError
where
    E: std::error::Error,
{
    AppError::DatabaseIo(format!("{}: {}", what, DisplayErrorContext(err)))
}

pub struct DynamoDatabase {
    client: dynamodb::Client,
    /// Partition key per table, needed for conditional (non-overwriting) puts.
    partition_keys: Mutex<HashMap<String, String>>,
}

impl DynamoDatabase {
    pub async fn connect(settings: &AwsSettings) -> Self {
        let sdk_config = load_sdk_config(settings).await;
        let mut builder = dynamodb::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.dynamodb_endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: dynamodb::Client::from_conf(builder.build()),
            partition_keys: Mutex::new(HashMap::new()),
        }
    }

    async fn describe(&self, name: &str) -> Result<Option<TableDescription>> {
        describe_table(&self.client, name).await
    }

    async fn partition_key(&self, name: &str) -> Result<String> {
        if let Some(key) = self.partition_keys.lock().ok().and_then(|m| m.get(name).cloned()) {
            return Ok(key);
        }
        let table = self
            .describe(name)
            .await?
            .ok_or_else(|| AppError::TableNotFound(name.to_string()))?;
        let key = table
            .key_schema()
            .iter()
            .find(|k| *k.key_type() == KeyType::Hash)
            .map(|k| k.attribute_name().to_string())
            .ok_or_else(|| AppError::DatabaseIo(format!("Table {} has no partition key", name)))?;
        if let Ok(mut keys) = self.partition_keys.lock() {
            keys.insert(name.to_string(), key.clone());
        }
        Ok(key)
    }

    async fn put_all(&self, name: &str, records: Vec<Record>) -> Result<BatchWriteOutcome> {
        let written = records.len();
        let requests = records
            .into_iter()
            .map(|record| {
                let put = PutRequest::builder()
                    .set_item(Some(to_item(record)))
                    .build()
                    .map_err(|e| AppError::DatabaseIo(format!("Invalid put request: {}", e)))?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(name, requests)
            .send()
            .await
            .map_err(|err| {
                let throttled = err.as_service_error().is_some_and(|e| {
                    e.is_provisioned_throughput_exceeded_exception() || e.is_request_limit_exceeded()
                });
                if throttled {
                    AppError::Throttled(format!("Batch write to {} throttled", name))
                } else {
                    db_error(format!("Batch write to {} failed", name), err)
                }
            })?;

        let unprocessed: Vec<Record> = output
            .unprocessed_items()
            .and_then(|items| items.get(name))
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(|r| r.put_request())
                    .map(|p| from_item(p.item()))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(BatchWriteOutcome {
            written: written - unprocessed.len(),
            skipped: 0,
            unprocessed,
        })
    }

    /// Writes each item only if its partition key is absent.
    async fn put_missing(&self, name: &str, records: Vec<Record>) -> Result<BatchWriteOutcome> {
        let partition_key = self.partition_key(name).await?;
        let mut outcome = BatchWriteOutcome::default();
        let mut pending = records.into_iter();

        while let Some(record) = pending.next() {
            let result = self
                .client
                .put_item()
                .table_name(name)
                .set_item(Some(to_item(record.clone())))
                .condition_expression("attribute_not_exists(#pk)")
                .expression_attribute_names("#pk", &partition_key)
                .send()
                .await;
            match result {
                Ok(_) => outcome.written += 1,
                Err(err) => {
                    let service = err.as_service_error();
                    if service.is_some_and(|e| e.is_conditional_check_failed_exception()) {
                        outcome.skipped += 1;
                    } else if service.is_some_and(|e| {
                        e.is_provisioned_throughput_exceeded_exception() || e.is_request_limit_exceeded()
                    }) {
                        // Hand the rest back so the runner can back off and retry.
                        outcome.unprocessed.push(record);
                        outcome.unprocessed.extend(pending);
                        break;
                    } else {
                        return Err(db_error(format!("Put into {} failed", name), err));
                    }
                }
            }
        }
        Ok(outcome)
    }
}

async fn describe_table(client: &dynamodb::Client, name: &str) -> Result<Option<TableDescription>> {
    match client.describe_table().table_name(name).send().await {
        Ok(output) => Ok(output.table),
        Err(SdkError::ServiceError(ctx)) if ctx.err().is_resource_not_found_exception() => Ok(None),
        Err(err) => Err(db_error(format!("Failed to describe table {}", name), err)),
    }
}

/// Items per scan page for the given share of provisioned read capacity.
/// `None` means on-demand or unthrottled.
fn scan_page_limit(read_capacity_units: Option<i64>, read_fraction: f64) -> Option<i32> {
    let units = read_capacity_units.filter(|u| *u > 0)?;
    if read_fraction >= 1.0 {
        return None;
    }
    let limit = (units as f64 * read_fraction).floor() as i64;
    Some(limit.clamp(1, i32::MAX as i64) as i32)
}

struct ScanState {
    client: dynamodb::Client,
    table: String,
    read_fraction: f64,
    limit: Option<Option<i32>>,
    start_key: Option<Item>,
    finished: bool,
}

async fn next_scan_page(state: &mut ScanState) -> Result<Vec<Record>> {
    let limit = match state.limit {
        Some(limit) => {
            if limit.is_some() {
                tokio::time::sleep(SCAN_PAGE_INTERVAL).await;
            }
            limit
        }
        None => {
            let table = describe_table(&state.client, &state.table)
                .await?
                .ok_or_else(|| AppError::TableNotFound(state.table.clone()))?;
            let units = table
                .provisioned_throughput()
                .and_then(|p| p.read_capacity_units());
            let limit = scan_page_limit(units, state.read_fraction);
            tracing::debug!(table = %state.table, ?limit, "scan page limit");
            state.limit = Some(limit);
            limit
        }
    };

    let output = state
        .client
        .scan()
        .table_name(&state.table)
        .set_limit(limit)
        .set_exclusive_start_key(state.start_key.clone())
        .send()
        .await
        .map_err(|err| {
            let throttled = err
                .as_service_error()
                .is_some_and(|e| e.is_provisioned_throughput_exceeded_exception());
            if throttled {
                AppError::Throttled(format!("Scan of {} throttled", state.table))
            } else {
                db_error(format!("Scan of {} failed", state.table), err)
            }
        })?;

    let records = output
        .items()
        .iter()
        .map(from_item)
        .collect::<Result<Vec<_>>>()?;
    state.start_key = output.last_evaluated_key().cloned();
    state.finished = state.start_key.is_none();
    Ok(records)
}

#[async_trait]
impl Database for DynamoDatabase {
    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.describe(name).await?.is_some())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut pages = self.client.list_tables().into_paginator().send();
        let mut tables = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| db_error("Failed to list tables".to_string(), e))?;
            tables.extend(page.table_names().iter().cloned());
        }
        Ok(tables)
    }

    fn scan_table(&self, name: &str, read_fraction: f64) -> BoxStream<'static, Result<Vec<Record>>> {
        let state = ScanState {
            client: self.client.clone(),
            table: name.to_string(),
            read_fraction,
            limit: None,
            start_key: None,
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match next_scan_page(&mut state).await {
                Ok(records) => Some((Ok(records), state)),
                Err(e) => {
                    // A throttled page keeps its start key and is tried again.
                    state.finished = !e.is_throttle();
                    Some((Err(e), state))
                }
            }
        })
        .boxed()
    }

    async fn batch_write(&self, name: &str, records: Vec<Record>, overwrite: bool) -> Result<BatchWriteOutcome> {
        if records.is_empty() {
            return Ok(BatchWriteOutcome::default());
        }
        if overwrite {
            self.put_all(name, records).await
        } else {
            self.put_missing(name, records).await
        }
    }
}

fn to_item(record: Record) -> Item {
    record.into_iter().map(|(k, v)| (k, to_attribute(v))).collect()
}

fn to_attribute(value: AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s),
        AttrValue::N(n) => AttributeValue::N(n),
        AttrValue::B(b) => AttributeValue::B(Blob::new(b)),
        AttrValue::Bool(b) => AttributeValue::Bool(b),
        AttrValue::Null => AttributeValue::Null(true),
        AttrValue::L(items) => AttributeValue::L(items.into_iter().map(to_attribute).collect()),
        AttrValue::M(map) => AttributeValue::M(to_item(map)),
        AttrValue::Ss(items) => AttributeValue::Ss(items),
        AttrValue::Ns(items) => AttributeValue::Ns(items),
        AttrValue::Bs(items) => AttributeValue::Bs(items.into_iter().map(Blob::new).collect()),
    }
}

fn from_item(item: &Item) -> Result<Record> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), from_attribute(v)?)))
        .collect()
}

fn from_attribute(value: &AttributeValue) -> Result<AttrValue> {
    let converted = match value {
        AttributeValue::S(s) => AttrValue::S(s.clone()),
        AttributeValue::N(n) => AttrValue::N(n.clone()),
        AttributeValue::B(b) => AttrValue::B(b.as_ref().to_vec()),
        AttributeValue::Bool(b) => AttrValue::Bool(*b),
        AttributeValue::Null(_) => AttrValue::Null,
        AttributeValue::L(items) => AttrValue::L(items.iter().map(from_attribute).collect::<Result<_>>()?),
        AttributeValue::M(map) => AttrValue::M(from_item(map)?),
        AttributeValue::Ss(items) => AttrValue::Ss(items.clone()),
        AttributeValue::Ns(items) => AttrValue::Ns(items.clone()),
        AttributeValue::Bs(items) => AttrValue::Bs(items.iter().map(|b| b.as_ref().to_vec()).collect()),
        other => {
            return Err(AppError::Codec(format!("unsupported attribute value: {:?}", other)));
        }
    };
    Ok(converted)
}
