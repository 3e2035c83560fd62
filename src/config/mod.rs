// dynamotool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::record::BinaryEncoding;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_KEY_PREFIX: &str = "dynamodb-backups";
const DEFAULT_READ_THROTTLE_FRACTION: f64 = 0.5;
const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 200;
const DEFAULT_MAX_CONCURRENT_TABLES: usize = 4;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonAwsConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub dynamodb_endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub excluded_tables: Option<Vec<String>>,
    pub read_throttle_fraction: Option<f64>,
    pub stop_on_first_failure: Option<bool>,
    pub binary_encoding: Option<BinaryEncoding>,
    pub key_prefix: Option<String>,
    pub max_concurrent_tables: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub overwrite_existing: Option<bool>,
    pub max_concurrent_batches: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub aws: Option<JsonAwsConfig>,
    pub bucket_name: Option<String>,
    pub backup: Option<JsonBackupOptions>,
    pub restore: Option<JsonRestoreOptions>,
}

// Application's internal configuration structs

/// Connection settings shared by the S3 and DynamoDB clients.
#[derive(Debug, Clone, PartialEq)]
pub struct AwsSettings {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub dynamodb_endpoint_url: Option<String>,
}

/// Settings for one Backup Orchestrator invocation.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub bucket: String,
    pub excluded_tables: HashSet<String>,
    /// Upper bound on the share of provisioned read capacity a scan may use.
    pub read_throttle_fraction: f64,
    pub stop_on_first_failure: bool,
    pub binary_encoding: BinaryEncoding,
    pub key_prefix: String,
    /// `None` lets every submitted table run at once.
    pub max_concurrent_tables: Option<usize>,
}

/// Restore settings that do not depend on the invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoreOptions {
    pub overwrite_existing: bool,
    pub max_concurrent_batches: usize,
}

/// Settings for one Restore Orchestrator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreConfig {
    pub bucket: String,
    pub source_prefix: String,
    pub overwrite_existing: bool,
    pub max_concurrent_batches: usize,
}

impl RestoreConfig {
    pub fn new(bucket: impl Into<String>, source_prefix: impl Into<String>, options: RestoreOptions) -> Self {
        Self {
            bucket: bucket.into(),
            source_prefix: source_prefix.into(),
            overwrite_existing: options.overwrite_existing,
            max_concurrent_batches: options.max_concurrent_batches,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub aws: AwsSettings,
    pub bucket_name: String,
    pub backup: BackupConfig,
    pub restore: RestoreOptions,
}

impl AppConfig {
    /// Loads `config.json` if it exists, then applies environment overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = if config_path.exists() {
            let config_content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
            serde_json::from_str(&config_content).with_context(|| {
                format!("Failed to parse JSON from config file at {}", config_path.display())
            })?
        } else {
            tracing::debug!(path = %config_path.display(), "config file not found, using environment only");
            RawJsonConfig::default()
        };

        let raw = apply_env_overrides(raw, |name| std::env::var(name).ok());
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let aws_raw = raw.aws.unwrap_or_default();
        let aws = AwsSettings {
            region: non_empty(aws_raw.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key_id: non_empty(aws_raw.access_key_id),
            secret_access_key: non_empty(aws_raw.secret_access_key),
            endpoint_url: non_empty(aws_raw.endpoint_url),
            dynamodb_endpoint_url: non_empty(aws_raw.dynamodb_endpoint_url),
        };
        if aws.access_key_id.is_some() != aws.secret_access_key.is_some() {
            anyhow::bail!("access_key_id and secret_access_key must be set together");
        }

        let bucket_name = non_empty(raw.bucket_name)
            .context("bucket_name must be set in config.json or AWS_BUCKET_NAME")?;

        let backup = load_backup_config(raw.backup.unwrap_or_default(), &bucket_name)?;
        let restore = load_restore_options(raw.restore.unwrap_or_default())?;

        Ok(AppConfig {
            aws,
            bucket_name,
            backup,
            restore,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Environment variables win over the file, matching the `.env` layout the
/// service has always used.
fn apply_env_overrides(mut raw: RawJsonConfig, lookup: impl Fn(&str) -> Option<String>) -> RawJsonConfig {
    let mut aws = raw.aws.take().unwrap_or_default();
    if let Some(v) = lookup("AWS_REGION") {
        aws.region = Some(v);
    }
    if let Some(v) = lookup("AWS_ACCESS_KEY_ID") {
        aws.access_key_id = Some(v);
    }
    if let Some(v) = lookup("AWS_SECRET_ACCESS_KEY") {
        aws.secret_access_key = Some(v);
    }
    if let Some(v) = lookup("AWS_ENDPOINT_URL") {
        aws.endpoint_url = Some(v);
    }
    raw.aws = Some(aws);

    if let Some(v) = lookup("AWS_BUCKET_NAME") {
        raw.bucket_name = Some(v);
    }
    raw
}

fn load_backup_config(opts: JsonBackupOptions, bucket: &str) -> Result<BackupConfig> {
    let read_throttle_fraction = opts
        .read_throttle_fraction
        .unwrap_or(DEFAULT_READ_THROTTLE_FRACTION);
    if !(0.0..=1.0).contains(&read_throttle_fraction) {
        anyhow::bail!(
            "backup.read_throttle_fraction must be between 0.0 and 1.0, got {}",
            read_throttle_fraction
        );
    }

    let max_concurrent_tables = match opts.max_concurrent_tables {
        Some(0) => anyhow::bail!("backup.max_concurrent_tables must be at least 1"),
        Some(n) => Some(n),
        None => Some(DEFAULT_MAX_CONCURRENT_TABLES),
    };

    Ok(BackupConfig {
        bucket: bucket.to_string(),
        excluded_tables: opts.excluded_tables.unwrap_or_default().into_iter().collect(),
        read_throttle_fraction,
        stop_on_first_failure: opts.stop_on_first_failure.unwrap_or(true),
        binary_encoding: opts.binary_encoding.unwrap_or_default(),
        key_prefix: opts
            .key_prefix
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        max_concurrent_tables,
    })
}

fn load_restore_options(opts: JsonRestoreOptions) -> Result<RestoreOptions> {
    let max_concurrent_batches = opts
        .max_concurrent_batches
        .unwrap_or(DEFAULT_MAX_CONCURRENT_BATCHES);
    if max_concurrent_batches == 0 {
        anyhow::bail!("restore.max_concurrent_batches must be at least 1");
    }
    Ok(RestoreOptions {
        overwrite_existing: opts.overwrite_existing.unwrap_or(true),
        max_concurrent_batches,
    })
}
