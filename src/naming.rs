// dynamotool/src/naming.rs
//! Mapping between backup artifact keys and table names.
//!
//! Backups are stored as `<prefix>/dynamodb_backup_<YYYY_MM_DD_HH_MM_SS>_<table>.json`
//! with `_` in the table name written as `-`. Restore discovery reverses that
//! with [`table_name_from_key`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::{AppError, Result};

/// Literal tag at the start of every snapshot name.
pub const SNAPSHOT_TAG: &str = "dynamodb_backup";

const ARTIFACT_SUFFIX: &str = ".json";

static SNAPSHOT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^dynamodb_backup_\d{4}_\d{2}_\d{2}_\d{2}_\d{2}_\d{2}_")
        .expect("snapshot prefix pattern is valid")
});

/// Derives the target table name from a stored artifact key.
///
/// Steps, in order: keep the part after the final `/`, strip `.json`
/// (required), turn `-` into `_`, lower-case, drop a leading
/// `dynamodb_backup_<timestamp>_` when present. A name that is empty or
/// still carries a snapshot prefix after that is rejected.
pub fn table_name_from_key(storage_key: &str) -> Result<String> {
    let file_name = storage_key.rsplit('/').next().unwrap_or(storage_key);

    let stem = file_name
        .strip_suffix(ARTIFACT_SUFFIX)
        .ok_or_else(|| AppError::InvalidArtifactName(storage_key.to_string()))?;

    let normalised = stem.replace('-', "_").to_lowercase();
    let table = SNAPSHOT_PREFIX.replace(&normalised, "").into_owned();

    if table.is_empty() || SNAPSHOT_PREFIX.is_match(&table) {
        return Err(AppError::InvalidArtifactName(storage_key.to_string()));
    }
    Ok(table)
}

/// Timestamp segment shared by every artifact written in one backup run.
pub fn snapshot_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y_%m_%d_%H_%M_%S").to_string()
}

/// Storage key for one table's backup artifact.
pub fn backup_key(prefix: &str, timestamp: &str, table_name: &str) -> String {
    let file_name = format!(
        "{}_{}_{}{}",
        SNAPSHOT_TAG,
        timestamp,
        table_name.replace('_', "-"),
        ARTIFACT_SUFFIX
    );
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// True when a listed key looks like a restorable artifact.
pub fn is_artifact_key(key: &str) -> bool {
    !key.ends_with('/') && key.ends_with(ARTIFACT_SUFFIX)
}
