use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("No backup artifacts found under s3://{bucket}/{prefix}")]
    NoArtifactsFound { bucket: String, prefix: String },

    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    #[error("Database I/O error: {0}")]
    DatabaseIo(String),

    /// Transient write or read throttle. Retried by the job runners.
    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Bucket provisioning failed: {0}")]
    BucketProvisioning(String),

    #[error("Archive error: {0}")]
    Zip(#[from] async_zip::error::ZipError),

    #[error("Malformed record: {0}")]
    Codec(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Restore aborted by fatal error on table {table}: {source}")]
    RestoreAborted {
        table: String,
        #[source]
        source: Arc<AppError>,
    },
}

impl AppError {
    /// True for conditions the transport layer reports as "not found"
    /// rather than as an internal fault.
    pub fn is_not_found(&self) -> bool {
        match self {
            AppError::TableNotFound(_) | AppError::NoArtifactsFound { .. } => true,
            AppError::RestoreAborted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, AppError::Throttled(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds_are_distinguished_from_faults() {
        assert!(AppError::TableNotFound("a".into()).is_not_found());
        assert!(
            AppError::NoArtifactsFound {
                bucket: "b".into(),
                prefix: "p".into()
            }
            .is_not_found()
        );
        assert!(!AppError::StorageIo("boom".into()).is_not_found());
        assert!(!AppError::BucketProvisioning("denied".into()).is_not_found());
    }

    #[test]
    fn test_restore_aborted_keeps_the_underlying_kind() {
        let err = AppError::RestoreAborted {
            table: "users".into(),
            source: Arc::new(AppError::TableNotFound("users".into())),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("users"));
    }
}
