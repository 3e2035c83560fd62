pub mod aws;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("dynamotool=info"))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Splits a restore source into bucket and prefix.
///
/// `s3://bucket/some/prefix` names its own bucket; anything else is a prefix
/// inside `default_bucket`.
pub fn resolve_storage_path(path: &str, default_bucket: &str) -> Result<(String, String)> {
    if !path.starts_with("s3://") {
        return Ok((default_bucket.to_string(), path.trim_start_matches('/').to_string()));
    }
    let uri = url::Url::parse(path).with_context(|| format!("Invalid S3 URI format: {}", path))?;
    let bucket = uri
        .host_str()
        .filter(|h| !h.is_empty())
        .context("S3 URI missing bucket name")?
        .to_string();
    let prefix = uri.path().trim_start_matches('/').to_string();
    Ok((bucket, prefix))
}
