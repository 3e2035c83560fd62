//! DynamoDB Backup/Restore Tool
//!
//! Provides CLI interface for table backup and restore through S3, and for
//! moving whole buckets in and out of zip archives.

// dynamotool/src/main.rs
mod archive;
mod backup;
mod clients;
mod config;
mod errors;
mod job;
mod naming;
mod record;
mod restore;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use backup::{BackupOrchestrator, TableSelector};
use clients::dynamodb::DynamoDatabase;
use clients::s3::S3Store;
use clients::{Database, ObjectStore};
use config::AppConfig;
use errors::AppError;
use job::{EventSink, JobEvent};
use restore::RestoreOrchestrator;

/// Backs up DynamoDB tables to S3 and restores them.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Back up the listed tables, or every table with --all.
    Backup {
        /// Comma separated table names.
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        tables: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Restore every backup artifact under a prefix or `s3://bucket/prefix`.
    Restore { path: String },

    /// Download a whole bucket as a zip archive.
    Download {
        bucket: String,

        /// Defaults to `<bucket>.zip`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload the contents of a zip archive into a bucket.
    Upload { bucket: String, archive: PathBuf },
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    if let Err(e) = utils::init_tracing() {
        eprintln!("❌ Error: {:?}", e);
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(message) => {
            println!("✅ {}", message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            if is_not_found(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<AppError>())
        .any(AppError::is_not_found)
}

/// Echoes job completions to the terminal while the run is going.
fn print_events() -> (EventSink, tokio::task::JoinHandle<()>) {
    let (events, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Completed {
                    table,
                    kind,
                    duration_ms,
                } => println!("✓ {} of {} finished in {} ms", kind, table, duration_ms),
                JobEvent::Failed { table, kind, error } => println!("✗ {} of {} failed: {}", kind, table, error),
                _ => {}
            }
        }
    });
    (events, printer)
}

async fn run_app(cli: Cli) -> Result<String> {
    let app_config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&app_config.aws).await);

    match cli.command {
        Commands::Backup { tables, all } => {
            let selector = match tables {
                Some(list) if !all => TableSelector::from_csv(&list),
                _ => TableSelector::All,
            };
            println!("🚀 Starting Backup Process...");
            let db: Arc<dyn Database> = Arc::new(DynamoDatabase::connect(&app_config.aws).await);
            let orchestrator = BackupOrchestrator::new(db, store, app_config.backup.clone());
            let (events, printer) = print_events();
            let submission = orchestrator
                .submit(selector, events)
                .await
                .context("Backup submission failed")?;
            for skipped in &submission.skipped {
                println!("⏭  Skipped {} ({:?})", skipped.table, skipped.reason);
            }
            println!("Submitted {} table backups", submission.submitted.len());
            let report = submission.await_completion().await.context("Backup process failed")?;
            let _ = printer.await;

            let failed: Vec<_> = report.failed().map(|j| j.table_name.clone()).collect();
            if !failed.is_empty() {
                anyhow::bail!(
                    "{} of {} table backups failed: {}",
                    failed.len(),
                    report.jobs.len(),
                    failed.join(", ")
                );
            }
            if report.halted {
                anyhow::bail!("Backup halted before every table was started");
            }
            Ok(format!(
                "Backed up {} tables to s3://{}/{} (snapshot {})",
                report.succeeded(),
                app_config.backup.bucket,
                app_config.backup.key_prefix,
                report.timestamp
            ))
        }
        Commands::Restore { path } => {
            let (bucket, prefix) = utils::resolve_storage_path(&path, &app_config.bucket_name)?;
            println!("🔄 Starting Restore Process from s3://{}/{} ...", bucket, prefix);
            let db: Arc<dyn Database> = Arc::new(DynamoDatabase::connect(&app_config.aws).await);
            let orchestrator = RestoreOrchestrator::new(db, store, app_config.restore);
            let (events, printer) = print_events();
            let run = orchestrator
                .submit(&bucket, &prefix, events)
                .await
                .context("Restore process failed")?;

            let abort = run.abort_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("⚠️ Interrupted, letting in-flight batches finish...");
                    abort.cancel();
                }
            });
            let report = run.await_completion().await.context("Restore process failed")?;
            let _ = printer.await;
            for skipped in &report.skipped_artifacts {
                println!("⏭  Skipped artifact {}", skipped);
            }
            Ok(format!(
                "Restored {} items into {} tables",
                report.items_restored(),
                report.jobs.len()
            ))
        }
        Commands::Download { bucket, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.zip", bucket)));
            println!("📦 Downloading s3://{} to {}", bucket, output.display());
            let file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Failed to create archive file: {}", output.display()))?;
            let summary = archive::download_bucket(store, &bucket, file)
                .await
                .context("Bucket download failed")?;
            Ok(format!(
                "Archived {} objects ({} bytes) to {}",
                summary.objects,
                summary.bytes,
                output.display()
            ))
        }
        Commands::Upload {
            bucket,
            archive: archive_path,
        } => {
            println!("📤 Uploading {} to s3://{}", archive_path.display(), bucket);
            let summary = archive::upload_archive(store, &bucket, &archive_path)
                .await
                .context("Archive upload failed")?;
            Ok(format!(
                "Uploaded {} objects ({} bytes) to s3://{}{}",
                summary.objects,
                summary.bytes,
                bucket,
                if summary.bucket_created { " (bucket created)" } else { "" }
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errors_are_recognised_through_context() {
        let err = anyhow::Error::new(AppError::NoArtifactsFound {
            bucket: "b".into(),
            prefix: "p".into(),
        })
        .context("Restore process failed");
        assert!(is_not_found(&err));

        let err = anyhow::Error::new(AppError::StorageIo("boom".into())).context("Bucket download failed");
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_backup_requires_a_table_selection() {
        assert!(Cli::try_parse_from(["dynamotool", "backup"]).is_err());
        assert!(Cli::try_parse_from(["dynamotool", "backup", "--all", "--tables", "a"]).is_err());
        let cli = Cli::try_parse_from(["dynamotool", "backup", "--tables", "a,b"]).expect("valid");
        assert!(matches!(cli.command, Commands::Backup { tables: Some(_), all: false }));
    }

    #[test]
    fn test_download_output_is_optional() {
        let cli = Cli::try_parse_from(["dynamotool", "download", "data"]).expect("valid");
        assert!(matches!(cli.command, Commands::Download { output: None, .. }));
    }
}
