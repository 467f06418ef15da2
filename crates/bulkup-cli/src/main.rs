use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bulkup_core::{validate_new_bulk_upload_task, BaseField, PayloadError};
use bulkup_ingest::{
    BaseFieldRegistry, BulkUploadStore, ColumnMapper, CsvSchemaValidator, IngestConfig,
    ProcessOutcome,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bulkup-cli")]
#[command(about = "Bulk upload ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pending bulk upload task to completion.
    Process { task_id: Uuid },
    /// Apply database migrations.
    Migrate,
    /// Validate a local CSV file against the base field registry.
    CheckCsv {
        path: PathBuf,
        /// Read base fields from a JSON file instead of the database.
        #[arg(long)]
        base_fields: Option<PathBuf>,
    },
    /// Create a pending task from a `{sourceId, fileId, funderShortCode}` payload.
    Enqueue {
        payload: String,
        #[arg(long)]
        created_by: Uuid,
    },
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("BULKUP_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Process { task_id } => {
            let outcome = bulkup_ingest::process_task_from_env(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let ProcessOutcome::Failed { details } = outcome {
                bail!("bulk upload task {task_id} failed: {}", details.message);
            }
        }
        Commands::Migrate => {
            bulkup_ingest::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::CheckCsv { path, base_fields } => {
            let base_fields = match base_fields {
                Some(file) => read_base_fields(&file)?,
                None => {
                    let config = IngestConfig::from_env();
                    bulkup_ingest::connect_store(&config)
                        .await?
                        .load_base_fields()
                        .await
                        .context("loading base fields")?
                }
            };
            check_csv(&path, base_fields)?;
        }
        Commands::Enqueue {
            payload,
            created_by,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("parsing task payload")?;
            let new = validate_new_bulk_upload_task(&payload).map_err(PayloadError::from)?;
            let config = IngestConfig::from_env();
            let task = bulkup_ingest::connect_store(&config)
                .await?
                .create_bulk_upload_task(&new, created_by)
                .await
                .context("creating bulk upload task")?;
            println!("enqueued: task_id={} status={}", task.id, task.status);
        }
    }

    Ok(())
}

fn read_base_fields(path: &Path) -> Result<Vec<BaseField>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn check_csv(path: &Path, base_fields: Vec<BaseField>) -> Result<()> {
    let registry = BaseFieldRegistry::new(base_fields);
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let shape = CsvSchemaValidator::new(&registry)
        .validate(file)
        .with_context(|| format!("validating {}", path.display()))?;
    let specs = ColumnMapper::new(&registry)
        .map(&shape.header)
        .context("mapping CSV columns")?;

    println!("csv ok: columns={} data_rows={}", specs.len(), shape.data_rows);
    for spec in specs {
        println!(
            "  {:>3} {} ({}, {})",
            spec.position,
            spec.base_field_short_code,
            spec.label,
            spec.data_type.as_str()
        );
    }
    Ok(())
}
