use std::time::Duration;

use anyhow::{Context, Result};
use ingest_core::config::{IngestConfig, load_config};
use ingest_core::identifier::encode;
use ingest_core::ingestor::{ImportHandle, Ingestor};
use ingest_core::open::Opener;
use ingest_core::progress::ProgressStore;
use ingest_core::resolver::GraphqlResolver;
use ingest_core::sink::Database;
use ingest_core::telemetry::init_tracing;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Runs one CSV import as a container job and reports progress until it ends.
///
/// Two ways in:
///     IMPORT_PROJECT_ID + IMPORT_FILENAME + IMPORT_CREDENTIAL resolve the
///     file through the file API and import it into the project database.
///     IMPORT_URL streams a CSV straight into IMPORT_DATABASE (default
///     `imports`), table named after IMPORT_TABLE or the URL's last segment.
///
/// Configuration comes from the YAML file at INGEST_CONFIG_PATH, else from
/// INGEST_CONFIG, else defaults.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = runner_config().await?;

    let (progress, handle) = match std::env::var("IMPORT_PROJECT_ID") {
        Ok(project_id) => start_from_project(config, &project_id).await?,
        Err(_) => start_from_url(config).await?,
    };
    let Some(handle) = handle else {
        info!("Table already imported, nothing to do");
        return Ok(());
    };

    info!(task_id = handle.task_id(), table = handle.table_name(), "Import started");
    report_progress(&progress, &handle).await;

    match handle.wait().await {
        Ok(summary) => {
            info!(
                rows = summary.rows_done,
                bytes = summary.bytes_done,
                types = ?summary.types,
                avg_batch_size = summary.metrics.avg_batch_size(),
                "Import finished"
            );
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Import failed");
            Err(e).context("Import failed")
        }
    }
}

async fn runner_config() -> Result<IngestConfig> {
    match std::env::var("INGEST_CONFIG_PATH") {
        Ok(path) => load_config(Some(&path)).await,
        Err(_) if std::env::var("INGEST_CONFIG").is_ok() => load_config(None).await,
        Err(_) => Ok(IngestConfig::default()),
    }
}

async fn start_from_project(
    config: IngestConfig,
    project_id: &str,
) -> Result<(ProgressStore, Option<ImportHandle>)> {
    let filename = std::env::var("IMPORT_FILENAME").context("IMPORT_FILENAME not set")?;
    let credential = std::env::var("IMPORT_CREDENTIAL").context("IMPORT_CREDENTIAL not set")?;

    let resolver = GraphqlResolver::from_config(&config)?;
    let opener = Opener::new(config, resolver);
    let outcome = opener.open(project_id, &filename, &credential).await?;
    info!(
        redirect = %outcome.redirect_path(),
        etag = ?outcome.resolved.etag,
        "Opened project file"
    );

    let ingestor = opener.ensure_database(&outcome.project_uuid)?;
    Ok((ingestor.progress().clone(), outcome.import))
}

async fn start_from_url(config: IngestConfig) -> Result<(ProgressStore, Option<ImportHandle>)> {
    let url = std::env::var("IMPORT_URL").context("Set IMPORT_URL or IMPORT_PROJECT_ID")?;
    let table = match std::env::var("IMPORT_TABLE") {
        Ok(table) => table,
        Err(_) => {
            let filename = url
                .split('?')
                .next()
                .and_then(|path| path.rsplit('/').next())
                .filter(|name| !name.is_empty())
                .context("Cannot derive a table name from IMPORT_URL, set IMPORT_TABLE")?;
            encode(filename)
        }
    };
    let database = std::env::var("IMPORT_DATABASE").unwrap_or_else(|_| "imports".to_string());

    std::fs::create_dir_all(&config.root_dir)?;
    let db = Database::open(
        config.database_path(&database),
        config.processing.write_queue_capacity,
    )?;
    let ingestor = Ingestor::new(db, &config.processing)?;
    if ingestor.database().table_exists(&table).await? {
        return Ok((ingestor.progress().clone(), None));
    }

    let handle = ingestor.import_url(&url, &table).await?;
    Ok((ingestor.progress().clone(), Some(handle)))
}

async fn report_progress(progress: &ProgressStore, handle: &ImportHandle) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.tick().await;
    while !handle.is_finished() {
        ticker.tick().await;
        match progress.latest_for_table(handle.table_name()).await {
            Ok(Some(row)) => match row.fraction() {
                Some(fraction) => info!(
                    rows = row.rows_done,
                    bytes = row.bytes_done,
                    percent = (fraction * 1000.0).round() / 10.0,
                    "Import progress"
                ),
                None => info!(
                    rows = row.rows_done,
                    bytes = row.bytes_done,
                    "Import progress, size unknown"
                ),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read import progress"),
        }
    }
}
