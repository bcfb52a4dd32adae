use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "csv_ingest=info,ingest_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for a single import.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct IngestMetrics {
    pub rows_written: u64,
    pub bytes_processed: u64,
    pub batches_written: u64,
    pub progress_updates: u64,
    pub schema_transforms: u64,
    pub malformed_rows: u64,
}

impl IngestMetrics {
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_written == 0 {
            0.0
        } else {
            self.rows_written as f64 / self.batches_written as f64
        }
    }
}
