use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::config::IngestConfig;
use crate::errors::{IngestionError, ResolutionError, Result};
use crate::identifier::{encode, project_id_to_uuid};
use crate::ingestor::{ImportHandle, Ingestor};
use crate::resolver::{FileResolver, ResolvedFile};
use crate::sink::Database;

#[derive(Serialize)]
pub struct OpenOutcome {
    pub project_uuid: String,
    pub table_name: String,
    pub resolved: ResolvedFile,
    /// Set when this request started a new import.
    #[serde(skip)]
    pub import: Option<ImportHandle>,
}

impl OpenOutcome {
    /// Where the caller should go to watch the table fill in.
    pub fn redirect_path(&self) -> String {
        format!("/{}/{}", self.project_uuid, self.table_name)
    }
}

/// Handles "open this project file" requests: one database per project under
/// `root_dir`, one table per file, imported at most once.
pub struct Opener<R> {
    config: IngestConfig,
    resolver: R,
    ingestors: Mutex<HashMap<String, Ingestor>>,
}

impl<R: FileResolver> Opener<R> {
    pub fn new(config: IngestConfig, resolver: R) -> Self {
        Self {
            config,
            resolver,
            ingestors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Opens (creating if needed) the database for `project_uuid`.
    pub fn ensure_database(&self, project_uuid: &str) -> Result<Ingestor> {
        let mut ingestors = self
            .ingestors
            .lock()
            .map_err(|_| IngestionError::Generic(anyhow::anyhow!("ingestor registry poisoned")))?;
        if let Some(ingestor) = ingestors.get(project_uuid) {
            return Ok(ingestor.clone());
        }

        std::fs::create_dir_all(&self.config.root_dir)?;
        let path = self.config.database_path(project_uuid);
        let db = Database::open(&path, self.config.processing.write_queue_capacity)?;
        let ingestor = Ingestor::new(db, &self.config.processing)?;
        info!(project_uuid, path = %path.display(), "Opened project database");
        ingestors.insert(project_uuid.to_string(), ingestor.clone());
        Ok(ingestor)
    }

    pub async fn open(
        &self,
        project_id: &str,
        filename: &str,
        credential: &str,
    ) -> Result<OpenOutcome> {
        let project_uuid = project_id_to_uuid(project_id)?;
        let ingestor = self.ensure_database(&project_uuid)?;
        let resolved = self.resolver.resolve(project_id, filename, credential).await?;

        if let Some(byte_length) = resolved.byte_length {
            if byte_length > self.config.size_limit_bytes() {
                return Err(ResolutionError::TooLarge {
                    limit_mb: self.config.resolver.csv_size_limit_mb,
                    byte_length,
                }
                .into());
            }
        }

        let table_name = encode(filename);
        let import = if ingestor.database().table_exists(&table_name).await? {
            info!(%project_uuid, table = %table_name, "Table already imported");
            None
        } else {
            Some(ingestor.import_url(&resolved.url, &table_name).await?)
        };

        Ok(OpenOutcome {
            project_uuid,
            table_name,
            resolved,
            import,
        })
    }
}
