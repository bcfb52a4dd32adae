use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_GRAPHQL_URL: &str = "https://api.biglocalnews.org/graphql";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Directory holding one `<project-uuid>.db` file per project.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub graphql_url: String,
    pub csv_size_limit_mb: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            csv_size_limit_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub write_queue_capacity: usize,
    pub http_timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            write_queue_capacity: 64,
            http_timeout_secs: 30,
        }
    }
}

impl ProcessingConfig {
    /// Bound on connecting and on each read, for the file API and downloads.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            resolver: ResolverConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IngestConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("INGEST_CONFIG environment variable not set"))?;
        let config: IngestConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::ValidationFailed {
                reason: reason.to_string(),
            })
        };
        if self.root_dir.as_os_str().is_empty() {
            return invalid("root_dir cannot be empty");
        }
        if self.processing.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.processing.write_queue_capacity == 0 {
            return invalid("write_queue_capacity must be at least 1");
        }
        if self.processing.http_timeout_secs == 0 {
            return invalid("http_timeout_secs must be at least 1");
        }
        if self.resolver.csv_size_limit_mb == 0 {
            return invalid("csv_size_limit_mb must be at least 1");
        }
        let url = &self.resolver.graphql_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return invalid("graphql_url must be an http(s) URL");
        }
        Ok(())
    }

    pub fn size_limit_bytes(&self) -> u64 {
        self.resolver.csv_size_limit_mb * 1024 * 1024
    }

    pub fn database_path(&self, project_uuid: &str) -> PathBuf {
        self.root_dir.join(format!("{}.db", project_uuid))
    }
}
