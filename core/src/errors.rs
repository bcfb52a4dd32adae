use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not open file: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Raised while turning a (project, filename) pair into a downloadable URL.
/// These happen on the request path, before any ingestion starts.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("File not found: {name}")]
    NotFound { name: String },

    #[error("Resolver transport failure: {reason}")]
    Transport { reason: String },

    #[error("File exceeds size limit of {limit_mb}MB")]
    TooLarge { limit_mb: u64, byte_length: u64 },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Stream interrupted after {bytes_done} bytes: {reason}")]
    Body { bytes_done: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed CSV on line {line}: {reason}")]
    Csv { line: u64, reason: String },

    #[error("Line {line} is not valid UTF-8")]
    Encoding { line: u64 },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open database at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Write queue is closed")]
    WriterClosed,

    #[error("Table {table} does not exist")]
    MissingTable { table: String },

    #[error("Table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("Store task failed: {reason}")]
    Task { reason: String },
}

#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("Unterminated escape sequence at offset {offset} in {input:?}")]
    UnterminatedEscape { input: String, offset: usize },

    #[error("Invalid escape sequence {sequence:?}")]
    InvalidEscape { sequence: String },

    #[error("Unexpected character {found:?} at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },

    #[error("Invalid project id: {reason}")]
    InvalidProjectId { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        IngestionError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for IngestionError {
    fn from(err: serde_yaml::Error) -> Self {
        IngestionError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl From<rusqlite::Error> for IngestionError {
    fn from(err: rusqlite::Error) -> Self {
        IngestionError::Store(StoreError::Sqlite(err))
    }
}

impl IngestionError {
    /// Errors raised while handling the triggering request. Anything else
    /// happened inside a detached worker and is only visible as a ledger row
    /// that never completes.
    pub fn surfaces_to_caller(&self) -> bool {
        matches!(
            self,
            IngestionError::Config(_)
                | IngestionError::Resolution(_)
                | IngestionError::Identifier(_)
        )
    }

    /// Whether starting a fresh import could plausibly succeed. Nothing in
    /// the pipeline retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Fetch(_) => true,
            IngestionError::Resolution(ResolutionError::Transport { .. }) => true,
            IngestionError::Store(StoreError::WriterClosed) => true,
            IngestionError::Io(_) => true,
            _ => false,
        }
    }
}
