pub mod config;
pub mod errors;
pub mod identifier;
pub mod inference;
pub mod ingestor;
pub mod open;
pub mod progress;
pub mod resolver;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use config::{IngestConfig, load_config};
pub use errors::{IngestionError, Result};
pub use ingestor::{ImportHandle, ImportState, ImportSummary, Ingestor};
pub use open::{OpenOutcome, Opener};
pub use progress::{ProgressRecord, ProgressStore};
pub use resolver::{FileResolver, GraphqlResolver, ResolvedFile};
pub use sink::Database;
