use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::errors::{ConfigError, FetchError, IngestionError, Result, StoreError};
use crate::inference::{ColumnType, TypeTracker};
use crate::progress::{ProgressStore, ProgressUpdate};
use crate::sink::{Database, WriteTicket, create_text_table, insert_all, transform_column_types};
use crate::source::{CsvSource, FetchProgress, LineStream, Record};
use crate::telemetry::IngestMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportState {
    Created,
    Streaming,
    FinalizingSchema,
    Complete,
    Failed,
}

impl ImportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportState::Complete | ImportState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportTask {
    pub task_id: String,
    pub table_name: String,
    pub started_at: String,
}

/// Outcome of a finished import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub task_id: String,
    pub table_name: String,
    pub rows_done: u64,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub types: BTreeMap<String, ColumnType>,
    pub schema_transformed: bool,
    pub metrics: IngestMetrics,
}

/// Handle to an import running in the background.
///
/// Dropping the handle does not stop the import.
pub struct ImportHandle {
    task: ImportTask,
    state: watch::Receiver<ImportState>,
    join: JoinHandle<Result<ImportSummary>>,
}

impl ImportHandle {
    pub fn task(&self) -> &ImportTask {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn table_name(&self) -> &str {
        &self.task.table_name
    }

    pub fn state(&self) -> ImportState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<ImportSummary> {
        self.join.await.map_err(|e| {
            IngestionError::Generic(anyhow::anyhow!("Import task aborted: {}", e))
        })?
    }
}

/// Launches imports into one project database.
///
/// Each import gets a ledger row before its handle is returned, then runs on
/// its own task: records are read off the stream, batched, and written
/// through the database's write queue along with a progress update per
/// batch. Once the stream is exhausted the columns are retyped if any of
/// them turned out numeric, and the ledger row is marked complete. A file
/// with a header but no rows still gets an empty all-TEXT table, so it is
/// not imported again. A failed import leaves its ledger row incomplete.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    progress: ProgressStore,
    client: reqwest::Client,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(db: Database, config: &ProcessingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.http_timeout())
            .read_timeout(config.http_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("HTTP client: {}", e),
            })?;
        Ok(Self::with_client(db, client, config.batch_size))
    }

    pub fn with_client(db: Database, client: reqwest::Client, batch_size: usize) -> Self {
        Self {
            progress: ProgressStore::new(db.clone()),
            db,
            client,
            batch_size: batch_size.max(1),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Streams the CSV file at `url` into `table`.
    pub async fn import_url(&self, url: &str, table: &str) -> Result<ImportHandle> {
        let client = self.client.clone();
        let url = url.to_string();
        self.launch(table, async move { LineStream::open(&client, &url).await })
            .await
    }

    /// Imports from an already opened line stream.
    pub async fn import_source(&self, lines: LineStream, table: &str) -> Result<ImportHandle> {
        self.launch(table, async move { Ok(lines) }).await
    }

    async fn launch<F>(&self, table: &str, opened: F) -> Result<ImportHandle>
    where
        F: Future<Output = std::result::Result<LineStream, FetchError>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let record = self.progress.create(&task_id, table).await?;
        let task = ImportTask {
            task_id,
            table_name: table.to_string(),
            started_at: record.started,
        };
        info!(task_id = %task.task_id, table, "Registered import");

        let (state_tx, state_rx) = watch::channel(ImportState::Created);
        let worker = ImportWorker {
            task: task.clone(),
            db: self.db.clone(),
            progress: self.progress.clone(),
            batch_size: self.batch_size,
            state: state_tx,
            rows_done: 0,
            pending: Vec::new(),
            metrics: IngestMetrics::default(),
        };
        let span = info_span!("import", task_id = %task.task_id, table = %task.table_name);
        let join = tokio::spawn(worker.run(opened).instrument(span));

        Ok(ImportHandle {
            task,
            state: state_rx,
            join,
        })
    }
}

struct ImportWorker {
    task: ImportTask,
    db: Database,
    progress: ProgressStore,
    batch_size: usize,
    state: watch::Sender<ImportState>,
    rows_done: u64,
    /// Queued writes whose outcome has not been seen yet.
    pending: Vec<WriteTicket<()>>,
    metrics: IngestMetrics,
}

impl ImportWorker {
    async fn run<F>(mut self, opened: F) -> Result<ImportSummary>
    where
        F: Future<Output = std::result::Result<LineStream, FetchError>>,
    {
        match self.stream(opened).await {
            Ok(summary) => {
                self.state.send_replace(ImportState::Complete);
                info!(
                    rows = summary.rows_done,
                    bytes = summary.bytes_done,
                    schema_transformed = summary.schema_transformed,
                    "Import complete"
                );
                Ok(summary)
            }
            Err(e) => {
                self.state.send_replace(ImportState::Failed);
                error!(
                    error = %e,
                    rows_done = self.rows_done,
                    retryable = e.is_retryable(),
                    "Import failed, progress row left incomplete"
                );
                Err(e)
            }
        }
    }

    async fn stream<F>(&mut self, opened: F) -> Result<ImportSummary>
    where
        F: Future<Output = std::result::Result<LineStream, FetchError>>,
    {
        let lines = opened.await?;
        self.state.send_replace(ImportState::Streaming);

        let mut source = CsvSource::new(lines);
        let fetch = source.progress();
        let mut tracker = TypeTracker::new();
        let mut batch: Vec<Record> = Vec::with_capacity(self.batch_size);

        while let Some(record) = source.next_record().await? {
            batch.push(record);
            if batch.len() >= self.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                self.flush(full, &mut tracker, &fetch).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(batch, &mut tracker, &fetch).await?;
        }
        for ticket in self.pending.drain(..) {
            ticket.wait().await?;
        }

        self.metrics.malformed_rows = source.malformed_rows();
        let bytes_done = fetch.bytes_done();
        let bytes_total = fetch.bytes_total();
        self.metrics.bytes_processed = bytes_done;
        match source.header() {
            None => info!("Stream had no header line, nothing to import"),
            Some(header) if self.rows_done == 0 => {
                let table = self.task.table_name.clone();
                let columns = header.clone();
                self.db
                    .execute_write(move |conn| {
                        let names: Vec<&str> = columns.iter().map(String::as_str).collect();
                        create_text_table(conn, &table, &names)
                    })
                    .await?;
                info!("Header without rows, created empty table");
            }
            Some(_) => {}
        }

        let types = tracker.types();
        let mut schema_transformed = false;
        if self.rows_done > 0 && !tracker.all_text() {
            self.state.send_replace(ImportState::FinalizingSchema);
            let table = self.task.table_name.clone();
            let target = types.clone();
            schema_transformed = self
                .db
                .execute_write(move |conn| transform_column_types(conn, &table, &target))
                .await?;
            if schema_transformed {
                self.metrics.schema_transforms += 1;
            }
        }

        self.progress
            .update(
                &self.task.task_id,
                ProgressUpdate {
                    rows_done: self.rows_done,
                    bytes_done,
                    bytes_todo: bytes_total,
                    completed: true,
                },
            )
            .await?;
        self.metrics.progress_updates += 1;

        Ok(ImportSummary {
            task_id: self.task.task_id.clone(),
            table_name: self.task.table_name.clone(),
            rows_done: self.rows_done,
            bytes_done,
            bytes_total,
            types,
            schema_transformed,
            metrics: self.metrics.clone(),
        })
    }

    /// Queues one batch insert and the matching progress update.
    async fn flush(
        &mut self,
        batch: Vec<Record>,
        tracker: &mut TypeTracker,
        fetch: &FetchProgress,
    ) -> Result<()> {
        let records: Vec<Record> = tracker.wrap(batch).collect();
        let count = records.len() as u64;
        let table = self.task.table_name.clone();
        let insert = self
            .db
            .submit(move |conn| insert_all(conn, &table, &records, true).map(|_| ()))
            .await?;
        self.pending.push(insert);
        self.rows_done += count;
        self.metrics.rows_written += count;
        self.metrics.batches_written += 1;

        let update = ProgressUpdate {
            rows_done: self.rows_done,
            bytes_done: fetch.bytes_done(),
            bytes_todo: fetch.bytes_total(),
            completed: false,
        };
        let ticket = self.progress.submit_update(&self.task.task_id, update).await?;
        self.pending.push(ticket);
        self.metrics.progress_updates += 1;
        debug!(rows_done = self.rows_done, bytes_done = update.bytes_done, "Batch queued");

        self.reap_completed()
    }

    /// Drops tickets for writes that already ran, failing on the first error.
    fn reap_completed(&mut self) -> Result<()> {
        let mut failure: Option<StoreError> = None;
        self.pending.retain_mut(|ticket| match ticket.try_take() {
            None => true,
            Some(Ok(())) => false,
            Some(Err(e)) => {
                failure.get_or_insert(e);
                false
            }
        });
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ParseError;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::stream;
    use rusqlite::types::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn setup(batch_size: usize) -> (TempDir, Ingestor) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("project.db"), 4).unwrap();
        (dir, Ingestor::with_client(db, reqwest::Client::new(), batch_size))
    }

    fn lines_for(body: &str, declared: bool) -> LineStream {
        let total = declared.then_some(body.len() as u64);
        let chunks = stream::iter(vec![Ok(Bytes::from(body.to_string()))]).boxed();
        LineStream::new(chunks, total)
    }

    async fn rows(ingestor: &Ingestor, sql: &'static str) -> Vec<Vec<Value>> {
        ingestor
            .database()
            .read(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let width = stmt.column_count();
                let rows = stmt
                    .query_map([], |row| {
                        (0..width)
                            .map(|i| row.get::<_, Value>(i))
                            .collect::<rusqlite::Result<Vec<Value>>>()
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_numeric_columns_are_retyped() {
        let (_dir, ingestor) = setup(100);
        let handle = ingestor
            .import_source(lines_for("a,b,c\n1,2,3", true), "t")
            .await
            .unwrap();
        let task_id = handle.task_id().to_string();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.rows_done, 1);
        assert!(summary.schema_transformed);
        assert_eq!(summary.types["a"], ColumnType::Integer);
        assert_eq!(
            rows(&ingestor, "SELECT rowid, a, b, c FROM t").await,
            vec![vec![
                Value::Integer(1),
                Value::Integer(1),
                Value::Integer(2),
                Value::Integer(3)
            ]]
        );

        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert!(ledger.is_complete());
        assert_eq!(ledger.rows_done, 1);
        assert_eq!(ledger.bytes_done, 11);
        assert_eq!(ledger.bytes_todo, Some(11));
    }

    #[tokio::test]
    async fn test_mixed_column_stays_text() {
        let (_dir, ingestor) = setup(100);
        let summary = ingestor
            .import_source(lines_for("a\n1\nx\n2", true), "t")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.types["a"], ColumnType::Text);
        assert!(!summary.schema_transformed);
        assert_eq!(summary.metrics.schema_transforms, 0);
        assert_eq!(
            rows(&ingestor, "SELECT type FROM pragma_table_info('t')").await,
            vec![vec![Value::Text("TEXT".into())]]
        );
    }

    #[tokio::test]
    async fn test_blank_column_stays_text() {
        let (_dir, ingestor) = setup(100);
        let summary = ingestor
            .import_source(lines_for("a,b\nx,\ny,", true), "t")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.types["b"], ColumnType::Text);
        assert!(!summary.schema_transformed);
        assert_eq!(
            rows(&ingestor, "SELECT type FROM pragma_table_info('t')").await,
            vec![vec![Value::Text("TEXT".into())], vec![Value::Text("TEXT".into())]]
        );
        assert_eq!(
            rows(&ingestor, "SELECT b FROM t ORDER BY rowid").await,
            vec![vec![Value::Text("".into())], vec![Value::Text("".into())]]
        );
    }

    #[tokio::test]
    async fn test_header_only_file_creates_empty_table() {
        let (_dir, ingestor) = setup(100);
        let handle = ingestor
            .import_source(lines_for("name,count\n", true), "t")
            .await
            .unwrap();
        let task_id = handle.task_id().to_string();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.rows_done, 0);
        assert!(!summary.schema_transformed);
        assert!(ingestor.database().table_exists("t").await.unwrap());
        assert_eq!(
            rows(&ingestor, "SELECT name, type FROM pragma_table_info('t')").await,
            vec![
                vec![Value::Text("name".into()), Value::Text("TEXT".into())],
                vec![Value::Text("count".into()), Value::Text("TEXT".into())],
            ]
        );
        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert!(ledger.is_complete());
    }

    #[tokio::test]
    async fn test_every_record_is_written_across_batches() {
        let (_dir, ingestor) = setup(10);
        let mut body = String::from("n,label\n");
        for n in 0..257 {
            body.push_str(&format!("{},row{}\n", n, n));
        }
        let summary = ingestor
            .import_source(lines_for(&body, true), "t")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.rows_done, 257);
        assert_eq!(summary.metrics.batches_written, 26);
        assert_eq!(summary.metrics.rows_written, 257);
        assert_eq!(
            rows(&ingestor, "SELECT COUNT(*), MIN(n), MAX(n) FROM t").await,
            vec![vec![Value::Integer(257), Value::Integer(0), Value::Integer(256)]]
        );
    }

    #[tokio::test]
    async fn test_unknown_total_stays_unknown() {
        let (_dir, ingestor) = setup(1);
        let handle = ingestor
            .import_source(lines_for("a\nx\ny\n", false), "t")
            .await
            .unwrap();
        let task_id = handle.task_id().to_string();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.bytes_total, None);
        assert_eq!(summary.bytes_done, 6);
        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert_eq!(ledger.bytes_todo, None);
        assert_eq!(ledger.bytes_done, 6);
        assert_eq!(ledger.fraction(), None);
    }

    #[tokio::test]
    async fn test_empty_body_completes_without_table() {
        let (_dir, ingestor) = setup(100);
        let handle = ingestor.import_source(lines_for("", true), "t").await.unwrap();
        let states = handle.subscribe();
        let task_id = handle.task_id().to_string();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.rows_done, 0);
        assert_eq!(*states.borrow(), ImportState::Complete);
        assert!(!ingestor.database().table_exists("t").await.unwrap());
        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert!(ledger.is_complete());
    }

    #[tokio::test]
    async fn test_stream_failure_leaves_ledger_incomplete() {
        let (_dir, ingestor) = setup(1);
        let parts: Vec<std::result::Result<Bytes, FetchError>> = vec![
            Ok(Bytes::from_static(b"a\n1\n2\n")),
            Err(FetchError::Body {
                bytes_done: 0,
                reason: "connection reset".to_string(),
            }),
        ];
        let lines = LineStream::new(stream::iter(parts).boxed(), Some(100));
        let handle = ingestor.import_source(lines, "t").await.unwrap();
        let states = handle.subscribe();
        let task_id = handle.task_id().to_string();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, IngestionError::Fetch(FetchError::Body { .. })));
        assert!(!err.surfaces_to_caller());
        assert_eq!(*states.borrow(), ImportState::Failed);

        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert!(!ledger.is_complete());
        assert!(ledger.rows_done <= 2);
    }

    /// Serves response headers and the start of a body, then goes quiet.
    async fn stalling_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\na,b\n1,2\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });
        format!("http://{}/stalled.csv", addr)
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("project.db"), 4).unwrap();
        let config = ProcessingConfig {
            http_timeout_secs: 1,
            ..Default::default()
        };
        let ingestor = Ingestor::new(db, &config).unwrap();
        let url = stalling_server().await;

        let handle = ingestor.import_url(&url, "t").await.unwrap();
        let task_id = handle.task_id().to_string();
        let err = tokio::time::timeout(Duration::from_secs(20), handle.wait())
            .await
            .expect("import should give up on a silent server")
            .unwrap_err();
        assert!(matches!(err, IngestionError::Fetch(FetchError::Body { .. })));
        assert!(err.is_retryable());

        let ledger = ingestor.progress().get(&task_id).await.unwrap().unwrap();
        assert!(!ledger.is_complete());
    }

    #[tokio::test]
    async fn test_invalid_utf8_fails_import() {
        let (_dir, ingestor) = setup(100);
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"a\n\xff\xfe\n"))]).boxed();
        let err = ingestor
            .import_source(LineStream::new(chunks, None), "t")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Parse(ParseError::Encoding { line: 2 })));
    }

    #[tokio::test]
    async fn test_handle_reports_task_before_completion() {
        let (_dir, ingestor) = setup(100);
        let handle = ingestor
            .import_source(lines_for("a\n1\n", true), "numbers")
            .await
            .unwrap();
        assert_eq!(handle.table_name(), "numbers");
        assert!(Uuid::parse_str(handle.task_id()).is_ok());

        let ledger = ingestor
            .progress()
            .latest_for_table("numbers")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.id, handle.task_id());
        handle.wait().await.unwrap();
    }
}
