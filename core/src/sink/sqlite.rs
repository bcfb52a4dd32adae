use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::errors::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Handle to one project database.
///
/// All writes go through a bounded queue drained by a single thread that
/// owns the only read-write connection, so writes apply one at a time in
/// submission order. Reads open their own read-only connection and never
/// wait on the queue. The writer thread exits once every clone of the
/// handle has been dropped and the queue is empty.
#[derive(Clone)]
pub struct Database {
    path: Arc<PathBuf>,
    sender: mpsc::Sender<Job>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, queue_capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |reason: String| StoreError::Open {
            path: path.display().to_string(),
            reason,
        };

        let conn = Connection::open(&path).map_err(|e| open_error(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), %journal_mode, "Opened database");

        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        std::thread::Builder::new()
            .name("sqlite-writer".to_string())
            .spawn(move || run_writer(conn, receiver))
            .map_err(|e| open_error(e.to_string()))?;

        info!(path = %path.display(), queue_capacity, "Database writer started");
        Ok(Self {
            path: Arc::new(path),
            sender,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a write and returns without waiting for it to run. Waits only
    /// while the queue is full.
    pub async fn submit<T, F>(&self, op: F) -> Result<WriteTicket<T>, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // The submitter may have stopped listening.
            let _ = done.send(op(conn));
        });
        self.sender
            .send(job)
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        Ok(WriteTicket { receiver })
    }

    /// Queues a write and waits for its result.
    pub async fn execute_write<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(op).await?.wait().await
    }

    /// Runs `op` against a fresh read-only connection on the blocking pool.
    pub async fn read<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                path.as_ref(),
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| StoreError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Task {
            reason: e.to_string(),
        })?
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let table = table.to_string();
        self.read(move |conn| table_exists(conn, &table)).await
    }

    pub async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn run_writer(mut conn: Connection, mut receiver: mpsc::Receiver<Job>) {
    let mut applied: u64 = 0;
    while let Some(job) = receiver.blocking_recv() {
        job(&mut conn);
        applied += 1;
    }
    debug!(applied, "Write queue closed, writer exiting");
}

/// Completion handle for a queued write.
pub struct WriteTicket<T> {
    receiver: oneshot::Receiver<Result<T, StoreError>>,
}

impl<T> WriteTicket<T> {
    pub async fn wait(self) -> Result<T, StoreError> {
        self.receiver.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Takes the result if the write has already run.
    pub fn try_take(&mut self) -> Option<Result<T, StoreError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(StoreError::WriterClosed)),
        }
    }
}
