//! Import progress ledger.
//!
//! One row per import task in `_import_progress_`, inside the same database
//! as the imported table. Rows are never deleted. Updates only move counters
//! forward, so a late or repeated update cannot make progress go backwards,
//! and `completed` never changes once set.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::sink::{Database, WriteTicket};
use crate::sink::sqlite::table_exists;

pub const PROGRESS_TABLE: &str = "_import_progress_";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _import_progress_ (
    id TEXT PRIMARY KEY,
    "table" TEXT,
    bytes_todo INTEGER,
    bytes_done INTEGER,
    rows_done INTEGER,
    started TEXT,
    completed TEXT
)"#;

const SELECT_COLUMNS: &str =
    r#"id, "table", bytes_todo, bytes_done, rows_done, started, completed"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: String,
    pub table: String,
    /// Declared size of the file, if known.
    pub bytes_todo: Option<u64>,
    pub bytes_done: u64,
    pub rows_done: u64,
    pub started: String,
    pub completed: Option<String>,
}

impl ProgressRecord {
    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// Share of the file consumed, or `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_todo {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_done as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table: row.get(1)?,
            bytes_todo: row.get::<_, Option<i64>>(2)?.map(to_count),
            bytes_done: to_count(row.get(3)?),
            rows_done: to_count(row.get(4)?),
            started: row.get(5)?,
            completed: row.get(6)?,
        })
    }
}

/// Cumulative counters to record against a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub rows_done: u64,
    pub bytes_done: u64,
    pub bytes_todo: Option<u64>,
    pub completed: bool,
}

pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct ProgressStore {
    db: Database,
}

impl ProgressStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a fresh row for `task_id` and waits for it to be written.
    pub async fn create(&self, task_id: &str, table: &str) -> Result<ProgressRecord, StoreError> {
        let record = ProgressRecord {
            id: task_id.to_string(),
            table: table.to_string(),
            bytes_todo: None,
            bytes_done: 0,
            rows_done: 0,
            started: timestamp(),
            completed: None,
        };
        let row = record.clone();
        self.db
            .execute_write(move |conn| {
                conn.execute(CREATE_TABLE, [])?;
                conn.execute(
                    r#"INSERT INTO _import_progress_
                        (id, "table", bytes_todo, bytes_done, rows_done, started, completed)
                        VALUES (?1, ?2, NULL, 0, 0, ?3, NULL)"#,
                    params![row.id, row.table, row.started],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    /// Queues an update without waiting for it to be applied.
    pub async fn submit_update(
        &self,
        task_id: &str,
        update: ProgressUpdate,
    ) -> Result<WriteTicket<()>, StoreError> {
        let task_id = task_id.to_string();
        self.db
            .submit(move |conn| apply_update(conn, &task_id, update))
            .await
    }

    pub async fn update(&self, task_id: &str, update: ProgressUpdate) -> Result<(), StoreError> {
        self.submit_update(task_id, update).await?.wait().await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let task_id = task_id.to_string();
        self.db
            .read(move |conn| {
                if !table_exists(conn, PROGRESS_TABLE)? {
                    return Ok(None);
                }
                let sql = format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    SELECT_COLUMNS, PROGRESS_TABLE
                );
                Ok(conn
                    .query_row(&sql, [&task_id], ProgressRecord::from_row)
                    .optional()?)
            })
            .await
    }

    /// Most recently started task for `table`.
    pub async fn latest_for_table(
        &self,
        table: &str,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let table = table.to_string();
        self.db
            .read(move |conn| {
                if !table_exists(conn, PROGRESS_TABLE)? {
                    return Ok(None);
                }
                let sql = format!(
                    r#"SELECT {} FROM {} WHERE "table" = ?1
                    ORDER BY started DESC, rowid DESC LIMIT 1"#,
                    SELECT_COLUMNS, PROGRESS_TABLE
                );
                Ok(conn
                    .query_row(&sql, [&table], ProgressRecord::from_row)
                    .optional()?)
            })
            .await
    }
}

fn apply_update(
    conn: &mut Connection,
    task_id: &str,
    update: ProgressUpdate,
) -> Result<(), StoreError> {
    let completed = update.completed.then(timestamp);
    conn.execute(
        r#"UPDATE _import_progress_ SET
            rows_done = MAX(rows_done, ?2),
            bytes_done = MAX(bytes_done, ?3),
            bytes_todo = COALESCE(?4, bytes_todo),
            completed = COALESCE(completed, ?5)
        WHERE id = ?1"#,
        params![
            task_id,
            to_sql_int(update.rows_done),
            to_sql_int(update.bytes_done),
            update.bytes_todo.map(to_sql_int),
            completed,
        ],
    )?;
    Ok(())
}
