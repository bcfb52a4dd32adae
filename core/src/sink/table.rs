//! Table operations run on the writer connection.

use std::collections::BTreeMap;

use rusqlite::{Connection, params_from_iter};
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::inference::ColumnType;
use crate::sink::sqlite::table_exists;
use crate::source::Record;

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column names in declaration order. Empty if the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Creates `table` with every column typed TEXT, unless it already exists.
pub fn create_text_table(
    conn: &Connection,
    table: &str,
    columns: &[&str],
) -> Result<(), StoreError> {
    let definitions: Vec<String> = columns
        .iter()
        .map(|column| format!("{} TEXT", quote_identifier(column)))
        .collect();
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(table),
            definitions.join(", ")
        ),
        [],
    )?;
    info!(table, columns = columns.len(), "Created table");
    Ok(())
}

/// Inserts `records` in one transaction.
///
/// A missing table is created with every column typed TEXT. With `alter`
/// set, columns the table lacks are added; otherwise they are an error.
/// Absent values are stored as NULL.
pub fn insert_all(
    conn: &mut Connection,
    table: &str,
    records: &[Record],
    alter: bool,
) -> Result<usize, StoreError> {
    if records.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let existing = table_columns(&tx, table)?;
    let mut wanted: Vec<&str> = Vec::new();
    for record in records {
        for column in record.header() {
            if !wanted.contains(&column.as_str()) {
                wanted.push(column);
            }
        }
    }

    if existing.is_empty() {
        if !alter {
            return Err(StoreError::MissingTable {
                table: table.to_string(),
            });
        }
        create_text_table(&tx, table, &wanted)?;
    } else {
        for column in wanted
            .iter()
            .filter(|c| !existing.iter().any(|e| e.as_str() == **c))
        {
            if !alter {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            tx.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT",
                    quote_identifier(table),
                    quote_identifier(column)
                ),
                [],
            )?;
            debug!(table, %column, "Added column");
        }
    }

    for record in records {
        let header = record.header();
        let names: Vec<String> = header.iter().map(|c| quote_identifier(c)).collect();
        let placeholders: Vec<String> = (1..=header.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            names.join(", "),
            placeholders.join(", ")
        );
        let mut values: Vec<Option<&str>> = vec![None; header.len()];
        for (slot, (_, value)) in values.iter_mut().zip(record.iter()) {
            *slot = Some(value);
        }
        tx.prepare_cached(&sql)?.execute(params_from_iter(values.iter()))?;
    }

    tx.commit()?;
    Ok(records.len())
}

/// Rebuilds `table` with the declared column types, keeping every row and
/// its rowid. Columns missing from `types` stay TEXT. Empty strings in
/// numeric columns become NULL; other values that do not convert are kept
/// as text by SQLite's column affinity.
///
/// Returns false without touching the table if nothing would change.
pub fn transform_column_types(
    conn: &mut Connection,
    table: &str,
    types: &BTreeMap<String, ColumnType>,
) -> Result<bool, StoreError> {
    let tx = conn.transaction()?;
    if !table_exists(&tx, table)? {
        return Err(StoreError::MissingTable {
            table: table.to_string(),
        });
    }

    let columns = table_columns(&tx, table)?;
    let target = |column: &String| types.get(column).copied().unwrap_or(ColumnType::Text);
    if !columns.iter().any(|c| target(c).is_numeric()) {
        return Ok(false);
    }

    let staging = format!("{}_new_{}", table, uuid::Uuid::new_v4().simple());
    let definitions: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_identifier(c), target(c).sql_type()))
        .collect();
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let selects: Vec<String> = columns
        .iter()
        .map(|c| {
            if target(c).is_numeric() {
                format!("NULLIF({}, '')", quote_identifier(c))
            } else {
                quote_identifier(c)
            }
        })
        .collect();

    tx.execute(
        &format!(
            "CREATE TABLE {} ({})",
            quote_identifier(&staging),
            definitions.join(", ")
        ),
        [],
    )?;
    tx.execute(
        &format!(
            "INSERT INTO {} (rowid, {}) SELECT rowid, {} FROM {}",
            quote_identifier(&staging),
            names.join(", "),
            selects.join(", "),
            quote_identifier(table)
        ),
        [],
    )?;
    tx.execute(&format!("DROP TABLE {}", quote_identifier(table)), [])?;
    tx.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_identifier(&staging),
            quote_identifier(table)
        ),
        [],
    )?;
    tx.commit()?;

    info!(table, ?types, "Transformed column types");
    Ok(true)
}
