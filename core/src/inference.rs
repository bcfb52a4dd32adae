//! Column type inference over a stream of string values.
//!
//! Each column starts out compatible with every numeric type and loses a
//! candidate the first time a non-empty value fails that candidate's test.
//! Candidates never come back, so a column's guess can only move towards
//! text as more of the file is read. A column with no non-empty value is
//! text.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::source::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
        }
    }

    /// Declared SQLite column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, ColumnType::Text)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type TypeTest = fn(&str) -> bool;

/// Candidate types in precedence order. Text is the implicit fallback.
const TYPE_TESTS: [(ColumnType, TypeTest); 2] = [
    (ColumnType::Integer, is_integer),
    (ColumnType::Float, is_float),
];

fn is_integer(value: &str) -> bool {
    let digits = value
        .strip_prefix('-')
        .or_else(|| value.strip_prefix('+'))
        .unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) && value.parse::<i64>().is_ok()
}

fn is_float(value: &str) -> bool {
    // Rust's parser also takes "inf" and "NaN"; those are not numbers here.
    value.bytes().any(|b| b.is_ascii_digit())
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
        && value.parse::<f64>().is_ok()
}

/// Surviving candidates for a single column.
#[derive(Debug, Clone)]
pub struct ValueTracker {
    candidates: [bool; TYPE_TESTS.len()],
    seen: bool,
}

impl Default for ValueTracker {
    fn default() -> Self {
        Self {
            candidates: [true; TYPE_TESTS.len()],
            seen: false,
        }
    }
}

impl ValueTracker {
    pub fn observe(&mut self, value: &str) {
        if value.is_empty() || !self.candidates.iter().any(|alive| *alive) {
            return;
        }
        self.seen = true;
        for (alive, (_, test)) in self.candidates.iter_mut().zip(TYPE_TESTS.iter()) {
            if *alive && !test(value) {
                *alive = false;
            }
        }
    }

    pub fn guessed_type(&self) -> ColumnType {
        if !self.seen {
            return ColumnType::Text;
        }
        TYPE_TESTS
            .iter()
            .zip(self.candidates.iter())
            .find(|(_, alive)| **alive)
            .map(|((column_type, _), _)| *column_type)
            .unwrap_or(ColumnType::Text)
    }
}

/// Per-column trackers for a whole file.
#[derive(Debug, Default)]
pub struct TypeTracker {
    columns: HashMap<String, ValueTracker>,
}

impl TypeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, column: &str, value: &str) {
        match self.columns.get_mut(column) {
            Some(tracker) => tracker.observe(value),
            None => {
                let mut tracker = ValueTracker::default();
                tracker.observe(value);
                self.columns.insert(column.to_string(), tracker);
            }
        }
    }

    pub fn observe_record(&mut self, record: &Record) {
        for (column, value) in record.iter() {
            self.observe(column, value);
        }
    }

    /// Guessed type for every column seen so far.
    pub fn types(&self) -> BTreeMap<String, ColumnType> {
        self.columns
            .iter()
            .map(|(name, tracker)| (name.clone(), tracker.guessed_type()))
            .collect()
    }

    pub fn all_text(&self) -> bool {
        self.columns
            .values()
            .all(|tracker| tracker.guessed_type() == ColumnType::Text)
    }

    /// Passes records through unchanged while observing every field.
    pub fn wrap<I>(&mut self, records: I) -> RowTracker<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Record>,
    {
        RowTracker {
            inner: records.into_iter(),
            tracker: self,
        }
    }
}

pub struct RowTracker<'a, I> {
    inner: I,
    tracker: &'a mut TypeTracker,
}

impl<I> Iterator for RowTracker<'_, I>
where
    I: Iterator<Item = Record>,
{
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let record = self.inner.next()?;
        self.tracker.observe_record(&record);
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
