use std::sync::Arc;

use tracing::warn;

use crate::errors::ParseError;

/// One parsed row, keyed by the header's column names.
///
/// Every record from one file shares the same header allocation. A record
/// never holds more values than there are columns; columns past the end of
/// `values` are absent and stored as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl Record {
    pub fn new(columns: Arc<[String]>, mut values: Vec<String>) -> Self {
        values.truncate(columns.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn header(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Turns raw lines into records.
///
/// The first non-blank logical line is the header. A logical line may span
/// several physical lines when a quoted field contains a line break; a
/// record is complete once its quote count is even.
///
/// Ragged rows are kept: extra fields are dropped and missing fields are
/// left absent. Both cases are logged and counted.
pub struct RecordParser {
    delimiter: u8,
    header: Option<Arc<[String]>>,
    pending: String,
    pending_quotes: usize,
    pending_start: u64,
    line_no: u64,
    malformed: u64,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    pub fn new() -> Self {
        Self::with_delimiter(b',')
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            delimiter,
            header: None,
            pending: String::new(),
            pending_quotes: 0,
            pending_start: 0,
            line_no: 0,
            malformed: 0,
        }
    }

    pub fn header(&self) -> Option<&Arc<[String]>> {
        self.header.as_ref()
    }

    /// Rows whose field count did not match the header.
    pub fn malformed_rows(&self) -> u64 {
        self.malformed
    }

    /// Feeds one physical line (without its terminator). Returns a record
    /// once a complete data row has been read.
    pub fn push_line(&mut self, raw: &[u8]) -> Result<Option<Record>, ParseError> {
        self.line_no += 1;
        let line = std::str::from_utf8(raw).map_err(|_| ParseError::Encoding {
            line: self.line_no,
        })?;

        if self.pending.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            self.pending_start = self.line_no;
        } else {
            self.pending.push('\n');
        }
        self.pending.push_str(line);
        self.pending_quotes += line.bytes().filter(|b| *b == b'"').count();

        if self.pending_quotes % 2 == 1 {
            return Ok(None);
        }
        self.complete_pending()
    }

    /// Flushes a trailing row left open by an unbalanced quote.
    pub fn finish(&mut self) -> Result<Option<Record>, ParseError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        warn!(
            line = self.pending_start,
            "Unterminated quoted field at end of input"
        );
        self.complete_pending()
    }

    fn complete_pending(&mut self) -> Result<Option<Record>, ParseError> {
        let text = std::mem::take(&mut self.pending);
        self.pending_quotes = 0;
        let fields = self.split_fields(&text)?;

        let header = match &self.header {
            Some(header) => Arc::clone(header),
            None => {
                self.header = Some(header_names(fields).into());
                return Ok(None);
            }
        };

        if fields.len() != header.len() {
            self.malformed += 1;
            warn!(
                line = self.pending_start,
                expected = header.len(),
                found = fields.len(),
                "Row field count does not match header"
            );
        }
        Ok(Some(Record::new(header, fields)))
    }

    fn split_fields(&self, text: &str) -> Result<Vec<String>, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .buffer_capacity(text.len().max(64))
            .from_reader(text.as_bytes());
        let mut record = csv::StringRecord::new();
        match reader.read_record(&mut record) {
            Ok(true) => Ok(record.iter().map(str::to_string).collect()),
            Ok(false) => Ok(Vec::new()),
            Err(e) => Err(ParseError::Csv {
                line: self.pending_start,
                reason: e.to_string(),
            }),
        }
    }
}

/// Column names as they will be stored: no byte order mark, no blank names
/// and no repeats.
fn header_names(fields: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(fields.len());
    for (index, field) in fields.into_iter().enumerate() {
        let field = if index == 0 {
            field
                .strip_prefix('\u{feff}')
                .map(str::to_string)
                .unwrap_or(field)
        } else {
            field
        };
        let base = if field.is_empty() {
            format!("column{}", index + 1)
        } else {
            field
        };
        let mut name = base.clone();
        let mut suffix = 2;
        while names.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        names.push(name);
    }
    names
}
