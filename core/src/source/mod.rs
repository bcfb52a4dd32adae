pub mod delimited;
pub mod http;

use std::sync::Arc;

pub use delimited::{Record, RecordParser};
pub use http::{ChunkStream, FetchProgress, LineStream};

use crate::errors::Result;

/// Records read from a remote delimited file, one at a time.
///
/// Pairs the line stream (network side) with the record parser (CPU side);
/// nothing is buffered beyond the current chunk and the current record.
pub struct CsvSource {
    lines: LineStream,
    parser: RecordParser,
    finished: bool,
}

impl CsvSource {
    pub fn new(lines: LineStream) -> Self {
        Self::with_parser(lines, RecordParser::new())
    }

    pub fn with_parser(lines: LineStream, parser: RecordParser) -> Self {
        Self {
            lines,
            parser,
            finished: false,
        }
    }

    pub fn progress(&self) -> Arc<FetchProgress> {
        self.lines.progress()
    }

    pub fn header(&self) -> Option<&Arc<[String]>> {
        self.parser.header()
    }

    pub fn malformed_rows(&self) -> u64 {
        self.parser.malformed_rows()
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        while let Some(line) = self.lines.next_line().await? {
            if let Some(record) = self.parser.push_line(&line)? {
                return Ok(Some(record));
            }
        }
        self.finished = true;
        Ok(self.parser.finish()?)
    }
}
