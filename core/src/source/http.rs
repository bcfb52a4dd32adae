use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use crate::errors::FetchError;

pub type ChunkStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Byte counters for one download, shared with whoever wants to watch it.
#[derive(Debug)]
pub struct FetchProgress {
    bytes_done: AtomicU64,
    bytes_total: Option<u64>,
}

impl FetchProgress {
    fn new(bytes_total: Option<u64>) -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total,
        }
    }

    /// Bytes handed out as lines so far, terminators included.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Acquire)
    }

    /// Declared `Content-Length`, if the server sent one.
    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    fn advance(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::AcqRel);
    }
}

/// Forward-only sequence of raw lines read off a chunked body.
///
/// Lines are returned without their `\n` or `\r\n` terminator. A final line
/// with no terminator is still returned. Once the body ends or fails the
/// stream is fused and only yields `None`.
pub struct LineStream {
    chunks: ChunkStream,
    buffer: Vec<u8>,
    start: usize,
    progress: Arc<FetchProgress>,
    done: bool,
}

impl LineStream {
    pub fn new(chunks: ChunkStream, bytes_total: Option<u64>) -> Self {
        Self {
            chunks,
            buffer: Vec::new(),
            start: 0,
            progress: Arc::new(FetchProgress::new(bytes_total)),
            done: false,
        }
    }

    /// Starts a streamed GET. Connection failures and non-success statuses
    /// are reported here, before any line is read.
    pub async fn open(client: &reqwest::Client, url: &str) -> Result<Self, FetchError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes_total = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        info!(url, ?bytes_total, "Opened CSV stream");

        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| FetchError::Body {
                    bytes_done: 0,
                    reason: e.to_string(),
                })
            })
            .boxed();

        Ok(Self::new(chunks, bytes_total))
    }

    pub fn progress(&self) -> Arc<FetchProgress> {
        Arc::clone(&self.progress)
    }

    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        loop {
            if let Some(offset) = self.buffer[self.start..].iter().position(|b| *b == b'\n') {
                let end = self.start + offset;
                let mut line = self.buffer[self.start..end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.progress.advance((end + 1 - self.start) as u64);
                self.start = end + 1;
                return Ok(Some(line));
            }

            if self.done {
                if self.start < self.buffer.len() {
                    let line = self.buffer[self.start..].to_vec();
                    self.progress.advance(line.len() as u64);
                    self.start = self.buffer.len();
                    return Ok(Some(line));
                }
                return Ok(None);
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.drain(..self.start);
                    self.start = 0;
                    self.buffer.extend_from_slice(&chunk);
                }
                Some(Err(err)) => {
                    self.done = true;
                    self.buffer.clear();
                    self.start = 0;
                    let reason = match err {
                        FetchError::Body { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return Err(FetchError::Body {
                        bytes_done: self.progress.bytes_done(),
                        reason,
                    });
                }
                None => {
                    debug!(bytes_done = self.progress.bytes_done(), "CSV stream exhausted");
                    self.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunked(parts: &[&[u8]]) -> ChunkStream {
        let owned: Vec<Result<Bytes, FetchError>> = parts
            .iter()
            .map(|part| Ok(Bytes::copy_from_slice(part)))
            .collect();
        stream::iter(owned).boxed()
    }

    async fn collect_lines(lines: &mut LineStream) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let mut lines = LineStream::new(chunked(&[b"a,b\n1,", b"2\r\n3,4", b"\n5,6"]), Some(16));
        let progress = lines.progress();
        let collected = collect_lines(&mut lines).await;

        assert_eq!(
            collected,
            vec![b"a,b".to_vec(), b"1,2".to_vec(), b"3,4".to_vec(), b"5,6".to_vec()]
        );
        assert_eq!(progress.bytes_done(), 16);
        assert_eq!(progress.bytes_total(), Some(16));
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        let text = "name\ncafé\n".as_bytes();
        let split = text.len() - 2;
        let mut lines = LineStream::new(chunked(&[&text[..split], &text[split..]]), None);
        let collected = collect_lines(&mut lines).await;
        assert_eq!(collected[1], "café".as_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_bytes_done_grows_while_total_stays_unknown() {
        let mut lines = LineStream::new(chunked(&[b"a\n1\n2\n"]), None);
        let progress = lines.progress();

        let mut observed = Vec::new();
        while lines.next_line().await.unwrap().is_some() {
            observed.push(progress.bytes_done());
            assert_eq!(progress.bytes_total(), None);
        }
        assert_eq!(observed, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_terminal() {
        let parts: Vec<Result<Bytes, FetchError>> = vec![
            Ok(Bytes::from_static(b"a\n1\n")),
            Err(FetchError::Body {
                bytes_done: 0,
                reason: "connection reset".to_string(),
            }),
            Ok(Bytes::from_static(b"2\n")),
        ];
        let mut lines = LineStream::new(stream::iter(parts).boxed(), None);

        assert_eq!(lines.next_line().await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(lines.next_line().await.unwrap(), Some(b"1".to_vec()));
        let err = lines.next_line().await.unwrap_err();
        assert!(matches!(err, FetchError::Body { bytes_done: 4, .. }));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_reads_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/table.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b,c\n1,2,3"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let mut lines = LineStream::open(&client, &format!("{}/table.csv", server.uri()))
            .await
            .unwrap();
        let progress = lines.progress();
        assert_eq!(progress.bytes_total(), Some(11));

        let collected = collect_lines(&mut lines).await;
        assert_eq!(collected.len(), 2);
        assert_eq!(progress.bytes_done(), 11);
    }

    #[tokio::test]
    async fn test_open_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.csv"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = LineStream::open(&client, &format!("{}/missing.csv", server.uri())).await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_open_unreachable_host() {
        let client = reqwest::Client::new();
        let result = LineStream::open(&client, "http://127.0.0.1:9/table.csv").await;
        assert!(matches!(result, Err(FetchError::Request { .. })));
    }
}
