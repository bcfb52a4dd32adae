//! Turning a project file reference into a downloadable URL.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, COOKIE, ETAG, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::errors::ResolutionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub url: String,
    pub etag: Option<String>,
    pub byte_length: Option<u64>,
}

pub trait FileResolver: Send + Sync {
    fn resolve(
        &self,
        project_id: &str,
        filename: &str,
        credential: &str,
    ) -> impl Future<Output = Result<ResolvedFile, ResolutionError>> + Send;
}

const CREATE_FILE_DOWNLOAD_URI: &str = r#"
mutation CreateFileDownloadURI($input: FileURIInput!) {
    createFileDownloadUri(input: $input) {
        ok {
            name
            uri
        }
        err
    }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<MutationData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationData {
    create_file_download_uri: CreateFileDownloadUri,
}

#[derive(Debug, Deserialize)]
struct CreateFileDownloadUri {
    ok: Option<SignedUri>,
    err: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignedUri {
    uri: String,
}

/// Asks the file API to sign a download URL, then checks that the file is
/// really there. The API signs any filename it is given, so only the HEAD
/// request can tell a missing file apart.
#[derive(Debug, Clone)]
pub struct GraphqlResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphqlResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ResolutionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolutionError::Transport {
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self, ResolutionError> {
        Self::new(&config.resolver.graphql_url, config.processing.http_timeout())
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn sign(
        &self,
        project_id: &str,
        filename: &str,
        credential: &str,
    ) -> Result<String, ResolutionError> {
        let body = json!({
            "operationName": "CreateFileDownloadURI",
            "variables": {
                "input": {
                    "fileName": filename,
                    "projectId": project_id,
                }
            },
            "query": CREATE_FILE_DOWNLOAD_URI,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header(COOKIE, format!("remember_token={}", credential))
            .json(&body)
            .send()
            .await
            .map_err(|e| ResolutionError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ResolutionError::Transport {
            reason: e.to_string(),
        })?;
        if status != StatusCode::OK {
            warn!(%status, "File API rejected download request");
            return Err(ResolutionError::PermissionDenied { reason: text });
        }

        let parsed: GraphqlResponse =
            serde_json::from_str(&text).map_err(|e| ResolutionError::Transport {
                reason: format!("unexpected response from file API: {}", e),
            })?;
        if let Some(first) = parsed.errors.first() {
            return Err(ResolutionError::PermissionDenied {
                reason: first.message.clone(),
            });
        }
        let result = parsed
            .data
            .map(|data| data.create_file_download_uri)
            .ok_or_else(|| ResolutionError::Transport {
                reason: "file API response has no data".to_string(),
            })?;

        match (result.ok, result.err) {
            (_, Some(err)) if !err.is_empty() => {
                Err(ResolutionError::PermissionDenied { reason: err })
            }
            (Some(signed), _) => Ok(signed.uri),
            _ => Err(ResolutionError::PermissionDenied {
                reason: "file API returned no download URI".to_string(),
            }),
        }
    }
}

impl FileResolver for GraphqlResolver {
    async fn resolve(
        &self,
        project_id: &str,
        filename: &str,
        credential: &str,
    ) -> Result<ResolvedFile, ResolutionError> {
        let url = self.sign(project_id, filename, credential).await?;

        let head = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| ResolutionError::Transport {
                reason: e.to_string(),
            })?;
        if head.status() != StatusCode::OK {
            debug!(status = %head.status(), filename, "Signed URL does not resolve");
            return Err(ResolutionError::NotFound {
                name: filename.to_string(),
            });
        }

        let etag = head
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let byte_length = content_length(head.headers());
        debug!(filename, ?etag, ?byte_length, "Resolved file");

        Ok(ResolvedFile {
            url,
            etag,
            byte_length,
        })
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
