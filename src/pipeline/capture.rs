//! Debug capture of request/response pairs
//!
//! Every processed call is written as one JSON document to
//! `{directory}/{session}/{session}_{identifier}_{sequence}.json`. The same
//! documents feed [`ReplayTransport`](crate::transport::ReplayTransport).
//!
//! Writes happen on a spawned task; a failed write is logged and never
//! affects the pipeline.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::ResponseProcessor;
use crate::endpoint::EndpointRequest;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::http::{HttpResponse, WireRequest};
use crate::types::{EndpointIdentifier, SessionId};

/// Body as stored in a capture file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedBody {
    /// Base64 of the raw bytes
    pub raw: String,
    /// UTF-8 view, when the bytes are valid UTF-8
    pub text: Option<String>,
}

impl CapturedBody {
    /// Capture `bytes`; empty bodies are not recorded
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            raw: STANDARD.encode(bytes),
            text: std::str::from_utf8(bytes).ok().map(str::to_string),
        })
    }

    /// Original bytes
    pub fn bytes(&self) -> Result<Bytes> {
        STANDARD
            .decode(&self.raw)
            .map(Bytes::from)
            .map_err(|e| Error::Replay(format!("invalid base64 body: {e}")))
    }
}

/// One captured request/response pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Session the call belonged to
    pub session_id: SessionId,
    /// Endpoint identity, the replay lookup key
    pub identifier: EndpointIdentifier,
    /// 1-based index per identifier within the session
    pub sequence: u64,
    /// When the outcome was processed
    pub timestamp: DateTime<Utc>,
    /// HTTP method
    pub method: String,
    /// Full request URL
    pub url: String,
    /// URL path
    pub path: String,
    /// Query parameters sorted by key
    pub query: Vec<(String, String)>,
    /// Response status, absent for transport failures
    pub status_code: Option<u16>,
    /// Request headers (authorization redacted)
    pub request_headers: BTreeMap<String, String>,
    /// Request body
    pub request_body: Option<CapturedBody>,
    /// Response headers
    pub response_headers: BTreeMap<String, String>,
    /// Response body
    pub response_body: Option<CapturedBody>,
    /// Error message when the call failed
    pub error: Option<String>,
}

impl CaptureRecord {
    /// `{session}_{identifier}_{sequence}.json`
    pub fn file_name(&self) -> String {
        file_name(&self.session_id, &self.identifier, self.sequence)
    }

    /// Rebuild the response this record captured
    pub fn to_response(&self) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.response_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Replay(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Replay(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        let body = match &self.response_body {
            Some(body) => body.bytes()?,
            None => Bytes::new(),
        };
        Ok(HttpResponse::new(self.status_code, headers, body))
    }
}

pub(crate) fn file_name(session: &SessionId, identifier: &EndpointIdentifier, sequence: u64) -> String {
    format!("{session}_{identifier}_{sequence}.json")
}

/// Processor writing capture files
///
/// Sequence numbers start at 1 and count per endpoint identifier within a
/// session.
#[derive(Clone)]
pub struct DebugCapture {
    directory: PathBuf,
    fs: Arc<dyn FileSystem>,
    sequences: Arc<Mutex<HashMap<(SessionId, EndpointIdentifier), u64>>>,
}

impl DebugCapture {
    /// Capture into per-session folders under `directory`
    pub fn new(directory: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            directory: directory.into(),
            fs,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Folder holding the captures of `session`
    pub fn session_directory(&self, session: &SessionId) -> PathBuf {
        self.directory.join(&session.0)
    }

    fn next_sequence(&self, session: &SessionId, identifier: &EndpointIdentifier) -> u64 {
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let counter = sequences
            .entry((session.clone(), identifier.clone()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Build the record for one outcome and reserve its sequence number
    pub fn record(
        &self,
        request: &WireRequest,
        ctx: &EndpointRequest,
        response: Option<&HttpResponse>,
        error: Option<&Error>,
    ) -> CaptureRecord {
        let identifier = request.identifier();
        let sequence = self.next_sequence(&ctx.session, &identifier);

        let mut query = request.query_pairs();
        query.sort_by(|a, b| a.0.cmp(&b.0));

        CaptureRecord {
            session_id: ctx.session.clone(),
            identifier,
            sequence,
            timestamp: Utc::now(),
            method: request.method.to_string(),
            url: request.url.to_string(),
            path: request.url.path().to_string(),
            query,
            status_code: response.and_then(|r| r.status),
            request_headers: header_map(&request.headers),
            request_body: request.body.as_deref().and_then(CapturedBody::from_bytes),
            response_headers: response.map(|r| header_map(&r.headers)).unwrap_or_default(),
            response_body: response.and_then(|r| CapturedBody::from_bytes(&r.body)),
            error: error.map(|e| e.to_string()),
        }
    }

    /// Write `record` into its session folder
    pub async fn write(&self, record: &CaptureRecord) -> Result<PathBuf> {
        write_record(self.fs.as_ref(), &self.session_directory(&record.session_id), record).await
    }

    fn spawn_write(&self, record: CaptureRecord) {
        let fs = self.fs.clone();
        let directory = self.session_directory(&record.session_id);
        tokio::spawn(async move {
            if let Err(e) = write_record(fs.as_ref(), &directory, &record).await {
                tracing::warn!(
                    file = %record.file_name(),
                    error = %e,
                    "failed to write debug capture"
                );
            }
        });
    }
}

async fn write_record(
    fs: &dyn FileSystem,
    directory: &Path,
    record: &CaptureRecord,
) -> Result<PathBuf> {
    let json = serde_json::to_vec_pretty(record).map_err(Error::Encode)?;
    fs.create_directory(directory).await?;
    let path = directory.join(record.file_name());
    fs.write(&path, Bytes::from(json)).await?;
    Ok(path)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name == AUTHORIZATION {
                "<redacted>".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.to_string(), value)
        })
        .collect()
}

#[async_trait]
impl ResponseProcessor for DebugCapture {
    async fn process(
        &self,
        response: HttpResponse,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Result<HttpResponse> {
        let record = self.record(request, ctx, Some(&response), None);
        self.spawn_write(record);
        Ok(response)
    }

    async fn process_error(
        &self,
        error: Error,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Error {
        let response = match &error {
            Error::UnacceptableStatusCode { response, .. } => Some(response.as_ref()),
            _ => None,
        };
        let record = self.record(request, ctx, response, Some(&error));
        self.spawn_write(record);
        error
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RequestBuilder;
    use crate::endpoint::Endpoint;
    use crate::fs::MemoryFileSystem;
    use std::time::Duration;

    fn call() -> (WireRequest, EndpointRequest) {
        let endpoint = Endpoint::get("https://api.example.com", "/users")
            .with_query("page", 2)
            .with_query("active", true);
        let request = RequestBuilder::build(&endpoint)
            .unwrap()
            .with_header("Authorization", "Bearer secret")
            .unwrap();
        let ctx = EndpointRequest::new(endpoint, SessionId("s1".into())).unwrap();
        (request, ctx)
    }

    async fn wait_for_files(fs: &MemoryFileSystem, count: usize) -> Vec<PathBuf> {
        for _ in 0..100 {
            let files = fs.files();
            if files.len() >= count {
                return files;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fs.files()
    }

    #[tokio::test]
    async fn record_contains_sorted_query_and_redacted_auth() {
        let fs = Arc::new(MemoryFileSystem::new());
        let capture = DebugCapture::new("/captures", fs);
        let (request, ctx) = call();
        let response = HttpResponse::json(200, &serde_json::json!({"ok": true}));

        let record = capture.record(&request, &ctx, Some(&response), None);

        assert_eq!(record.sequence, 1);
        assert_eq!(record.path, "/users");
        assert_eq!(
            record.query,
            vec![
                ("active".to_string(), "true".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
        assert_eq!(record.request_headers["authorization"], "<redacted>");
        assert_eq!(record.status_code, Some(200));
        let body = record.response_body.as_ref().unwrap();
        assert_eq!(body.text.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(record.to_response().unwrap().body, response.body);
    }

    #[tokio::test]
    async fn sequence_counts_per_identifier() {
        let capture = DebugCapture::new("/captures", Arc::new(MemoryFileSystem::new()));
        let (request, ctx) = call();
        let other = RequestBuilder::build(&Endpoint::get("https://api.example.com", "/teams"))
            .unwrap();

        assert_eq!(capture.record(&request, &ctx, None, None).sequence, 1);
        assert_eq!(capture.record(&request, &ctx, None, None).sequence, 2);
        assert_eq!(capture.record(&other, &ctx, None, None).sequence, 1);
    }

    #[tokio::test]
    async fn processing_writes_file_and_leaves_response_untouched() {
        let fs = Arc::new(MemoryFileSystem::new());
        let capture = DebugCapture::new("/captures", fs.clone());
        let (request, ctx) = call();
        let response = HttpResponse::json(200, &serde_json::json!({"id": 7}));

        let processed = capture
            .process(response.clone(), &request, &ctx)
            .await
            .unwrap();
        assert_eq!(processed.body, response.body);

        let files = wait_for_files(&fs, 1).await;
        assert_eq!(
            files,
            vec![PathBuf::from(
                "/captures/s1/s1_GET_-users_active-true-page-2_1.json"
            )]
        );

        let stored: CaptureRecord =
            serde_json::from_slice(&fs.read(&files[0]).await.unwrap()).unwrap();
        assert_eq!(stored.status_code, Some(200));
        assert_eq!(stored.session_id, SessionId("s1".into()));
    }

    #[tokio::test]
    async fn unacceptable_status_is_captured_with_its_response() {
        let fs = Arc::new(MemoryFileSystem::new());
        let capture = DebugCapture::new("/captures", fs.clone());
        let (request, ctx) = call();
        let error = Error::UnacceptableStatusCode {
            code: 404,
            acceptable: 200..300,
            response: Box::new(HttpResponse::json(404, &serde_json::json!({}))),
        };

        let returned = capture.process_error(error, &request, &ctx).await;
        assert_eq!(returned.status_code(), Some(404));

        let files = wait_for_files(&fs, 1).await;
        let stored: CaptureRecord =
            serde_json::from_slice(&fs.read(&files[0]).await.unwrap()).unwrap();
        assert_eq!(stored.status_code, Some(404));
        assert!(stored.error.unwrap().contains("404"));
    }
}
