//! Transport answering from debug-capture files

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Transport;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::http::{HttpResponse, WireRequest};
use crate::pipeline::CaptureRecord;
use crate::pipeline::capture::file_name;
use crate::types::{EndpointIdentifier, SessionId};

/// Replays a recorded session
///
/// Requests are matched by endpoint identifier. The n-th request for an
/// identifier gets the capture with sequence n; once the recorded sequence
/// is exhausted the last capture is served again.
pub struct ReplayTransport {
    fs: Arc<dyn FileSystem>,
    session: SessionId,
    directory: PathBuf,
    cursors: Mutex<HashMap<EndpointIdentifier, u64>>,
}

impl ReplayTransport {
    /// Replay `session` from the capture root `directory`
    pub fn new(fs: Arc<dyn FileSystem>, directory: impl Into<PathBuf>, session: SessionId) -> Self {
        let directory = directory.into().join(&session.0);
        Self {
            fs,
            session,
            directory,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    async fn last_sequence(&self, identifier: &EndpointIdentifier) -> Result<Option<u64>> {
        let prefix = format!("{}_{}_", self.session, identifier);
        let entries = self.fs.list_directory(&self.directory).await?;
        Ok(entries
            .iter()
            .filter_map(|path| path.file_name()?.to_str())
            .filter_map(|name| name.strip_prefix(&prefix)?.strip_suffix(".json"))
            .filter_map(|sequence| sequence.parse::<u64>().ok())
            .max())
    }

    async fn load(&self, sequence: u64, identifier: &EndpointIdentifier) -> Result<CaptureRecord> {
        let path = self.directory.join(file_name(&self.session, identifier, sequence));
        let bytes = self.fs.read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Replay(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn send(&self, request: WireRequest) -> Result<HttpResponse> {
        let identifier = request.identifier();
        let wanted = {
            let mut cursors = self.cursors.lock().await;
            let cursor = cursors.entry(identifier.clone()).or_insert(0);
            *cursor += 1;
            *cursor
        };

        let record = match self.load(wanted, &identifier).await {
            Ok(record) => record,
            Err(Error::FileNotFound(_)) => {
                let last = self.last_sequence(&identifier).await?.ok_or_else(|| {
                    Error::Replay(format!("no capture recorded for {identifier}"))
                })?;
                tracing::debug!(
                    identifier = %identifier,
                    wanted,
                    served = last,
                    "capture sequence exhausted, serving last capture"
                );
                self.load(last, &identifier).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(message) = &record.error
            && record.status_code.is_none()
        {
            return Err(Error::Transport(message.clone()));
        }
        record.to_response()
    }
}

impl std::fmt::Debug for ReplayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayTransport")
            .field("session", &self.session)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}
