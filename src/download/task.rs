//! Download task handle and state snapshot

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transfer::{TaskCell, TransferState};
use crate::types::{TaskId, TransferStatus};

/// Observable state of one download
#[derive(Clone, Debug)]
pub struct DownloadState {
    /// Task the state belongs to
    pub task_id: TaskId,
    /// Transport-level status
    pub status: TransferStatus,
    /// Bytes on disk, including resumed data
    pub downloaded: u64,
    /// Expected size, when known
    pub total: Option<u64>,
    /// Why the download failed
    pub error: Option<Arc<Error>>,
    /// Opaque data for resuming a failed or cancelled download
    pub resume_data: Option<Bytes>,
    /// Final file location once completed
    pub location: Option<PathBuf>,
}

impl DownloadState {
    pub(crate) fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TransferStatus::Created,
            downloaded: 0,
            total: None,
            error: None,
            resume_data: None,
            location: None,
        }
    }
}

impl TransferState for DownloadState {
    fn status(&self) -> TransferStatus {
        self.status
    }

    fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
    }
}

/// Handle to a running download
#[derive(Clone)]
pub struct DownloadTask {
    pub(crate) cell: Arc<TaskCell<DownloadState>>,
}

impl DownloadTask {
    /// Task id (derived from the request id)
    pub fn id(&self) -> &TaskId {
        self.cell.id()
    }

    /// Current state
    pub fn state(&self) -> DownloadState {
        self.cell.snapshot()
    }

    /// Stop receiving; no-op when already suspended
    pub async fn pause(&self) -> Result<()> {
        self.cell.pause().await
    }

    /// Continue receiving; no-op when already running
    pub async fn resume(&self) -> Result<()> {
        self.cell.resume().await
    }

    /// Abort the download
    ///
    /// The final state carries resume data when the transport produced any.
    pub fn cancel(&self) -> Result<()> {
        self.cell.cancel()
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", self.id())
            .field("status", &self.cell.status())
            .finish()
    }
}
