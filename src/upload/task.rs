//! Upload task handle and state snapshot

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::http::HttpResponse;
use crate::transfer::{TaskCell, TransferState};
use crate::types::{TaskId, TransferStatus};

/// Observable state of one upload
#[derive(Clone, Debug)]
pub struct UploadState {
    /// Task the state belongs to
    pub task_id: TaskId,
    /// Transport-level status
    pub status: TransferStatus,
    /// Bytes sent in the current run
    pub transferred: u64,
    /// Body size, when known
    pub total: Option<u64>,
    /// Transport runs started so far, across automatic and explicit retries
    pub attempts: u32,
    /// Last error, set when the task failed
    pub error: Option<Arc<Error>>,
    /// Server response, set when the task completed
    pub response: Option<HttpResponse>,
}

impl UploadState {
    pub(crate) fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TransferStatus::Created,
            transferred: 0,
            total: None,
            attempts: 0,
            error: None,
            response: None,
        }
    }

    /// Fraction of the body sent, when the size is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.transferred as f64 / total as f64),
            None => None,
        }
    }
}

impl TransferState for UploadState {
    fn status(&self) -> TransferStatus {
        self.status
    }

    fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
    }
}

/// Handle to a running upload
///
/// Cloning the handle does not clone the upload.
#[derive(Clone)]
pub struct UploadTask {
    pub(crate) cell: Arc<TaskCell<UploadState>>,
}

impl UploadTask {
    /// Task id (derived from the request id)
    pub fn id(&self) -> &TaskId {
        self.cell.id()
    }

    /// Current state
    pub fn state(&self) -> UploadState {
        self.cell.snapshot()
    }

    /// Suspend sending; no-op when already suspended
    pub async fn pause(&self) -> Result<()> {
        self.cell.pause().await
    }

    /// Continue sending; no-op when already running
    pub async fn resume(&self) -> Result<()> {
        self.cell.resume().await
    }

    /// Abort the upload
    ///
    /// The task ends in [`TransferStatus::Cancelled`]; only
    /// [`UploadManager::retry`](super::UploadManager::retry) can start it again.
    pub fn cancel(&self) -> Result<()> {
        self.cell.cancel()
    }
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("id", self.id())
            .field("status", &self.cell.status())
            .finish()
    }
}
