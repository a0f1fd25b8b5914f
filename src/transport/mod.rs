//! Transport collaborators
//!
//! The core only talks to the network through these traits:
//! - [`Transport`] - one request, one response
//! - [`UploadTransport`] / [`DownloadTransport`] - long-running transfers that
//!   report progress through a [`TransferEvent`] channel and are steered
//!   through a [`TransferHandle`]
//!
//! [`ReqwestTransport`] implements all three. [`ReplayTransport`] answers
//! from debug-capture files.

mod client;
mod replay;

pub use client::{ReqwestTransport, ResumeData};
pub use replay::ReplayTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::http::{HttpResponse, WireRequest};
use crate::types::{TaskId, TransferEvent};

/// Sends one request and returns its response
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request`
    ///
    /// Timeouts and connectivity problems are returned as errors; HTTP error
    /// statuses are returned as ordinary responses.
    async fn send(&self, request: WireRequest) -> Result<HttpResponse>;
}

/// Control surface of a running transfer
pub trait TransferHandle: Send + Sync {
    /// Stop moving bytes until [`resume`](Self::resume)
    fn pause(&self);

    /// Continue after [`pause`](Self::pause)
    fn resume(&self);

    /// Abort the transfer; the transport reports [`Error::Cancelled`](crate::error::Error::Cancelled)
    fn cancel(&self);
}

/// Body of an upload as handed to the transport
#[derive(Clone, Debug)]
pub enum UploadSource {
    /// In-memory bytes
    Bytes(Bytes),
    /// File streamed from disk
    File(PathBuf),
}

/// Starts uploads
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Begin sending `source` as the body of `request`
    ///
    /// Returns as soon as the transfer is running. Progress and the final
    /// outcome arrive on `events`.
    async fn start_upload(
        &self,
        task_id: TaskId,
        request: WireRequest,
        source: UploadSource,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<std::sync::Arc<dyn TransferHandle>>;
}

/// Starts downloads
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Begin downloading `request`, resuming from `resume_data` when given
    ///
    /// Returns once response headers are available. The returned response
    /// carries status and headers but no body; the body is written to a
    /// temporary file reported by [`TransferEvent::Completed`].
    async fn start_download(
        &self,
        task_id: TaskId,
        request: WireRequest,
        resume_data: Option<Bytes>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<(std::sync::Arc<dyn TransferHandle>, HttpResponse)>;
}
