//! Download task manager
//!
//! [`DownloadManager::download_request`] initiates a download through the
//! same adapters, processors and retry policy as an ordinary call. Retries
//! wrap initiation only; once the response head has been accepted the
//! transfer runs in the background and reports through its task.
//!
//! Finished files are moved from the transport's temporary location into
//! the download directory, replacing any file of the same name.

mod task;

pub use task::{DownloadState, DownloadTask};

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::api::ApiManager;
use crate::builder::RequestBuilder;
use crate::config::{RetryConfig, TransferConfig};
use crate::endpoint::{Endpoint, EndpointRequest};
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::http::HttpResponse;
use crate::retry::execute_with_retry;
use crate::transfer::TaskCell;
use crate::transport::{DownloadTransport, TransferHandle};
use crate::types::{TaskId, TransferEvent, TransferStatus};
use crate::utils::extract_filename;

/// Transport events buffered per download before the transport waits
const EVENT_BUFFER: usize = 32;

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Arc<TaskCell<DownloadState>>>,
    invalidated: bool,
}

struct Started {
    handle: Arc<dyn TransferHandle>,
    head: HttpResponse,
    url: Url,
    events: mpsc::Receiver<TransferEvent>,
}

/// Tracks downloads and moves finished files into place
#[derive(Clone)]
pub struct DownloadManager {
    api: ApiManager,
    transport: Arc<dyn DownloadTransport>,
    fs: Arc<dyn FileSystem>,
    config: TransferConfig,
    registry: Arc<Mutex<Registry>>,
}

impl DownloadManager {
    /// Manager downloading through `transport`, storing files through `fs`
    pub fn new(
        api: ApiManager,
        transport: Arc<dyn DownloadTransport>,
        fs: Arc<dyn FileSystem>,
        config: TransferConfig,
    ) -> Self {
        Self {
            api,
            transport,
            fs,
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Start downloading `endpoint`
    ///
    /// `resume_data` from a previous [`DownloadState`] continues a partial
    /// download. Returns the task and the (processed) response head once the
    /// server accepted the request.
    pub async fn download_request(
        &self,
        endpoint: Endpoint,
        resume_data: Option<Bytes>,
        retry: Option<RetryConfig>,
    ) -> Result<(DownloadTask, HttpResponse)> {
        let ctx = Arc::new(EndpointRequest::new(endpoint, self.api.session().clone())?);
        let task_id = TaskId::from(&ctx.id);
        if self.registry.lock().await.invalidated {
            return Err(invalidated(&task_id));
        }

        let config = retry.unwrap_or_else(|| self.api.default_retry_config().clone());
        let started = execute_with_retry(self.api.retry_engine(), &ctx.id, &config, |_attempt| {
            self.initiate(&ctx, &task_id, resume_data.clone())
        })
        .await
        .map_err(|e| self.api.pipeline().map_error(e, &ctx))?;

        let cell = Arc::new(TaskCell::new(
            task_id.clone(),
            DownloadState::new(task_id.clone()),
            self.config.state_channel_capacity,
        ));
        {
            let mut registry = self.registry.lock().await;
            if registry.invalidated {
                started.handle.cancel();
                return Err(invalidated(&task_id));
            }
            registry.tasks.insert(task_id.clone(), cell.clone());
        }
        cell.attach(started.handle, |_| {}).await;

        tracing::info!(
            task_id = %task_id,
            url = %started.url,
            status = ?started.head.status,
            resumed = resume_data.is_some(),
            "download started"
        );

        let head = started.head.clone();
        tokio::spawn(self.clone().drive(
            cell.clone(),
            ctx,
            started.head,
            started.url,
            started.events,
        ));
        Ok((DownloadTask { cell }, head))
    }

    /// Live view of one download, ending after its terminal state
    pub fn progress_stream(&self, task: &DownloadTask) -> ReceiverStream<DownloadState> {
        task.cell.subscribe()
    }

    /// Stop accepting downloads
    ///
    /// With `finish_tasks` running downloads complete normally; otherwise
    /// they are cancelled. Later calls to
    /// [`download_request`](Self::download_request) fail.
    pub async fn invalidate_session(&self, finish_tasks: bool) {
        let cells: Vec<_> = {
            let mut registry = self.registry.lock().await;
            registry.invalidated = true;
            registry.tasks.values().cloned().collect()
        };
        tracing::info!(
            active = cells.len(),
            finish_tasks,
            "download session invalidated"
        );
        if !finish_tasks {
            for cell in cells {
                if let Err(e) = cell.cancel() {
                    tracing::debug!(task_id = %cell.id(), error = %e, "download already finished");
                }
            }
        }
    }

    /// Snapshots of every running download, ordered by id
    pub async fn active_tasks(&self) -> Vec<DownloadState> {
        let registry = self.registry.lock().await;
        let mut states: Vec<DownloadState> =
            registry.tasks.values().map(|cell| cell.snapshot()).collect();
        states.sort_by(|a, b| a.task_id.0.cmp(&b.task_id.0));
        states
    }

    async fn initiate(
        &self,
        ctx: &EndpointRequest,
        task_id: &TaskId,
        resume_data: Option<Bytes>,
    ) -> Result<Started> {
        let pipeline = self.api.pipeline();
        let request = RequestBuilder::build(&ctx.endpoint)?;
        let request = pipeline.adapt(request, ctx).await?;
        let url = request.url.clone();

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (handle, head) = match self
            .transport
            .start_download(task_id.clone(), request.clone(), resume_data, events_tx)
            .await
        {
            Ok(started) => started,
            Err(error) => return Err(pipeline.fail(error, &request, ctx).await),
        };

        match pipeline.process(Ok(head), &request, ctx).await {
            Ok(head) => Ok(Started {
                handle,
                head,
                url,
                events,
            }),
            Err(error) => {
                handle.cancel();
                Err(error)
            }
        }
    }

    async fn drive(
        self,
        cell: Arc<TaskCell<DownloadState>>,
        ctx: Arc<EndpointRequest>,
        head: HttpResponse,
        url: Url,
        mut events: mpsc::Receiver<TransferEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress {
                    transferred, total, ..
                } => cell.publish_lossy(|state| {
                    state.downloaded = transferred;
                    state.total = total;
                }),
                TransferEvent::Completed { location, .. } => {
                    let outcome = match location {
                        Some(temp) => self.persist(&temp, &head, &url).await,
                        None => Err(Error::Transport(
                            "download completed without a file".to_string(),
                        )),
                    };
                    match outcome {
                        Ok(destination) => {
                            tracing::info!(
                                task_id = %cell.id(),
                                path = %destination.display(),
                                "download completed"
                            );
                            self.finish(&cell, |state| {
                                state.status = TransferStatus::Completed;
                                state.location = Some(destination);
                                state.error = None;
                            })
                            .await;
                        }
                        Err(error) => self.fail(&cell, &ctx, error, None).await,
                    }
                    return;
                }
                TransferEvent::Failed {
                    error, resume_data, ..
                } => {
                    self.fail(&cell, &ctx, error, resume_data).await;
                    return;
                }
            }
        }

        let error = Error::Transport("download transport stopped without reporting an outcome".to_string());
        self.fail(&cell, &ctx, error, None).await;
    }

    async fn persist(&self, temp: &Path, head: &HttpResponse, url: &Url) -> Result<PathBuf> {
        let destination = self
            .config
            .download_dir
            .join(extract_filename(&head.headers, url));
        self.fs.create_directory(&self.config.download_dir).await?;
        self.fs.move_item(temp, &destination).await?;
        Ok(destination)
    }

    async fn fail(
        &self,
        cell: &TaskCell<DownloadState>,
        ctx: &EndpointRequest,
        error: Error,
        resume_data: Option<Bytes>,
    ) {
        let status = if matches!(error, Error::Cancelled) {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Failed
        };
        let error = self.api.pipeline().map_error(error, ctx);
        tracing::info!(
            task_id = %cell.id(),
            status = %status,
            error = %error,
            resumable = resume_data.is_some(),
            "download ended"
        );
        self.finish(cell, |state| {
            state.status = status;
            state.error = Some(Arc::new(error));
            state.resume_data = resume_data;
        })
        .await;
    }

    async fn finish(&self, cell: &TaskCell<DownloadState>, update: impl FnOnce(&mut DownloadState)) {
        let closed = cell.close(update).await;
        self.registry.lock().await.tasks.remove(cell.id());
        closed.release(self.config.terminal_grace_delay).await;
    }
}

fn invalidated(task_id: &TaskId) -> Error {
    Error::InvalidState {
        id: task_id.clone(),
        operation: "download".to_string(),
        current_state: "session invalidated".to_string(),
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
