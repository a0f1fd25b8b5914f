//! Upload task manager
//!
//! [`UploadManager::upload`] registers a task and spawns its driver. The
//! driver owns the task: it starts a transport run, drains the run's
//! [`TransferEvent`] channel into the task's state, sends the final response
//! through the same processors as ordinary calls, and applies the retry
//! policy when a run fails.
//!
//! ```text
//! created → running ⇄ suspended → completed | failed | cancelled
//!                                       failed | cancelled → (retry) → created
//! ```
//!
//! Completed tasks leave the registry. Failed and cancelled tasks stay until
//! [`retry`](UploadManager::retry) or [`discard`](UploadManager::discard).

pub mod multipart;
mod task;

pub use multipart::{MultipartForm, Part, PartBody};
pub use task::{UploadState, UploadTask};

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::api::ApiManager;
use crate::builder::RequestBuilder;
use crate::config::{RetryConfig, TransferConfig};
use crate::endpoint::{Endpoint, EndpointRequest};
use crate::error::{Error, Result};
use crate::http::HttpResponse;
use crate::retry::RetryDecision;
use crate::transfer::TaskCell;
use crate::transport::{UploadSource, UploadTransport};
use crate::types::{TaskId, TransferEvent, TransferStatus};

/// Transport events buffered per run before the transport waits
const EVENT_BUFFER: usize = 32;

/// What to send
#[derive(Clone, Debug)]
pub enum UploadPayload {
    /// Raw bytes
    Bytes(Bytes),
    /// File streamed from disk
    File(PathBuf),
    /// multipart/form-data body
    Multipart(MultipartForm),
}

struct UploadJob {
    cell: Arc<TaskCell<UploadState>>,
    ctx: EndpointRequest,
    source: UploadSource,
    content_type: Option<String>,
    retry: RetryConfig,
    spool: Option<PathBuf>,
}

/// Tracks uploads from creation to a terminal state
#[derive(Clone)]
pub struct UploadManager {
    api: ApiManager,
    transport: Arc<dyn UploadTransport>,
    config: TransferConfig,
    tasks: Arc<Mutex<HashMap<TaskId, Arc<UploadJob>>>>,
}

impl UploadManager {
    /// Manager sending through `transport` with the stages of `api`
    pub fn new(api: ApiManager, transport: Arc<dyn UploadTransport>, config: TransferConfig) -> Self {
        Self {
            api,
            transport,
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start uploading `payload` to `endpoint`
    ///
    /// Returns once the task is registered; the transfer runs in the
    /// background. `retry` overrides the manager's default policy.
    /// Multipart forms above the configured threshold are spooled to a
    /// temporary file first.
    pub async fn upload(
        &self,
        payload: UploadPayload,
        endpoint: Endpoint,
        retry: Option<RetryConfig>,
    ) -> Result<UploadTask> {
        let ctx = EndpointRequest::new(endpoint, self.api.session().clone())?;
        let task_id = TaskId::from(&ctx.id);
        let (source, content_type, spool) = self.prepare(&task_id, payload).await?;

        let cell = Arc::new(TaskCell::new(
            task_id.clone(),
            UploadState::new(task_id.clone()),
            self.config.state_channel_capacity,
        ));
        let job = Arc::new(UploadJob {
            cell: cell.clone(),
            ctx,
            source,
            content_type,
            retry: retry.unwrap_or_else(|| self.api.default_retry_config().clone()),
            spool,
        });
        self.tasks.lock().await.insert(task_id.clone(), job.clone());

        tracing::info!(
            task_id = %task_id,
            endpoint = %job.ctx.identifier,
            "upload created"
        );

        let cancel = cell.cancel_token();
        tokio::spawn(self.clone().drive(job, cancel));
        Ok(UploadTask { cell })
    }

    /// Stream of state snapshots for a registered task
    ///
    /// The stream starts with the current state and ends after the task's
    /// terminal state has been delivered.
    pub async fn state_stream(&self, task_id: &TaskId) -> Result<ReceiverStream<UploadState>> {
        Ok(self.job(task_id).await?.cell.subscribe())
    }

    /// Run a failed or cancelled task again
    ///
    /// The task keeps its id, payload, endpoint and attempt count. Streams
    /// obtained after this call follow the new run.
    pub async fn retry(&self, task_id: &TaskId) -> Result<UploadTask> {
        let job = self.job(task_id).await?;
        let cancel = job.cell.reopen(|state| {
            state.status = TransferStatus::Created;
            state.transferred = 0;
            state.error = None;
        })?;

        tracing::info!(task_id = %task_id, "upload retry requested");
        tokio::spawn(self.clone().drive(job.clone(), cancel));
        Ok(UploadTask {
            cell: job.cell.clone(),
        })
    }

    /// Forget a failed or cancelled task
    pub async fn discard(&self, task_id: &TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let job = tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        match job.cell.status() {
            TransferStatus::Failed | TransferStatus::Cancelled => {}
            other => {
                return Err(Error::InvalidState {
                    id: task_id.clone(),
                    operation: "discard".to_string(),
                    current_state: other.to_string(),
                });
            }
        }
        if let Some(job) = tasks.remove(task_id) {
            drop(tasks);
            remove_spool(&job).await;
        }
        tracing::debug!(task_id = %task_id, "upload discarded");
        Ok(())
    }

    /// Snapshots of every registered task, ordered by id
    pub async fn active_tasks(&self) -> Vec<UploadState> {
        let tasks = self.tasks.lock().await;
        let mut states: Vec<UploadState> = tasks.values().map(|job| job.cell.snapshot()).collect();
        states.sort_by(|a, b| a.task_id.0.cmp(&b.task_id.0));
        states
    }

    async fn job(&self, task_id: &TaskId) -> Result<Arc<UploadJob>> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))
    }

    async fn prepare(
        &self,
        task_id: &TaskId,
        payload: UploadPayload,
    ) -> Result<(UploadSource, Option<String>, Option<PathBuf>)> {
        match payload {
            UploadPayload::Bytes(bytes) => Ok((UploadSource::Bytes(bytes), None, None)),
            UploadPayload::File(path) => Ok((UploadSource::File(path), None, None)),
            UploadPayload::Multipart(form) => {
                let content_type = Some(form.content_type());
                let length = form.content_length().await?;
                if length <= self.config.multipart_memory_threshold {
                    return Ok((UploadSource::Bytes(form.encode().await?), content_type, None));
                }

                tokio::fs::create_dir_all(&self.config.temp_dir).await?;
                let path = self
                    .config
                    .temp_dir
                    .join(format!("{}.multipart", crate::utils::sanitize_identifier(&task_id.0)));
                form.write_to_file(&path, self.config.multipart_buffer_size)
                    .await?;
                tracing::debug!(
                    task_id = %task_id,
                    bytes = length,
                    path = %path.display(),
                    "multipart body spooled to disk"
                );
                Ok((UploadSource::File(path.clone()), content_type, Some(path)))
            }
        }
    }

    async fn drive(self, job: Arc<UploadJob>, cancel: CancellationToken) {
        let engine = self.api.retry_engine().clone();
        let id = job.ctx.id.clone();

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                outcome = self.attempt(&job) => outcome,
            };
            job.cell.detach();

            let error = match outcome {
                Ok(response) => {
                    engine.clear(&id);
                    self.finish(&job, Ok(response)).await;
                    return;
                }
                Err(Error::Cancelled) => {
                    engine.clear(&id);
                    self.finish(&job, Err(Error::Cancelled)).await;
                    return;
                }
                Err(error) => error,
            };

            let message = error.to_string();
            match engine.decide(&id, error, &job.retry) {
                RetryDecision::Retry { attempt, delay } => {
                    tracing::warn!(
                        task_id = %job.cell.id(),
                        error = %message,
                        attempt,
                        max_retries = job.retry.retries,
                        delay_ms = delay.as_millis(),
                        "upload failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            engine.clear(&id);
                            self.finish(&job, Err(Error::Cancelled)).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Surface(error) => {
                    tracing::error!(
                        task_id = %job.cell.id(),
                        error = %error,
                        latest_error = %message,
                        "upload failed, giving up"
                    );
                    self.finish(&job, Err(error)).await;
                    return;
                }
            }
        }
    }

    /// One transport run, from request build to processed response
    async fn attempt(&self, job: &UploadJob) -> Result<HttpResponse> {
        let pipeline = self.api.pipeline();
        let request = RequestBuilder::build(&job.ctx.endpoint)?;
        let mut request = pipeline.adapt(request, &job.ctx).await?;
        if let Some(content_type) = &job.content_type {
            request = request.with_header("content-type", content_type)?;
        }

        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let handle = match self
            .transport
            .start_upload(
                job.cell.id().clone(),
                request.clone(),
                job.source.clone(),
                events_tx,
            )
            .await
        {
            Ok(handle) => handle,
            Err(error) => return Err(pipeline.fail(error, &request, &job.ctx).await),
        };
        job.cell
            .attach(handle, |state| {
                state.attempts += 1;
                state.transferred = 0;
                state.error = None;
            })
            .await;

        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress {
                    transferred, total, ..
                } => job.cell.publish_lossy(|state| {
                    state.transferred = transferred;
                    state.total = total;
                }),
                TransferEvent::Completed { response, .. } => {
                    let outcome = response.ok_or(Error::NoStatusCode);
                    return pipeline.process(outcome, &request, &job.ctx).await;
                }
                TransferEvent::Failed { error, .. } => {
                    return Err(pipeline.fail(error, &request, &job.ctx).await);
                }
            }
        }
        Err(Error::Transport(
            "upload transport stopped without reporting an outcome".to_string(),
        ))
    }

    async fn finish(&self, job: &UploadJob, outcome: Result<HttpResponse>) {
        let grace = self.config.terminal_grace_delay;
        let task_id = job.cell.id().clone();

        match outcome {
            Ok(response) => {
                tracing::info!(
                    task_id = %task_id,
                    status = ?response.status,
                    "upload completed"
                );
                let closed = job
                    .cell
                    .close(|state| {
                        state.status = TransferStatus::Completed;
                        state.response = Some(response);
                        state.error = None;
                    })
                    .await;
                self.tasks.lock().await.remove(&task_id);
                remove_spool(job).await;
                closed.release(grace).await;
            }
            Err(error) => {
                let status = if matches!(error, Error::Cancelled) {
                    TransferStatus::Cancelled
                } else {
                    TransferStatus::Failed
                };
                let error = self.api.pipeline().map_error(error, &job.ctx);
                tracing::info!(task_id = %task_id, status = %status, error = %error, "upload ended");
                job.cell
                    .close(|state| {
                        state.status = status;
                        state.error = Some(Arc::new(error));
                    })
                    .await
                    .release(grace)
                    .await;
            }
        }
    }
}

async fn remove_spool(job: &UploadJob) {
    if let Some(path) = &job.spool
        && let Err(e) = tokio::fs::remove_file(path).await
    {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove spooled multipart body"
        );
    }
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
