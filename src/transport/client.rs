//! reqwest-backed transport

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{DownloadTransport, TransferHandle, Transport, UploadSource, UploadTransport};
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::http::{HttpResponse, WireRequest};
use crate::types::{TaskId, TransferEvent};

/// Size of the chunks streamed into upload bodies
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Where an interrupted download left off
///
/// Serialized into the opaque resume bytes reported with a failed download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// URL the partial data belongs to
    pub url: String,
    /// Partial file on disk
    pub path: PathBuf,
    /// Bytes already written to `path`
    pub bytes_received: u64,
}

impl ResumeData {
    /// Opaque form handed to callers
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(Error::Encode)
    }

    /// Parse bytes produced by [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Decode)
    }
}

/// [`Transport`], [`UploadTransport`] and [`DownloadTransport`] over reqwest
///
/// Plain requests use a client with the configured whole-request timeout.
/// Transfers use a second client with only the connect timeout, so long
/// bodies are not cut off.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    transfer_client: reqwest::Client,
    temp_dir: PathBuf,
}

impl ReqwestTransport {
    /// Build clients from `config`; partial downloads go to `temp_dir`
    pub fn new(config: &HttpConfig, temp_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);
        let mut transfer_client = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(user_agent) = &config.user_agent {
            client = client.user_agent(user_agent.as_str());
            transfer_client = transfer_client.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: client.build()?,
            transfer_client: transfer_client.build()?,
            temp_dir: temp_dir.into(),
        })
    }

    fn prepare(client: &reqwest::Client, request: WireRequest) -> reqwest::RequestBuilder {
        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }

    fn partial_path(&self, task_id: &TaskId) -> PathBuf {
        self.temp_dir
            .join(format!("{}.part", crate::utils::sanitize_identifier(&task_id.0)))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Network(error)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: WireRequest) -> Result<HttpResponse> {
        let response = Self::prepare(&self.client, request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(HttpResponse::new(Some(status), headers, body))
    }
}

/// Pause gate plus cancellation for one transfer
#[derive(Debug)]
struct TransferControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl TransferControl {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused,
        }
    }

    /// Wait until the transfer is not paused; false when cancelled meanwhile
    async fn wait_unpaused(cancel: &CancellationToken, paused: &mut watch::Receiver<bool>) -> bool {
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                return !cancel.is_cancelled();
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return !cancel.is_cancelled();
                    }
                }
            }
        }
    }
}

impl TransferHandle for TransferControl {
    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl UploadTransport for ReqwestTransport {
    async fn start_upload(
        &self,
        task_id: TaskId,
        request: WireRequest,
        source: UploadSource,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<Arc<dyn TransferHandle>> {
        let control = Arc::new(TransferControl::new());
        let total = match &source {
            UploadSource::Bytes(bytes) => bytes.len() as u64,
            UploadSource::File(path) => tokio::fs::metadata(path).await?.len(),
        };

        let (body_tx, body_rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        tokio::spawn(produce_body(
            task_id.clone(),
            source,
            total,
            body_tx,
            events.clone(),
            control.cancel.clone(),
            control.paused.subscribe(),
        ));

        let builder = Self::prepare(&self.transfer_client, request)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)));
        let cancel = control.cancel.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = async {
                    let response = builder.send().await.map_err(map_reqwest_error)?;
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let body = response.bytes().await.map_err(map_reqwest_error)?;
                    Ok::<_, Error>(HttpResponse::new(Some(status), headers, body))
                } => result,
            };

            let event = match outcome {
                Ok(response) => TransferEvent::Completed {
                    task_id,
                    response: Some(response),
                    location: None,
                },
                Err(error) => TransferEvent::Failed {
                    task_id,
                    error,
                    resume_data: None,
                },
            };
            let _ = events.send(event).await;
        });

        Ok(control)
    }
}

/// Feed the upload body chunk by chunk, honouring pause and cancel
async fn produce_body(
    task_id: TaskId,
    source: UploadSource,
    total: u64,
    body: mpsc::Sender<std::io::Result<Bytes>>,
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
    mut paused: watch::Receiver<bool>,
) {
    let mut file = match &source {
        UploadSource::File(path) => match tokio::fs::File::open(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                let _ = body.send(Err(e)).await;
                return;
            }
        },
        UploadSource::Bytes(_) => None,
    };
    let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
    let mut sent: u64 = 0;

    loop {
        if !TransferControl::wait_unpaused(&cancel, &mut paused).await {
            return;
        }

        let chunk = match (&source, file.as_mut()) {
            (UploadSource::Bytes(bytes), _) => {
                let start = sent as usize;
                let end = (start + UPLOAD_CHUNK_SIZE).min(bytes.len());
                bytes.slice(start..end)
            }
            (UploadSource::File(_), Some(file)) => match file.read(&mut buffer).await {
                Ok(n) => Bytes::copy_from_slice(&buffer[..n]),
                Err(e) => {
                    let _ = body.send(Err(e)).await;
                    return;
                }
            },
            (UploadSource::File(_), None) => return,
        };

        if chunk.is_empty() {
            return;
        }
        sent += chunk.len() as u64;
        if body.send(Ok(chunk)).await.is_err() {
            return;
        }
        let _ = events
            .send(TransferEvent::Progress {
                task_id: task_id.clone(),
                transferred: sent,
                total: Some(total),
            })
            .await;
    }
}

#[async_trait]
impl DownloadTransport for ReqwestTransport {
    async fn start_download(
        &self,
        task_id: TaskId,
        request: WireRequest,
        resume_data: Option<Bytes>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<(Arc<dyn TransferHandle>, HttpResponse)> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let url = request.url.to_string();
        let mut resume = resume_data.as_deref().map(ResumeData::decode).transpose()?;
        if let Some(candidate) = &resume
            && (candidate.url != url || partial_len(&candidate.path).await < candidate.bytes_received)
        {
            tracing::debug!(
                task_id = %task_id,
                path = %candidate.path.display(),
                "resume data does not match partial file, starting over"
            );
            resume = None;
        }
        let (path, offset) = match &resume {
            Some(resume) => (resume.path.clone(), resume.bytes_received),
            None => (self.partial_path(&task_id), 0),
        };

        let mut builder = Self::prepare(&self.transfer_client, request);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if !response.status().is_success() {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            let control: Arc<dyn TransferHandle> = Arc::new(TransferControl::new());
            return Ok((control, HttpResponse::new(Some(status), headers, body)));
        }

        let head = HttpResponse::new(Some(status), headers, Bytes::new());
        let start = if offset > 0 && status == 206 { offset } else { 0 };
        let total = response.content_length().map(|len| len + start);
        let control = Arc::new(TransferControl::new());

        let job = DownloadJob {
            task_id,
            url,
            path,
            start,
            total,
            head: head.clone(),
            events,
            cancel: control.cancel.clone(),
            paused: control.paused.subscribe(),
        };
        tokio::spawn(job.run(Box::pin(response.bytes_stream())));

        Ok((control, head))
    }
}

async fn partial_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

struct DownloadJob {
    task_id: TaskId,
    url: String,
    path: PathBuf,
    start: u64,
    total: Option<u64>,
    head: HttpResponse,
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl DownloadJob {
    async fn run<S>(mut self, mut stream: S)
    where
        S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let mut received = self.start;
        let event = match self.stream_to_file(&mut stream, &mut received).await {
            Ok(()) => TransferEvent::Completed {
                task_id: self.task_id.clone(),
                response: Some(self.head.clone()),
                location: Some(self.path.clone()),
            },
            Err(error) => {
                let resume_data = ResumeData {
                    url: self.url.clone(),
                    path: self.path.clone(),
                    bytes_received: received,
                }
                .encode()
                .ok();
                TransferEvent::Failed {
                    task_id: self.task_id.clone(),
                    error,
                    resume_data,
                }
            }
        };
        let _ = self.events.send(event).await;
    }

    async fn stream_to_file<S>(&mut self, stream: &mut S, received: &mut u64) -> Result<()>
    where
        S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let mut file = if self.start > 0 {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await?;
            file.set_len(self.start).await?;
            file.seek(std::io::SeekFrom::End(0)).await?;
            file
        } else {
            tokio::fs::File::create(&self.path).await?
        };

        loop {
            if !TransferControl::wait_unpaused(&self.cancel, &mut self.paused).await {
                file.flush().await?;
                return Err(Error::Cancelled);
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(Error::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    *received += chunk.len() as u64;
                    let _ = self
                        .events
                        .send(TransferEvent::Progress {
                            task_id: self.task_id.clone(),
                            transferred: *received,
                            total: self.total,
                        })
                        .await;
                }
                Some(Err(e)) => {
                    file.flush().await?;
                    return Err(map_reqwest_error(e));
                }
                None => break,
            }
        }

        file.flush().await?;
        Ok(())
    }
}
