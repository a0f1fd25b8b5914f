use super::*;
use crate::config::DelayPolicy;
use crate::fs::MemoryFileSystem;
use crate::http::WireRequest;
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// How one download run behaves
enum Run {
    /// 200 with the given body
    Deliver(&'static [u8]),
    /// Response head with this status, nothing downloaded
    Reject(u16),
    /// Fails before a response head is available
    Fail(fn() -> Error),
    /// Sends half the body, then fails with resume data
    Interrupt(&'static [u8]),
    /// Runs until cancelled
    Hang,
    /// Delivers once notified
    Held(Arc<Notify>, &'static [u8]),
}

#[derive(Default)]
struct FakeHandle {
    cancel: CancellationToken,
    pauses: AtomicU32,
    resumes: AtomicU32,
}

impl TransferHandle for FakeHandle {
    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
    fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct FakeDownloads {
    fs: Arc<MemoryFileSystem>,
    runs: StdMutex<VecDeque<Run>>,
    resume_seen: StdMutex<Vec<Option<Bytes>>>,
    handles: StdMutex<Vec<Arc<FakeHandle>>>,
}

impl FakeDownloads {
    fn scripted(fs: Arc<MemoryFileSystem>, runs: Vec<Run>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            runs: StdMutex::new(runs.into()),
            resume_seen: StdMutex::new(Vec::new()),
            handles: StdMutex::new(Vec::new()),
        })
    }

    fn starts(&self) -> usize {
        self.resume_seen.lock().unwrap().len()
    }

    fn last_handle(&self) -> Arc<FakeHandle> {
        self.handles.lock().unwrap().last().cloned().unwrap()
    }
}

fn attachment_head(status: u16) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"report.pdf\""),
    );
    HttpResponse::new(Some(status), headers, Bytes::new())
}

#[async_trait]
impl DownloadTransport for FakeDownloads {
    async fn start_download(
        &self,
        task_id: TaskId,
        _request: WireRequest,
        resume_data: Option<Bytes>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<(Arc<dyn TransferHandle>, HttpResponse)> {
        self.resume_seen.lock().unwrap().push(resume_data);
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Run::Deliver(b"default"));
        let handle = Arc::new(FakeHandle::default());
        self.handles.lock().unwrap().push(handle.clone());

        let (kind, body, gate) = match run {
            Run::Fail(error) => return Err(error()),
            Run::Reject(status) => {
                return Ok((
                    handle as Arc<dyn TransferHandle>,
                    HttpResponse::json(status, &serde_json::json!({})),
                ));
            }
            Run::Deliver(body) => (Kind::Deliver, Some(body), None),
            Run::Interrupt(body) => (Kind::Interrupt, Some(body), None),
            Run::Held(gate, body) => (Kind::Deliver, Some(body), Some(gate)),
            Run::Hang => (Kind::Deliver, None, None),
        };

        let fs = self.fs.clone();
        let cancel = handle.cancel.clone();
        let temp = PathBuf::from(format!("/tmp/{task_id}.part"));

        tokio::spawn(async move {
            let event = match (kind, body) {
                (_, None) => {
                    cancel.cancelled().await;
                    TransferEvent::Failed {
                        task_id,
                        error: Error::Cancelled,
                        resume_data: Some(Bytes::from_static(b"resume-hang")),
                    }
                }
                (Kind::Interrupt, Some(body)) => {
                    let half = &body[..body.len() / 2];
                    fs.write(&temp, Bytes::from_static(half)).await.unwrap();
                    let _ = events
                        .send(TransferEvent::Progress {
                            task_id: task_id.clone(),
                            transferred: half.len() as u64,
                            total: Some(body.len() as u64),
                        })
                        .await;
                    TransferEvent::Failed {
                        task_id,
                        error: Error::Transport("connection reset".into()),
                        resume_data: Some(Bytes::from(format!("resume-{}", half.len()))),
                    }
                }
                (Kind::Deliver, Some(body)) => {
                    if let Some(notify) = gate {
                        notify.notified().await;
                    }
                    fs.write(&temp, Bytes::from_static(body)).await.unwrap();
                    let _ = events
                        .send(TransferEvent::Progress {
                            task_id: task_id.clone(),
                            transferred: body.len() as u64,
                            total: Some(body.len() as u64),
                        })
                        .await;
                    TransferEvent::Completed {
                        task_id,
                        response: Some(attachment_head(200)),
                        location: Some(temp),
                    }
                }
            };
            let _ = events.send(event).await;
        });

        Ok((handle as Arc<dyn TransferHandle>, attachment_head(200)))
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Deliver,
    Interrupt,
}

struct NoRequests;

#[async_trait]
impl Transport for NoRequests {
    async fn send(&self, _request: WireRequest) -> Result<HttpResponse> {
        Err(Error::Transport("not used".into()))
    }
}

fn setup(runs: Vec<Run>) -> (DownloadManager, Arc<FakeDownloads>, Arc<MemoryFileSystem>) {
    let fs = Arc::new(MemoryFileSystem::new());
    let transport = FakeDownloads::scripted(fs.clone(), runs);
    let api = ApiManager::builder(Arc::new(NoRequests))
        .status_validation(true)
        .retry_config(RetryConfig::default().with_retries(2).with_delay(
            DelayPolicy::Constant {
                delay: Duration::from_millis(1),
            },
        ))
        .build();
    let config = TransferConfig {
        download_dir: PathBuf::from("/downloads"),
        temp_dir: PathBuf::from("/tmp"),
        terminal_grace_delay: Duration::from_millis(10),
        ..TransferConfig::default()
    };
    let manager = DownloadManager::new(api, transport.clone(), fs.clone(), config);
    (manager, transport, fs)
}

fn endpoint() -> Endpoint {
    Endpoint::get("https://files.example.com", "/reports/latest")
}

#[tokio::test]
async fn completed_download_replaces_existing_file() {
    let (manager, _transport, fs) = setup(vec![Run::Deliver(b"new contents")]);
    fs.write(Path::new("/downloads/report.pdf"), Bytes::from_static(b"old"))
        .await
        .unwrap();

    let (task, head) = manager.download_request(endpoint(), None, None).await.unwrap();
    assert_eq!(head.status, Some(200));
    let states: Vec<DownloadState> = manager.progress_stream(&task).collect().await;

    let last = states.last().unwrap();
    assert_eq!(last.status, TransferStatus::Completed);
    assert_eq!(last.location.as_deref(), Some(Path::new("/downloads/report.pdf")));
    assert_eq!(
        fs.read(Path::new("/downloads/report.pdf")).await.unwrap(),
        Bytes::from_static(b"new contents")
    );
    assert!(!fs.exists(Path::new(&format!("/tmp/{}.part", task.id()))).await);
    assert!(manager.active_tasks().await.is_empty());
}

#[tokio::test]
async fn rejected_status_fails_initiation_without_retry() {
    let (manager, transport, _fs) = setup(vec![Run::Reject(404)]);

    let error = manager
        .download_request(endpoint(), None, None)
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), Some(404));
    assert_eq!(transport.starts(), 1);
    assert!(transport.last_handle().cancel.is_cancelled());
    assert!(manager.active_tasks().await.is_empty());
}

#[tokio::test]
async fn initiation_is_retried_until_accepted() {
    let (manager, transport, _fs) = setup(vec![
        Run::Fail(|| Error::Timeout),
        Run::Reject(503),
        Run::Deliver(b"body"),
    ]);

    let (task, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let states: Vec<DownloadState> = manager.progress_stream(&task).collect().await;

    assert_eq!(states.last().unwrap().status, TransferStatus::Completed);
    assert_eq!(transport.starts(), 3);
}

#[tokio::test]
async fn interrupted_download_exposes_resume_data() {
    let (manager, transport, _fs) = setup(vec![Run::Interrupt(b"0123456789"), Run::Deliver(b"56789")]);

    let (task, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let states: Vec<DownloadState> = manager.progress_stream(&task).collect().await;
    let last = states.last().unwrap();
    assert_eq!(last.status, TransferStatus::Failed);
    assert_eq!(last.error.as_ref().unwrap().to_string(), "transport error: connection reset");
    let resume = last.resume_data.clone().unwrap();
    assert_eq!(resume, Bytes::from_static(b"resume-5"));

    let (task, _) = manager
        .download_request(endpoint(), Some(resume.clone()), None)
        .await
        .unwrap();
    let states: Vec<DownloadState> = manager.progress_stream(&task).collect().await;
    assert_eq!(states.last().unwrap().status, TransferStatus::Completed);
    assert_eq!(transport.resume_seen.lock().unwrap()[1], Some(resume));
}

#[tokio::test]
async fn pause_and_resume_reach_transport_once() {
    let (manager, transport, _fs) = setup(vec![Run::Hang]);

    let (task, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let handle = transport.last_handle();

    task.pause().await.unwrap();
    task.pause().await.unwrap();
    assert_eq!(task.state().status, TransferStatus::Suspended);
    task.resume().await.unwrap();
    task.resume().await.unwrap();
    assert_eq!(task.state().status, TransferStatus::Running);
    assert_eq!(handle.pauses.load(Ordering::SeqCst), 1);
    assert_eq!(handle.resumes.load(Ordering::SeqCst), 1);

    let stream = manager.progress_stream(&task);
    task.cancel().unwrap();
    let states: Vec<DownloadState> = stream.collect().await;
    let last = states.last().unwrap();
    assert_eq!(last.status, TransferStatus::Cancelled);
    assert_eq!(last.resume_data, Some(Bytes::from_static(b"resume-hang")));
}

#[tokio::test]
async fn invalidating_without_finishing_cancels_running_downloads() {
    let (manager, _transport, _fs) = setup(vec![Run::Hang, Run::Hang]);

    let (first, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let (second, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let first_stream = manager.progress_stream(&first);
    let second_stream = manager.progress_stream(&second);

    manager.invalidate_session(false).await;

    for stream in [first_stream, second_stream] {
        let states: Vec<DownloadState> = stream.collect().await;
        assert_eq!(states.last().unwrap().status, TransferStatus::Cancelled);
    }
    assert!(matches!(
        manager.download_request(endpoint(), None, None).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn invalidating_with_finishing_lets_downloads_complete() {
    let gate = Arc::new(Notify::new());
    let (manager, transport, _fs) = setup(vec![Run::Held(gate.clone(), b"late body")]);

    let (task, _) = manager.download_request(endpoint(), None, None).await.unwrap();
    let stream = manager.progress_stream(&task);

    manager.invalidate_session(true).await;
    assert!(matches!(
        manager.download_request(endpoint(), None, None).await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(transport.starts(), 1);

    gate.notify_one();
    let states: Vec<DownloadState> = stream.collect().await;
    assert_eq!(states.last().unwrap().status, TransferStatus::Completed);
}
