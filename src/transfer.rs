//! Task bookkeeping shared by the upload and download managers
//!
//! A [`TaskCell`] owns one task's state, its subscribers and its current
//! transport handle behind a single lock. Every state change goes through
//! the cell, so subscribers always see snapshots in the order they were
//! produced, and a subscriber that joins late starts from the current
//! snapshot.
//!
//! Closing a cell delivers the terminal snapshot to every subscriber, waits
//! the grace delay, and only then drops the senders. A consumer therefore
//! always reads the terminal state before its stream ends.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::TransferHandle;
use crate::types::{TaskId, TransferStatus};

/// Snapshot type published by a [`TaskCell`]
pub(crate) trait TransferState: Clone + Send + 'static {
    fn status(&self) -> TransferStatus;
    fn set_status(&mut self, status: TransferStatus);
}

struct Inner<S> {
    state: S,
    subscribers: Vec<mpsc::Sender<S>>,
    handle: Option<Arc<dyn TransferHandle>>,
    cancel: CancellationToken,
    pause_requested: bool,
    closed: bool,
}

pub(crate) struct TaskCell<S> {
    id: TaskId,
    capacity: usize,
    inner: Mutex<Inner<S>>,
    // held while snapshots are handed to subscribers, keeps delivery in state order
    delivery: tokio::sync::Mutex<()>,
}

impl<S: TransferState> TaskCell<S> {
    pub(crate) fn new(id: TaskId, state: S, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                state,
                subscribers: Vec::new(),
                handle: None,
                cancel: CancellationToken::new(),
                pause_requested: false,
                closed: false,
            }),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> &TaskId {
        &self.id
    }

    // A poisoned lock only means a subscriber panicked mid-update; the
    // snapshot itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> S {
        self.lock().state.clone()
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.lock().state.status()
    }

    /// Token cancelled by [`cancel`](Self::cancel) for the current run
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    /// Stream of snapshots, starting with the current one
    ///
    /// Ends right after the current snapshot when the task already finished.
    pub(crate) fn subscribe(&self) -> ReceiverStream<S> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.lock();
        // fresh channel, capacity >= 1
        let _ = tx.try_send(inner.state.clone());
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        ReceiverStream::new(rx)
    }

    /// Apply `update` and offer the result to subscribers without waiting
    ///
    /// Subscribers with a full buffer skip this snapshot.
    pub(crate) fn publish_lossy(&self, update: impl FnOnce(&mut S)) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        update(&mut inner.state);
        let Ok(_delivery) = self.delivery.try_lock() else {
            return;
        };
        let state = inner.state.clone();
        inner.subscribers.retain(|tx| match tx.try_send(state.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Apply `update` and deliver the result to every subscriber
    ///
    /// Ignored once the task is closed, so a late status change can never
    /// replace the terminal state.
    pub(crate) async fn publish(&self, update: impl FnOnce(&mut S)) {
        let _delivery = self.delivery.lock().await;
        let (state, subscribers) = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            update(&mut inner.state);
            inner.subscribers.retain(|tx| !tx.is_closed());
            (inner.state.clone(), inner.subscribers.clone())
        };
        for tx in subscribers {
            let _ = tx.send(state.clone()).await;
        }
    }

    /// Deliver the terminal snapshot to every subscriber
    ///
    /// Streams stay open until the returned [`Closed`] is released.
    pub(crate) async fn close(&self, update: impl FnOnce(&mut S)) -> Closed<S> {
        let _delivery = self.delivery.lock().await;
        let (state, subscribers) = {
            let mut inner = self.lock();
            update(&mut inner.state);
            inner.closed = true;
            inner.handle = None;
            (inner.state.clone(), std::mem::take(&mut inner.subscribers))
        };
        for tx in &subscribers {
            let _ = tx.send(state.clone()).await;
        }
        Closed { subscribers }
    }

    /// Prepare a finished task for another run
    ///
    /// Fails unless the task ended in `Failed` or `Cancelled`.
    pub(crate) fn reopen(&self, update: impl FnOnce(&mut S)) -> Result<CancellationToken> {
        let mut inner = self.lock();
        match inner.state.status() {
            TransferStatus::Failed | TransferStatus::Cancelled => {}
            other => return Err(self.invalid("retry", other)),
        }
        update(&mut inner.state);
        inner.closed = false;
        inner.pause_requested = false;
        inner.cancel = CancellationToken::new();
        Ok(inner.cancel.clone())
    }

    /// Install the transport handle of a new run and mark the task running
    ///
    /// A pause requested while no handle was attached is applied to the new
    /// handle right away.
    pub(crate) async fn attach(&self, handle: Arc<dyn TransferHandle>, update: impl FnOnce(&mut S)) {
        let (paused, cancelled) = {
            let mut inner = self.lock();
            inner.handle = Some(handle.clone());
            (inner.pause_requested, inner.cancel.is_cancelled())
        };
        if cancelled {
            handle.cancel();
            return;
        }
        if paused {
            handle.pause();
        }
        self.publish(|state| {
            update(state);
            state.set_status(if paused {
                TransferStatus::Suspended
            } else {
                TransferStatus::Running
            });
        })
        .await;
    }

    pub(crate) fn detach(&self) {
        self.lock().handle = None;
    }

    fn invalid(&self, operation: &str, status: TransferStatus) -> Error {
        Error::InvalidState {
            id: self.id.clone(),
            operation: operation.to_string(),
            current_state: status.to_string(),
        }
    }

    /// Suspend the transfer; pausing a suspended task is a no-op
    pub(crate) async fn pause(&self) -> Result<()> {
        let handle = {
            let mut inner = self.lock();
            match inner.state.status() {
                TransferStatus::Suspended => return Ok(()),
                TransferStatus::Created | TransferStatus::Running => {}
                other => return Err(self.invalid("pause", other)),
            }
            inner.pause_requested = true;
            inner.handle.clone()
        };
        if let Some(handle) = handle {
            handle.pause();
        }
        tracing::info!(task_id = %self.id, "transfer paused");
        self.publish(|state| state.set_status(TransferStatus::Suspended))
            .await;
        Ok(())
    }

    /// Continue a suspended transfer; resuming a running task is a no-op
    pub(crate) async fn resume(&self) -> Result<()> {
        let handle = {
            let mut inner = self.lock();
            match inner.state.status() {
                TransferStatus::Suspended => {}
                TransferStatus::Created | TransferStatus::Running => return Ok(()),
                other => return Err(self.invalid("resume", other)),
            }
            inner.pause_requested = false;
            inner.handle.clone()
        };
        if let Some(handle) = handle {
            handle.resume();
        }
        tracing::info!(task_id = %self.id, "transfer resumed");
        self.publish(|state| state.set_status(TransferStatus::Running))
            .await;
        Ok(())
    }

    /// Abort the transfer
    ///
    /// The task's driver observes the cancellation and publishes the
    /// terminal `Cancelled` state. Cancelling a cancelled task is a no-op.
    pub(crate) fn cancel(&self) -> Result<()> {
        let handle = {
            let inner = self.lock();
            match inner.state.status() {
                TransferStatus::Cancelled => return Ok(()),
                TransferStatus::Completed | TransferStatus::Failed => {
                    return Err(self.invalid("cancel", inner.state.status()));
                }
                _ => {}
            }
            inner.cancel.cancel();
            inner.handle.clone()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        tracing::info!(task_id = %self.id, "transfer cancelled");
        Ok(())
    }
}

/// Subscribers of a finished task, kept open for the grace delay
pub(crate) struct Closed<S> {
    subscribers: Vec<mpsc::Sender<S>>,
}

impl<S> Closed<S> {
    /// Wait `grace`, then end every stream
    pub(crate) async fn release(self, grace: Duration) {
        if !self.subscribers.is_empty() {
            tokio::time::sleep(grace).await;
        }
    }
}
