//! Network reachability monitoring
//!
//! A [`ReachabilityMonitor`] probes a host on a fixed interval and publishes
//! the latest [`Reachability`] through a watch channel. Consumers either
//! read the current value, await changes on a receiver, or turn it into a
//! stream.
//!
//! # Example
//!
//! ```no_run
//! use wirekit::config::ReachabilityConfig;
//! use wirekit::reachability::ReachabilityMonitor;
//! use tokio_stream::StreamExt;
//!
//! # async fn example() {
//! let monitor = ReachabilityMonitor::tcp(ReachabilityConfig::default());
//! monitor.start();
//!
//! let mut changes = monitor.stream();
//! while let Some(state) = changes.next().await {
//!     println!("network is {state:?}");
//! }
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::config::ReachabilityConfig;

/// Whether the network is usable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    /// No probe has finished yet
    Unknown,
    /// Last probe succeeded
    Reachable,
    /// Last probe failed
    Unreachable,
}

/// A single connectivity check
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Return whether the target could be reached
    async fn probe(&self) -> bool;
}

/// Probe opening a TCP connection to `host:port`
#[derive(Clone, Debug)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe for the configured host, port and timeout
    pub fn new(config: &ReachabilityConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        let address = (self.host.as_str(), self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::trace!(host = %self.host, port = self.port, error = %e, "probe failed");
                false
            }
            Err(_) => {
                tracing::trace!(host = %self.host, port = self.port, "probe timed out");
                false
            }
        }
    }
}

/// Publishes reachability changes
#[derive(Clone)]
pub struct ReachabilityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    state: Arc<watch::Sender<Reachability>>,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl ReachabilityMonitor {
    /// Monitor running `probe` every `interval`
    pub fn new(probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> Self {
        let (state, _) = watch::channel(Reachability::Unknown);
        Self {
            probe,
            interval,
            state: Arc::new(state),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Monitor using a [`TcpProbe`] built from `config`
    pub fn tcp(config: ReachabilityConfig) -> Self {
        Self::new(Arc::new(TcpProbe::new(&config)), config.interval)
    }

    /// Latest known state
    pub fn current(&self) -> Reachability {
        *self.state.borrow()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.state.subscribe()
    }

    /// Stream yielding the current state, then each change
    pub fn stream(&self) -> WatchStream<Reachability> {
        WatchStream::new(self.state.subscribe())
    }

    /// Whether the probe loop is running
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Start probing; no-op when already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let token = {
            let mut running = match self.running.lock() {
                Ok(running) => running,
                Err(poisoned) => poisoned.into_inner(),
            };
            if running.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        tracing::info!(interval = ?self.interval, "reachability monitor started");
        let probe = self.probe.clone();
        let state = self.state.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            loop {
                let reachable = tokio::select! {
                    _ = token.cancelled() => break,
                    reachable = probe.probe() => reachable,
                };
                let next = if reachable {
                    Reachability::Reachable
                } else {
                    Reachability::Unreachable
                };
                state.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    tracing::info!(from = ?*current, to = ?next, "reachability changed");
                    *current = next;
                    true
                });

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("reachability monitor stopped");
        });
    }

    /// Stop probing; the last state stays readable
    pub fn stop(&self) {
        let token = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for ReachabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityMonitor")
            .field("interval", &self.interval)
            .field("current", &self.current())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::StreamExt;

    /// Each probe waits for the test to hand it an answer
    struct Gated(tokio::sync::Mutex<mpsc::Receiver<bool>>);

    impl Gated {
        fn new() -> (Arc<Self>, mpsc::Sender<bool>) {
            let (tx, rx) = mpsc::channel(1);
            (Arc::new(Self(tokio::sync::Mutex::new(rx))), tx)
        }
    }

    #[async_trait]
    impl ReachabilityProbe for Gated {
        async fn probe(&self) -> bool {
            self.0.lock().await.recv().await.unwrap_or(false)
        }
    }

    #[tokio::test]
    async fn publishes_only_changes() {
        let (probe, answers) = Gated::new();
        let monitor = ReachabilityMonitor::new(probe, Duration::from_millis(1));
        let mut stream = monitor.stream();
        assert_eq!(stream.next().await, Some(Reachability::Unknown));

        monitor.start();
        answers.send(true).await.unwrap();
        assert_eq!(stream.next().await, Some(Reachability::Reachable));

        answers.send(true).await.unwrap();
        answers.send(false).await.unwrap();
        assert_eq!(stream.next().await, Some(Reachability::Unreachable));

        answers.send(true).await.unwrap();
        assert_eq!(stream.next().await, Some(Reachability::Reachable));

        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(monitor.current(), Reachability::Reachable);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (probe, answers) = Gated::new();
        let monitor = ReachabilityMonitor::new(probe, Duration::from_secs(60));
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        let mut stream = monitor.stream();
        assert_eq!(stream.next().await, Some(Reachability::Unknown));
        answers.send(false).await.unwrap();
        assert_eq!(stream.next().await, Some(Reachability::Unreachable));
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn tcp_probe_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ReachabilityConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(1),
            ..ReachabilityConfig::default()
        };

        assert!(TcpProbe::new(&config).probe().await);
        drop(listener);
    }
}
