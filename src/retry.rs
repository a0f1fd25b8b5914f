//! Retry engine
//!
//! Failed calls are resubmitted through the whole pipeline (build, adapt,
//! transport, process). State is kept per [`RequestId`] so concurrent calls
//! never share counters, and the first error a call produced is the one that
//! surfaces when its retries run out.
//!
//! # Example
//!
//! ```no_run
//! use wirekit::config::RetryConfig;
//! use wirekit::error::Error;
//! use wirekit::retry::{RetryEngine, execute_with_retry};
//! use wirekit::types::{EndpointIdentifier, RequestId};
//!
//! # async fn example() -> Result<(), Error> {
//! let engine = RetryEngine::new();
//! let id = RequestId::generate(&EndpointIdentifier::new("GET", "/status", None));
//! let config = RetryConfig::default();
//!
//! let body = execute_with_retry(&engine, &id, &config, |_attempt| async {
//!     // Your operation here
//!     Ok::<_, Error>("ok".to_string())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use crate::types::RequestId;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, most unexpected status
/// codes) should return `true`. Failures that another attempt cannot fix
/// (bad URL, undecodable body, rejected refresh token) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Default classification used when a [`RetryConfig`] has no custom predicate
impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // 404 and 500 are terminal by default; any other status may recover
            Error::UnacceptableStatusCode { code, .. } => !matches!(code, 404 | 500),
            Error::NoStatusCode => true,
            // Transport-level failures
            Error::Network(_) | Error::Transport(_) | Error::Timeout | Error::Io(_) => true,
            // The next attempt goes through the refresh path
            Error::ExpiredAccessToken => true,
            Error::RefreshFailed(_) | Error::Storage(_) => true,
            // Building or decoding again gives the same result
            Error::InvalidUrlComponents(_) | Error::Decode(_) | Error::Encode(_) => false,
            // Caller has to authenticate again
            Error::MissingAuthorizationData | Error::ExpiredRefreshToken => false,
            Error::Cancelled => false,
            Error::TaskNotFound(_) | Error::InvalidState { .. } => false,
            Error::Replay(_) | Error::FileNotFound(_) | Error::Config { .. } => false,
            // Application errors are already final
            Error::Custom(_) => false,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug)]
pub enum RetryDecision {
    /// Run the call again after `delay`
    Retry {
        /// 1-based retry number
        attempt: u32,
        /// How long to wait first
        delay: Duration,
    },
    /// Stop and return this error to the caller
    Surface(Error),
}

#[derive(Debug, Default)]
struct RetryState {
    count: u32,
    first_error: Option<Error>,
}

/// Owner of all per-call retry state
///
/// Each decision is made under one lock, so calls with different ids never
/// observe each other's counters.
#[derive(Debug, Default)]
pub struct RetryEngine {
    states: Mutex<HashMap<RequestId, RetryState>>,
}

impl RetryEngine {
    /// Engine with no tracked calls
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RetryState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a failure of call `id` and decide whether to run it again
    ///
    /// The first error seen for `id` is kept and returned once the call
    /// stops being retried. Errors that require re-authentication
    /// ([`Error::ExpiredRefreshToken`], [`Error::MissingAuthorizationData`])
    /// surface as themselves, since the earlier error no longer describes
    /// what the caller has to do.
    pub fn decide(&self, id: &RequestId, error: Error, config: &RetryConfig) -> RetryDecision {
        let retryable = config.is_retryable(&error);
        let mut states = self.lock();
        let state = states.entry(id.clone()).or_default();

        if retryable && state.count < config.retries {
            state.count += 1;
            if state.first_error.is_none() {
                state.first_error = Some(error);
            }
            let attempt = state.count;
            return RetryDecision::Retry {
                attempt,
                delay: config.delay_for(attempt),
            };
        }

        let first = states.remove(id).and_then(|state| state.first_error);
        let surfaced = match (first, error) {
            (_, fatal @ (Error::ExpiredRefreshToken | Error::MissingAuthorizationData)) => fatal,
            (Some(first), _) => first,
            (None, latest) => latest,
        };
        RetryDecision::Surface(surfaced)
    }

    /// Forget call `id`, returning how many retries it used
    pub fn clear(&self, id: &RequestId) -> u32 {
        self.lock().remove(id).map(|state| state.count).unwrap_or(0)
    }

    /// Retries used so far by call `id`
    pub fn attempts(&self, id: &RequestId) -> u32 {
        self.lock().get(id).map(|state| state.count).unwrap_or(0)
    }

    /// Number of calls currently between a failure and their next attempt
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

/// Clears a call's retry state when its future is dropped mid-flight
struct TrackedCall<'a> {
    engine: &'a RetryEngine,
    id: &'a RequestId,
    finished: bool,
}

impl Drop for TrackedCall<'_> {
    fn drop(&mut self) {
        if !self.finished && self.engine.clear(self.id) > 0 {
            tracing::debug!(request_id = %self.id, "Request dropped between retries");
        }
    }
}

/// Run `operation` until it succeeds or the engine surfaces an error
///
/// `operation` receives the 0-based attempt number. Each attempt fully
/// completes before the next starts. Dropping the returned future discards
/// the call's retry state.
pub async fn execute_with_retry<F, Fut, T>(
    engine: &RetryEngine,
    id: &RequestId,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    let mut call = TrackedCall {
        engine,
        id,
        finished: false,
    };

    loop {
        match operation(attempt).await {
            Ok(result) => {
                call.finished = true;
                let retries = engine.clear(id);
                if retries > 0 {
                    tracing::info!(
                        request_id = %id,
                        attempts = retries + 1,
                        "Request succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let message = e.to_string();
                match engine.decide(id, e, config) {
                    RetryDecision::Retry {
                        attempt: retry,
                        delay,
                    } => {
                        tracing::warn!(
                            request_id = %id,
                            error = %message,
                            attempt = retry,
                            max_retries = config.retries,
                            delay_ms = delay.as_millis(),
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Surface(error) => {
                        call.finished = true;
                        tracing::error!(
                            request_id = %id,
                            error = %error,
                            latest_error = %message,
                            attempts = attempt + 1,
                            "Request failed, giving up"
                        );
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
