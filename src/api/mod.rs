//! Request execution core
//!
//! [`ApiManager`] runs one logical call end to end:
//!
//! 1. build the [`EndpointRequest`] context (one id for the call and all its retries)
//! 2. [`RequestBuilder`] → adapters → transport → processors
//! 3. on failure, ask the [`RetryEngine`] whether to run step 2 again
//! 4. run error mappers on the error that finally surfaces
//!
//! Managers are cheap to clone; clones share transport, stages and retry state.

mod builder;

pub use builder::ApiManagerBuilder;

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::builder::RequestBuilder;
use crate::config::{Config, RetryConfig};
use crate::endpoint::{Endpoint, EndpointRequest};
use crate::error::{Error, Result};
use crate::http::HttpResponse;
use crate::pipeline::Pipeline;
use crate::retry::{RetryEngine, execute_with_retry};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::SessionId;

/// Executes endpoints through the pipeline with retries
#[derive(Clone)]
pub struct ApiManager {
    transport: Arc<dyn Transport>,
    pipeline: Arc<Pipeline>,
    retry: Arc<RetryEngine>,
    retry_config: RetryConfig,
    session: SessionId,
}

impl ApiManager {
    /// Start configuring a manager around `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> ApiManagerBuilder {
        ApiManagerBuilder::new(transport)
    }

    /// Manager with a reqwest transport and the standard stages
    ///
    /// Logging and status validation are always installed. Debug capture is
    /// added in debug builds when `config.debug_capture.enabled` is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(ApiManagerBuilder::from_config(config)?.build())
    }

    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        pipeline: Pipeline,
        retry_config: RetryConfig,
        session: SessionId,
    ) -> Self {
        Self {
            transport,
            pipeline: Arc::new(pipeline),
            retry: Arc::new(RetryEngine::new()),
            retry_config,
            session,
        }
    }

    /// Session grouping this manager's debug captures
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Stages applied to every call
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Shared retry state
    pub fn retry_engine(&self) -> &Arc<RetryEngine> {
        &self.retry
    }

    /// Retry policy used when a call does not bring its own
    pub fn default_retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Execute `endpoint` with the default retry policy
    pub async fn request(&self, endpoint: Endpoint) -> Result<HttpResponse> {
        self.request_with(endpoint, None).await
    }

    /// Execute `endpoint`, overriding the retry policy when `retry` is given
    pub async fn request_with(
        &self,
        endpoint: Endpoint,
        retry: Option<RetryConfig>,
    ) -> Result<HttpResponse> {
        let ctx = EndpointRequest::new(endpoint, self.session.clone())?;
        let config = retry.unwrap_or_else(|| self.retry_config.clone());
        self.run(&ctx, &config)
            .await
            .map_err(|e| self.pipeline.map_error(e, &ctx))
    }

    /// Execute `endpoint` and decode the JSON body into `T`
    ///
    /// Decode failures surface as [`Error::Decode`] and are never retried.
    pub async fn request_decoded<T: DeserializeOwned>(&self, endpoint: Endpoint) -> Result<T> {
        self.request_decoded_with(endpoint, None).await
    }

    /// [`request_decoded`](Self::request_decoded) with a retry override
    pub async fn request_decoded_with<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        retry: Option<RetryConfig>,
    ) -> Result<T> {
        let ctx = EndpointRequest::new(endpoint, self.session.clone())?;
        let config = retry.unwrap_or_else(|| self.retry_config.clone());
        self.run(&ctx, &config)
            .await
            .and_then(|response| response.decode())
            .map_err(|e| self.pipeline.map_error(e, &ctx))
    }

    /// Execute `endpoint` until it finishes or `token` is cancelled
    ///
    /// Cancellation aborts the in-flight attempt (or the wait before the next
    /// one) and surfaces [`Error::Cancelled`] through the error mappers.
    pub async fn request_cancellable(
        &self,
        endpoint: Endpoint,
        token: CancellationToken,
    ) -> Result<HttpResponse> {
        self.request_cancellable_with(endpoint, token, None).await
    }

    /// [`request_cancellable`](Self::request_cancellable) with a retry override
    pub async fn request_cancellable_with(
        &self,
        endpoint: Endpoint,
        token: CancellationToken,
        retry: Option<RetryConfig>,
    ) -> Result<HttpResponse> {
        let ctx = EndpointRequest::new(endpoint, self.session.clone())?;
        let config = retry.unwrap_or_else(|| self.retry_config.clone());

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(request_id = %ctx.id, "request cancelled");
                Err(Error::Cancelled)
            }
            result = self.run(&ctx, &config) => result,
        };
        outcome.map_err(|e| self.pipeline.map_error(e, &ctx))
    }

    async fn run(&self, ctx: &EndpointRequest, config: &RetryConfig) -> Result<HttpResponse> {
        execute_with_retry(&self.retry, &ctx.id, config, |_attempt| self.execute_once(ctx)).await
    }

    /// One pass through build, adapters, transport and processors
    pub(crate) async fn execute_once(&self, ctx: &EndpointRequest) -> Result<HttpResponse> {
        let request = RequestBuilder::build(&ctx.endpoint)?;
        let request = self.pipeline.adapt(request, ctx).await?;
        let outcome = self.transport.send(request.clone()).await;
        self.pipeline.process(outcome, &request, ctx).await
    }
}

impl std::fmt::Debug for ApiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (adapters, processors) = self.pipeline.stage_counts();
        f.debug_struct("ApiManager")
            .field("session", &self.session)
            .field("adapters", &adapters)
            .field("processors", &processors)
            .field("retry_config", &self.retry_config)
            .finish_non_exhaustive()
    }
}

impl ApiManagerBuilder {
    /// Builder preloaded from `config`: reqwest transport, logging, status
    /// validation and (debug builds only) debug capture
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(
            &config.http,
            config.transfers.temp_dir.clone(),
        )?);

        let mut builder = ApiManagerBuilder::new(transport)
            .retry_config(config.retry.clone())
            .logging(true)
            .status_validation(true);

        if cfg!(debug_assertions) && config.debug_capture.enabled {
            builder = builder.debug_capture(crate::pipeline::DebugCapture::new(
                config.debug_capture.directory.clone(),
                Arc::new(crate::fs::TokioFileSystem),
            ));
        }
        Ok(builder)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelayPolicy;
    use crate::http::WireRequest;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport answering from a queue, repeating the last answer
    struct Scripted {
        answers: Mutex<VecDeque<Result<HttpResponse>>>,
        last: Mutex<Option<HttpResponse>>,
        requests: Mutex<Vec<WireRequest>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                last: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: WireRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            match self.answers.lock().unwrap().pop_front() {
                Some(Ok(response)) => {
                    *self.last.lock().unwrap() = Some(response.clone());
                    Ok(response)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::Transport("script exhausted".into())),
            }
        }
    }

    fn fast_retries(n: u32) -> RetryConfig {
        RetryConfig::default()
            .with_retries(n)
            .with_delay(DelayPolicy::Constant {
                delay: Duration::from_millis(1),
            })
    }

    fn manager(transport: Arc<Scripted>) -> ApiManager {
        ApiManager::builder(transport)
            .status_validation(true)
            .retry_config(fast_retries(3))
            .build()
    }

    #[derive(Debug, Deserialize)]
    struct Item {
        id: u32,
    }

    #[tokio::test]
    async fn decodes_successful_response() {
        let transport = Scripted::new(vec![Ok(HttpResponse::json(
            200,
            &serde_json::json!({ "id": 7 }),
        ))]);
        let item: Item = manager(transport.clone())
            .request_decoded(Endpoint::get("https://api.example.com", "/items/7"))
            .await
            .unwrap();
        assert_eq!(item.id, 7);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_through_whole_pipeline() {
        let transport = Scripted::new(vec![
            Err(Error::Timeout),
            Ok(HttpResponse::json(503, &serde_json::json!({}))),
            Ok(HttpResponse::json(200, &serde_json::json!({ "id": 1 }))),
        ]);
        let response = manager(transport.clone())
            .request(Endpoint::get("https://api.example.com", "/items"))
            .await
            .unwrap();

        assert_eq!(response.status, Some(200));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_first_error() {
        let transport = Scripted::new(vec![
            Ok(HttpResponse::json(503, &serde_json::json!({}))),
            Err(Error::Timeout),
        ]);
        let error = manager(transport.clone())
            .request_with(
                Endpoint::get("https://api.example.com", "/items"),
                Some(fast_retries(2)),
            )
            .await
            .unwrap_err();

        assert_eq!(error.status_code(), Some(503));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn decode_failure_is_not_retried() {
        let transport = Scripted::new(vec![Ok(HttpResponse::json(
            200,
            &serde_json::json!({ "unexpected": true }),
        ))]);
        let result: Result<Item> = manager(transport.clone())
            .request_decoded(Endpoint::get("https://api.example.com", "/items/7"))
            .await;

        assert!(matches!(result, Err(Error::Decode(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_transport() {
        let transport = Scripted::new(vec![]);
        let result = manager(transport.clone())
            .request(Endpoint::get("no scheme", "/items"))
            .await;

        assert!(matches!(result, Err(Error::InvalidUrlComponents(_))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn error_mappers_see_final_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("item is gone")]
        struct Gone;

        let transport = Scripted::new(vec![Ok(HttpResponse::json(404, &serde_json::json!({})))]);
        let manager = ApiManager::builder(transport.clone())
            .status_validation(true)
            .retry_config(fast_retries(3))
            .error_mapper(Arc::new(|error: Error, _ctx: &EndpointRequest| {
                match error.status_code() {
                    Some(404) => Error::custom(Gone),
                    _ => error,
                }
            }))
            .build();

        let error = manager
            .request(Endpoint::get("https://api.example.com", "/items/9"))
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "item is gone");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_surfaces_cancelled_and_clears_state() {
        let transport = Scripted::new(vec![Err(Error::Timeout)]);
        let manager = ApiManager::builder(transport)
            .retry_config(RetryConfig::default().with_retries(5).with_delay(
                DelayPolicy::Constant {
                    delay: Duration::from_secs(60),
                },
            ))
            .build();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = manager
            .request_cancellable(Endpoint::get("https://api.example.com", "/slow"), token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(manager.retry_engine().tracked(), 0);
    }

    #[tokio::test]
    async fn cancellable_call_honours_retry_override() {
        let transport = Scripted::new(vec![
            Ok(HttpResponse::json(503, &serde_json::json!({}))),
            Ok(HttpResponse::json(503, &serde_json::json!({}))),
            Ok(HttpResponse::json(200, &serde_json::json!({ "id": 3 }))),
        ]);
        let manager = manager(transport.clone());

        let error = manager
            .request_cancellable_with(
                Endpoint::get("https://api.example.com", "/items"),
                CancellationToken::new(),
                Some(fast_retries(0)),
            )
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), Some(503));
        assert_eq!(transport.calls(), 1);

        let response = manager
            .request_cancellable(
                Endpoint::get("https://api.example.com", "/items"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn aborted_request_leaves_no_retry_state() {
        let transport = Scripted::new(vec![Err(Error::Timeout)]);
        let manager = ApiManager::builder(transport.clone())
            .retry_config(RetryConfig::default().with_retries(5).with_delay(
                DelayPolicy::Constant {
                    delay: Duration::from_secs(60),
                },
            ))
            .build();

        let call = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .request(Endpoint::get("https://api.example.com", "/slow"))
                    .await
            })
        };
        while transport.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.retry_engine().tracked(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(manager.retry_engine().tracked(), 0);
    }
}
