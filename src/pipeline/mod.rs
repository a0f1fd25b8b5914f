//! Adapter/processor chain
//!
//! A [`Pipeline`] holds two ordered lists of stages:
//! - [`RequestAdapter`]s run before the transport and return a new request
//! - [`ResponseProcessor`]s run after the transport, on the response or on the
//!   error, and return a new response or a (possibly translated) error
//!
//! Both lists are folded in registration order. A failing adapter
//! short-circuits the chain. A failing processor switches the remaining
//! processors to their error hook, so later stages never see the input the
//! earlier stage rejected. [`ErrorMapper`]s run last and let application
//! code translate errors into its own vocabulary.
//!
//! Standard stages live in the submodules:
//! - [`logging`] - request/response logging via `tracing`
//! - [`validation`] - acceptable status-code check
//! - [`capture`] - debug capture of request/response pairs

pub mod capture;
pub mod logging;
pub mod validation;

use async_trait::async_trait;
use std::sync::Arc;

use crate::endpoint::EndpointRequest;
use crate::error::{Error, Result};
use crate::http::{HttpResponse, WireRequest};

pub use capture::{CaptureRecord, DebugCapture};
pub use logging::LoggingStage;
pub use validation::StatusValidation;

/// Stage that mutates a request before it is sent
#[async_trait]
pub trait RequestAdapter: Send + Sync {
    /// Return the (possibly modified) request, or an error to abort the call
    async fn adapt(&self, request: WireRequest, ctx: &EndpointRequest) -> Result<WireRequest>;
}

/// Stage that observes or mutates the outcome of a transport call
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    /// Called with a response while no earlier stage has failed
    async fn process(
        &self,
        response: HttpResponse,
        _request: &WireRequest,
        _ctx: &EndpointRequest,
    ) -> Result<HttpResponse> {
        Ok(response)
    }

    /// Called with the error once the transport or an earlier stage failed
    async fn process_error(
        &self,
        error: Error,
        _request: &WireRequest,
        _ctx: &EndpointRequest,
    ) -> Error {
        error
    }
}

/// Application hook translating errors after all processors ran
pub trait ErrorMapper: Send + Sync {
    /// Return the error to surface instead of `error`
    fn map(&self, error: Error, ctx: &EndpointRequest) -> Error;
}

impl<F> ErrorMapper for F
where
    F: Fn(Error, &EndpointRequest) -> Error + Send + Sync,
{
    fn map(&self, error: Error, ctx: &EndpointRequest) -> Error {
        self(error, ctx)
    }
}

/// Ordered adapter, processor and error-mapper lists
#[derive(Clone, Default)]
pub struct Pipeline {
    adapters: Vec<Arc<dyn RequestAdapter>>,
    processors: Vec<Arc<dyn ResponseProcessor>>,
    error_mappers: Vec<Arc<dyn ErrorMapper>>,
}

impl Pipeline {
    /// Empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an adapter
    pub fn push_adapter(&mut self, adapter: Arc<dyn RequestAdapter>) {
        self.adapters.push(adapter);
    }

    /// Append a processor
    pub fn push_processor(&mut self, processor: Arc<dyn ResponseProcessor>) {
        self.processors.push(processor);
    }

    /// Append an error mapper
    pub fn push_error_mapper(&mut self, mapper: Arc<dyn ErrorMapper>) {
        self.error_mappers.push(mapper);
    }

    /// Number of adapters and processors
    pub fn stage_counts(&self) -> (usize, usize) {
        (self.adapters.len(), self.processors.len())
    }

    /// Fold the request through every adapter
    pub async fn adapt(&self, request: WireRequest, ctx: &EndpointRequest) -> Result<WireRequest> {
        let mut request = request;
        for adapter in &self.adapters {
            request = adapter.adapt(request, ctx).await?;
        }
        Ok(request)
    }

    /// Fold the transport outcome through every processor
    pub async fn process(
        &self,
        outcome: Result<HttpResponse>,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Result<HttpResponse> {
        let mut state = outcome;
        for processor in &self.processors {
            state = match state {
                Ok(response) => processor.process(response, request, ctx).await,
                Err(error) => Err(processor.process_error(error, request, ctx).await),
            };
        }
        state
    }

    /// Fold a failure through every processor's error hook
    pub async fn fail(&self, error: Error, request: &WireRequest, ctx: &EndpointRequest) -> Error {
        let mut error = error;
        for processor in &self.processors {
            error = processor.process_error(error, request, ctx).await;
        }
        error
    }

    /// Run every error mapper in order
    pub fn map_error(&self, error: Error, ctx: &EndpointRequest) -> Error {
        self.error_mappers
            .iter()
            .fold(error, |error, mapper| mapper.map(error, ctx))
    }
}
