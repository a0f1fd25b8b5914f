//! Builder wiring stages into an [`ApiManager`]

use std::sync::Arc;

use super::ApiManager;
use crate::auth::{AuthorizationAdapter, AuthorizationManager, AuthorizationProcessor};
use crate::config::RetryConfig;
use crate::pipeline::{
    DebugCapture, ErrorMapper, LoggingStage, Pipeline, RequestAdapter, ResponseProcessor,
    StatusValidation,
};
use crate::transport::Transport;
use crate::types::SessionId;

/// Configures the stages of an [`ApiManager`]
///
/// Standard stages are placed in a fixed order regardless of the order the
/// builder methods are called in:
///
/// - adapters: authorization, custom adapters, logging
/// - processors: debug capture, status validation, authorization, custom
///   processors, logging
/// - error mappers: in registration order
pub struct ApiManagerBuilder {
    transport: Arc<dyn Transport>,
    retry_config: RetryConfig,
    session: Option<SessionId>,
    logging: bool,
    status_validation: bool,
    debug_capture: Option<DebugCapture>,
    authorization: Option<Arc<AuthorizationManager>>,
    adapters: Vec<Arc<dyn RequestAdapter>>,
    processors: Vec<Arc<dyn ResponseProcessor>>,
    error_mappers: Vec<Arc<dyn ErrorMapper>>,
}

impl ApiManagerBuilder {
    /// Builder with no stages and the default retry policy
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry_config: RetryConfig::default(),
            session: None,
            logging: false,
            status_validation: false,
            debug_capture: None,
            authorization: None,
            adapters: Vec::new(),
            processors: Vec::new(),
            error_mappers: Vec::new(),
        }
    }

    /// Default retry policy for calls without their own
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Use a fixed session id instead of a generated one
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Toggle the logging stage
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Toggle status validation
    pub fn status_validation(mut self, enabled: bool) -> Self {
        self.status_validation = enabled;
        self
    }

    /// Capture request/response pairs
    pub fn debug_capture(mut self, capture: DebugCapture) -> Self {
        self.debug_capture = Some(capture);
        self
    }

    /// Attach bearer tokens and handle 401s through `manager`
    pub fn authorization(mut self, manager: Arc<AuthorizationManager>) -> Self {
        self.authorization = Some(manager);
        self
    }

    /// Append a custom adapter
    pub fn adapter(mut self, adapter: Arc<dyn RequestAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Append a custom processor
    pub fn processor(mut self, processor: Arc<dyn ResponseProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Append an error mapper
    pub fn error_mapper(mut self, mapper: Arc<dyn ErrorMapper>) -> Self {
        self.error_mappers.push(mapper);
        self
    }

    /// Assemble the pipeline and create the manager
    pub fn build(self) -> ApiManager {
        let mut pipeline = Pipeline::new();

        if let Some(manager) = &self.authorization {
            pipeline.push_adapter(Arc::new(AuthorizationAdapter::new(manager.clone())));
        }
        for adapter in self.adapters {
            pipeline.push_adapter(adapter);
        }
        if self.logging {
            pipeline.push_adapter(Arc::new(LoggingStage));
        }

        if let Some(capture) = self.debug_capture {
            pipeline.push_processor(Arc::new(capture));
        }
        if self.status_validation {
            pipeline.push_processor(Arc::new(StatusValidation));
        }
        if let Some(manager) = &self.authorization {
            pipeline.push_processor(Arc::new(AuthorizationProcessor::new(manager.clone())));
        }
        for processor in self.processors {
            pipeline.push_processor(processor);
        }
        if self.logging {
            pipeline.push_processor(Arc::new(LoggingStage));
        }

        for mapper in self.error_mappers {
            pipeline.push_error_mapper(mapper);
        }

        let (adapters, processors) = pipeline.stage_counts();
        tracing::debug!(adapters, processors, "api manager assembled");

        ApiManager::from_parts(
            self.transport,
            pipeline,
            self.retry_config,
            self.session.unwrap_or_default(),
        )
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::http::{HttpResponse, WireRequest};
    use async_trait::async_trait;

    struct Unused;

    #[async_trait]
    impl Transport for Unused {
        async fn send(&self, _request: WireRequest) -> Result<HttpResponse> {
            Err(crate::error::Error::Transport("unused".into()))
        }
    }

    #[test]
    fn standard_stages_are_counted() {
        let manager = ApiManagerBuilder::new(Arc::new(Unused))
            .logging(true)
            .status_validation(true)
            .session(SessionId("fixed".into()))
            .build();

        assert_eq!(manager.pipeline().stage_counts(), (1, 2));
        assert_eq!(manager.session(), &SessionId("fixed".into()));
    }

    #[test]
    fn bare_builder_has_no_stages() {
        let manager = ApiManagerBuilder::new(Arc::new(Unused)).build();
        assert_eq!(manager.pipeline().stage_counts(), (0, 0));
        assert_eq!(manager.default_retry_config().retries, 3);
    }
}
