//! Pipeline stages attaching and policing the bearer token

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use std::sync::Arc;

use super::AuthorizationManager;
use crate::endpoint::EndpointRequest;
use crate::error::{Error, Result};
use crate::http::WireRequest;
use crate::pipeline::{RequestAdapter, ResponseProcessor};

/// Attaches `Authorization: Bearer <token>` to endpoints that require it
///
/// Endpoints without `requires_authorization` pass through unchanged. An
/// expired token is refreshed first through the manager's single-flight
/// refresh.
#[derive(Clone, Debug)]
pub struct AuthorizationAdapter {
    manager: Arc<AuthorizationManager>,
}

impl AuthorizationAdapter {
    /// Adapter backed by `manager`
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RequestAdapter for AuthorizationAdapter {
    async fn adapt(&self, request: WireRequest, ctx: &EndpointRequest) -> Result<WireRequest> {
        if !ctx.endpoint.requires_authorization {
            return Ok(request);
        }
        let data = self.manager.valid_authorization().await?;
        request.with_header(AUTHORIZATION.as_str(), &format!("Bearer {}", data.access_token))
    }
}

/// Turns a 401 on an authorized request into [`Error::ExpiredAccessToken`]
///
/// The rejected token is marked expired in storage, so the retry of the call
/// goes through the refresh path in [`AuthorizationAdapter`].
#[derive(Clone, Debug)]
pub struct AuthorizationProcessor {
    manager: Arc<AuthorizationManager>,
}

impl AuthorizationProcessor {
    /// Processor backed by `manager`
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ResponseProcessor for AuthorizationProcessor {
    async fn process_error(
        &self,
        error: Error,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Error {
        if !ctx.endpoint.requires_authorization || error.status_code() != Some(401) {
            return error;
        }

        if let Some(token) = bearer_token(request) {
            match self.manager.invalidate_access_token(token).await {
                Ok(changed) => {
                    tracing::debug!(request_id = %ctx.id, changed, "access token rejected")
                }
                Err(e) => {
                    tracing::warn!(request_id = %ctx.id, error = %e, "failed to invalidate access token")
                }
            }
        }
        Error::ExpiredAccessToken
    }
}

fn bearer_token(request: &WireRequest) -> Option<&str> {
    request
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationData, AuthorizationStorage, InMemoryAuthorizationStorage, TokenRefresher};
    use crate::builder::RequestBuilder;
    use crate::endpoint::Endpoint;
    use crate::http::HttpResponse;
    use crate::types::SessionId;
    use std::time::Duration;

    struct StaticRefresher;

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self, _current: &AuthorizationData) -> Result<AuthorizationData> {
            Ok(AuthorizationData::new("renewed", "r", Some(Duration::from_secs(600))))
        }
    }

    fn setup(data: Option<AuthorizationData>) -> (Arc<AuthorizationManager>, Arc<InMemoryAuthorizationStorage>) {
        let storage = Arc::new(match data {
            Some(data) => InMemoryAuthorizationStorage::with_data(data),
            None => InMemoryAuthorizationStorage::new(),
        });
        let manager = Arc::new(AuthorizationManager::new(
            storage.clone(),
            Arc::new(StaticRefresher),
        ));
        (manager, storage)
    }

    fn call(endpoint: Endpoint) -> (WireRequest, EndpointRequest) {
        let request = RequestBuilder::build(&endpoint).unwrap();
        (request, EndpointRequest::new(endpoint, SessionId("s".into())).unwrap())
    }

    #[tokio::test]
    async fn public_endpoint_is_untouched() {
        let (manager, _) = setup(None);
        let (request, ctx) = call(Endpoint::get("https://api.example.com", "/public"));

        let adapted = AuthorizationAdapter::new(manager).adapt(request, &ctx).await.unwrap();
        assert!(!adapted.headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn bearer_header_attached() {
        let (manager, _) = setup(Some(AuthorizationData::new("tok", "r", None)));
        let (request, ctx) = call(Endpoint::get("https://api.example.com", "/me").authorized());

        let adapted = AuthorizationAdapter::new(manager).adapt(request, &ctx).await.unwrap();
        assert_eq!(adapted.headers[AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn missing_data_fails_authorized_endpoint() {
        let (manager, _) = setup(None);
        let (request, ctx) = call(Endpoint::get("https://api.example.com", "/me").authorized());

        let result = AuthorizationAdapter::new(manager).adapt(request, &ctx).await;
        assert!(matches!(result, Err(Error::MissingAuthorizationData)));
    }

    #[tokio::test]
    async fn unauthorized_response_expires_token() {
        let (manager, storage) = setup(Some(AuthorizationData::new("tok", "r", None)));
        let (request, ctx) = call(Endpoint::get("https://api.example.com", "/me").authorized());
        let request = request.with_header("Authorization", "Bearer tok").unwrap();

        let error = Error::UnacceptableStatusCode {
            code: 401,
            acceptable: 200..300,
            response: Box::new(HttpResponse::json(401, &serde_json::json!({}))),
        };
        let mapped = AuthorizationProcessor::new(manager.clone())
            .process_error(error, &request, &ctx)
            .await;

        assert!(matches!(mapped, Error::ExpiredAccessToken));
        assert!(storage.get().await.unwrap().is_expired());
        assert_eq!(manager.valid_authorization().await.unwrap().access_token, "renewed");
    }

    #[tokio::test]
    async fn other_errors_pass_through() {
        let (manager, _) = setup(Some(AuthorizationData::new("tok", "r", None)));
        let (request, ctx) = call(Endpoint::get("https://api.example.com", "/me").authorized());

        let mapped = AuthorizationProcessor::new(manager)
            .process_error(Error::Timeout, &request, &ctx)
            .await;
        assert!(matches!(mapped, Error::Timeout));
    }
}
