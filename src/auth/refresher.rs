//! Refresh exchange over a plain endpoint

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{AuthorizationData, TokenRefresher};
use crate::builder::RequestBuilder;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::pipeline::StatusValidation;
use crate::transport::Transport;

/// Token endpoint response body
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// New access token
    pub access_token: String,
    /// Rotated refresh token; the previous one is kept when absent
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

type EndpointFactory = dyn Fn(&AuthorizationData) -> Result<Endpoint> + Send + Sync;

/// [`TokenRefresher`] that sends a refresh endpoint straight to the transport
///
/// The exchange bypasses the adapter chain, so it never carries the expired
/// bearer token and never recurses into another refresh. A 401 from the
/// token endpoint means the refresh token itself was rejected and surfaces
/// as [`Error::ExpiredRefreshToken`].
pub struct EndpointTokenRefresher {
    transport: Arc<dyn Transport>,
    endpoint: Box<EndpointFactory>,
}

impl EndpointTokenRefresher {
    /// Refresher building its request with `endpoint` from the current data
    pub fn new<F>(transport: Arc<dyn Transport>, endpoint: F) -> Self
    where
        F: Fn(&AuthorizationData) -> Result<Endpoint> + Send + Sync + 'static,
    {
        Self {
            transport,
            endpoint: Box::new(endpoint),
        }
    }
}

#[async_trait]
impl TokenRefresher for EndpointTokenRefresher {
    async fn refresh(&self, current: &AuthorizationData) -> Result<AuthorizationData> {
        let endpoint = (self.endpoint)(current)?;
        let request = RequestBuilder::build(&endpoint)?;
        let response = self.transport.send(request).await?;

        if response.status == Some(401) {
            return Err(Error::ExpiredRefreshToken);
        }
        let response = StatusValidation::validate(response, &endpoint.acceptable_status)?;
        let token: TokenResponse = response.decode()?;

        Ok(AuthorizationData::new(
            token.access_token,
            token
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            token.expires_in.map(Duration::from_secs),
        )
        .with_expiration_offset(current.expiration_offset))
    }
}

impl std::fmt::Debug for EndpointTokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointTokenRefresher").finish_non_exhaustive()
    }
}
