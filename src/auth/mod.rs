//! Authorization
//!
//! - [`AuthorizationData`] - tokens plus expiry
//! - [`AuthorizationStorage`] - injected persistence (`save`, `get`, `delete`)
//! - [`TokenRefresher`] - injected refresh exchange
//! - [`AuthorizationManager`] - single-flight refresh over the two
//! - [`AuthorizationAdapter`] / [`AuthorizationProcessor`] - pipeline stages

mod interceptor;
mod manager;
mod refresher;

pub use interceptor::{AuthorizationAdapter, AuthorizationProcessor};
pub use manager::AuthorizationManager;
pub use refresher::{EndpointTokenRefresher, TokenResponse};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Access and refresh token with expiry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationData {
    /// Bearer token attached to authorized requests
    pub access_token: String,
    /// Token exchanged for a new access token
    pub refresh_token: String,
    /// When the access token expires; `None` means unknown
    pub expires_at: Option<DateTime<Utc>>,
    /// Safety margin subtracted from `expires_at`
    #[serde(default)]
    pub expiration_offset: Duration,
}

impl AuthorizationData {
    /// Tokens expiring `expires_in` from now, with no safety margin
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        let expires_at = expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            expiration_offset: Duration::ZERO,
        }
    }

    /// Set the safety margin
    pub fn with_expiration_offset(mut self, offset: Duration) -> Self {
        self.expiration_offset = offset;
        self
    }

    /// Whether the access token is expired at `now`
    ///
    /// True when `expires_at - expiration_offset <= now`. Without a known
    /// expiry the token is treated as valid.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let offset = chrono::Duration::from_std(self.expiration_offset)
            .unwrap_or_else(|_| chrono::Duration::zero());
        expires_at - offset <= now
    }

    /// Whether the access token is expired now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Persistence for [`AuthorizationData`]
#[async_trait]
pub trait AuthorizationStorage: Send + Sync {
    /// Replace the stored data
    async fn save(&self, data: &AuthorizationData) -> Result<()>;

    /// Current data; [`Error::MissingAuthorizationData`] when nothing is stored
    async fn get(&self) -> Result<AuthorizationData>;

    /// Forget the stored data
    async fn delete(&self) -> Result<()>;
}

/// Process-local [`AuthorizationStorage`]
#[derive(Debug, Default)]
pub struct InMemoryAuthorizationStorage {
    data: RwLock<Option<AuthorizationData>>,
}

impl InMemoryAuthorizationStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with `data`
    pub fn with_data(data: AuthorizationData) -> Self {
        Self {
            data: RwLock::new(Some(data)),
        }
    }
}

#[async_trait]
impl AuthorizationStorage for InMemoryAuthorizationStorage {
    async fn save(&self, data: &AuthorizationData) -> Result<()> {
        *self.data.write().await = Some(data.clone());
        Ok(())
    }

    async fn get(&self) -> Result<AuthorizationData> {
        self.data
            .read()
            .await
            .clone()
            .ok_or(Error::MissingAuthorizationData)
    }

    async fn delete(&self) -> Result<()> {
        *self.data.write().await = None;
        Ok(())
    }
}

/// Exchanges a refresh token for new [`AuthorizationData`]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform the refresh exchange
    ///
    /// Must return [`Error::ExpiredRefreshToken`] when the server rejects the
    /// refresh token itself.
    async fn refresh(&self, current: &AuthorizationData) -> Result<AuthorizationData>;
}
