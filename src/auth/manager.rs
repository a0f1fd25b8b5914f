//! Authorization manager with single-flight refresh

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{AuthorizationData, AuthorizationStorage, TokenRefresher};
use crate::error::{AuthorizationError, Error, Result};

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<AuthorizationData, AuthorizationError>>>;

/// Hands out valid authorization data, refreshing at most once at a time
///
/// Every caller that finds the stored token expired while a refresh is in
/// flight waits on that same refresh and receives its outcome, success or
/// failure. The in-flight slot sits behind a sync lock that is never held
/// across an `.await`, so a dropped waiter cannot leave a finished refresh in
/// place.
pub struct AuthorizationManager {
    storage: Arc<dyn AuthorizationStorage>,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Mutex<Option<RefreshFuture>>,
    refreshes: Arc<AtomicU64>,
}

impl AuthorizationManager {
    /// Manager over the given collaborators
    pub fn new(storage: Arc<dyn AuthorizationStorage>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            storage,
            refresher,
            in_flight: Mutex::new(None),
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of refresh exchanges started so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Data with a non-expired access token
    ///
    /// Fails with [`Error::MissingAuthorizationData`] when nothing is stored,
    /// or with the shared refresh failure.
    pub async fn valid_authorization(&self) -> Result<AuthorizationData> {
        let data = self.storage.get().await?;
        if !data.is_expired() {
            return Ok(data);
        }
        tracing::debug!("access token expired, refreshing");
        self.refresh().await
    }

    /// Join the in-flight refresh, or start one
    pub async fn refresh(&self) -> Result<AuthorizationData> {
        let shared = {
            let mut slot = self.slot();
            match slot.as_ref() {
                // a finished refresh is never replayed
                Some(existing) if existing.peek().is_none() => existing.clone(),
                _ => {
                    let fresh = self.start_refresh();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let outcome = shared.clone().await;
        self.release(&shared);
        outcome.map_err(Error::from)
    }

    fn slot(&self) -> MutexGuard<'_, Option<RefreshFuture>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, finished: &RefreshFuture) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(finished)) {
            *slot = None;
        }
    }

    fn start_refresh(&self) -> RefreshFuture {
        let storage = self.storage.clone();
        let refresher = self.refresher.clone();
        let refreshes = self.refreshes.clone();

        async move {
            // a refresh that finished just before this one started already stored fresh data
            let current = storage.get().await.map_err(|e| AuthorizationError::from(&e))?;
            if !current.is_expired() {
                return Ok(current);
            }

            refreshes.fetch_add(1, Ordering::SeqCst);
            let refreshed = match refresher.refresh(&current).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed");
                    return Err(AuthorizationError::from(&e));
                }
            };
            storage
                .save(&refreshed)
                .await
                .map_err(|e| AuthorizationError::from(&e))?;
            tracing::info!(expires_at = ?refreshed.expires_at, "access token refreshed");
            Ok(refreshed)
        }
        .boxed()
        .shared()
    }

    /// Persist data obtained from a login
    pub async fn store(&self, data: AuthorizationData) -> Result<()> {
        self.storage.save(&data).await
    }

    /// Forget stored data
    pub async fn logout(&self) -> Result<()> {
        self.storage.delete().await
    }

    /// Mark the stored access token expired if it is still `rejected`
    ///
    /// Returns whether the stored data changed. A token already replaced by a
    /// concurrent refresh is left alone.
    pub async fn invalidate_access_token(&self, rejected: &str) -> Result<bool> {
        let mut data = match self.storage.get().await {
            Ok(data) => data,
            Err(Error::MissingAuthorizationData) => return Ok(false),
            Err(e) => return Err(e),
        };
        if data.access_token != rejected {
            return Ok(false);
        }
        data.expires_at = Some(Utc::now());
        self.storage.save(&data).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for AuthorizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationManager")
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}
