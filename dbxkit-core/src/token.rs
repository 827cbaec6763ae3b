// Access tokens and the providers that keep them fresh.
// Every request awaits `refresh_access_token_if_necessary` before its network task is created.

use crate::error::AuthRefreshError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Default window before expiry in which a short-lived token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

/// Immutable credential snapshot, replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn long_lived(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn short_lived(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            expires_at: Some(expires_at),
        }
    }

    /// True when the token has expired or expires within `margin` of `now`.
    /// Tokens without an expiry never need refreshing.
    pub fn is_expiring_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - margin <= now,
            None => false,
        }
    }
}

/// Result of a refresh attempt, delivered identically to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The current token is still valid.
    NotNeeded,
    Refreshed(AccessToken),
    Failed(AuthRefreshError),
}

impl RefreshOutcome {
    pub fn error(&self) -> Option<&AuthRefreshError> {
        match self {
            RefreshOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Supplies the current credential and refreshes it on demand.
///
/// Implementations must tolerate concurrent calls from many requests.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync + fmt::Debug {
    /// The access token to put in the `Authorization` header.
    fn access_token(&self) -> String;

    /// Refresh the token if it is expired or about to expire.
    async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome;
}

/// Performs the network exchange of a refresh token for a new access token.
#[async_trait]
pub trait AccessTokenRefresher: Send + Sync + fmt::Debug {
    async fn refresh_access_token(&self, token: &AccessToken) -> Result<AccessToken, AuthRefreshError>;
}

/// Legacy long-lived token that never needs a refresh.
#[derive(Debug, Clone)]
pub struct LongLivedAccessTokenProvider {
    access_token: String,
}

impl LongLivedAccessTokenProvider {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for LongLivedAccessTokenProvider {
    fn access_token(&self) -> String {
        self.access_token.clone()
    }

    async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome {
        RefreshOutcome::NotNeeded
    }
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Short-lived token with single-flight refresh.
///
/// While a refresh is pending, further callers join it instead of starting a
/// new one; all of them observe the same `RefreshOutcome`.
pub struct ShortLivedAccessTokenProvider {
    token: Arc<RwLock<AccessToken>>,
    refresher: Arc<dyn AccessTokenRefresher>,
    in_flight: Arc<Mutex<Option<SharedRefresh>>>,
    refresh_margin: Duration,
}

impl ShortLivedAccessTokenProvider {
    pub fn new(token: AccessToken, refresher: Arc<dyn AccessTokenRefresher>) -> Self {
        Self::with_refresh_margin(token, refresher, Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS))
    }

    pub fn with_refresh_margin(
        token: AccessToken,
        refresher: Arc<dyn AccessTokenRefresher>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
            refresher,
            in_flight: Arc::new(Mutex::new(None)),
            refresh_margin,
        }
    }

    /// Snapshot of the current token.
    pub fn token(&self) -> AccessToken {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh_in_progress(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    fn start_refresh(&self, current: AccessToken) -> SharedRefresh {
        let refresher = Arc::clone(&self.refresher);
        let token = Arc::clone(&self.token);
        let in_flight = Arc::clone(&self.in_flight);

        async move {
            info!("Refreshing access token");
            let outcome = match refresher.refresh_access_token(&current).await {
                Ok(refreshed) => {
                    *token.write().unwrap_or_else(PoisonError::into_inner) = refreshed.clone();
                    RefreshOutcome::Refreshed(refreshed)
                }
                Err(error) => {
                    warn!(error = %error, invalid_grant = error.is_invalid_grant(), "Access token refresh failed");
                    RefreshOutcome::Failed(error)
                }
            };
            lock(&in_flight).take();
            outcome
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl AccessTokenProvider for ShortLivedAccessTokenProvider {
    fn access_token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .access_token
            .clone()
    }

    async fn refresh_access_token_if_necessary(&self) -> RefreshOutcome {
        let pending = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight access token refresh");
                    existing.clone()
                }
                None => {
                    let current = self.token();
                    if !current.is_expiring_within(self.refresh_margin, Utc::now()) {
                        return RefreshOutcome::NotNeeded;
                    }
                    let refresh = self.start_refresh(current);
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        pending.await
    }
}

impl fmt::Debug for ShortLivedAccessTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortLivedAccessTokenProvider")
            .field("expires_at", &self.token().expires_at)
            .field("refresh_in_progress", &self.refresh_in_progress())
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct GatedRefresher {
        calls: AtomicUsize,
        gate: Notify,
        result: Result<AccessToken, AuthRefreshError>,
    }

    impl GatedRefresher {
        fn new(result: Result<AccessToken, AuthRefreshError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                result,
            })
        }
    }

    #[async_trait]
    impl AccessTokenRefresher for GatedRefresher {
        async fn refresh_access_token(&self, _token: &AccessToken) -> Result<AccessToken, AuthRefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.result.clone()
        }
    }

    fn expired_token() -> AccessToken {
        AccessToken::short_lived("old", "refresh", Utc::now() - Duration::seconds(10))
    }

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let token = AccessToken::short_lived("t", "r", now + Duration::seconds(200));
        assert!(token.is_expiring_within(Duration::seconds(300), now));
        assert!(!token.is_expiring_within(Duration::seconds(100), now));
        assert!(!AccessToken::long_lived("t").is_expiring_within(Duration::seconds(300), now));
    }

    #[tokio::test]
    async fn test_long_lived_never_refreshes() {
        let provider = LongLivedAccessTokenProvider::new("token");
        assert_eq!(provider.access_token(), "token");
        assert_eq!(provider.refresh_access_token_if_necessary().await, RefreshOutcome::NotNeeded);
    }

    #[tokio::test]
    async fn test_fresh_token_is_not_refreshed() {
        let refresher = GatedRefresher::new(Ok(AccessToken::long_lived("new")));
        let token = AccessToken::short_lived("current", "refresh", Utc::now() + Duration::hours(4));
        let provider = ShortLivedAccessTokenProvider::new(token, refresher.clone());

        assert_eq!(provider.refresh_access_token_if_necessary().await, RefreshOutcome::NotNeeded);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_coalesced() {
        let new_token = AccessToken::short_lived("new", "refresh", Utc::now() + Duration::hours(4));
        let refresher = GatedRefresher::new(Ok(new_token.clone()));
        let provider = ShortLivedAccessTokenProvider::new(expired_token(), refresher.clone());

        let (first, second, ()) = tokio::join!(
            provider.refresh_access_token_if_necessary(),
            provider.refresh_access_token_if_necessary(),
            async { refresher.gate.notify_one() },
        );

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first, RefreshOutcome::Refreshed(new_token));
        assert_eq!(provider.access_token(), "new");
        assert!(!provider.refresh_in_progress());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_old_token() {
        let refresher = GatedRefresher::new(Err(AuthRefreshError::timeout("timed out")));
        let provider = ShortLivedAccessTokenProvider::new(expired_token(), refresher.clone());

        let (first, second, ()) = tokio::join!(
            provider.refresh_access_token_if_necessary(),
            provider.refresh_access_token_if_necessary(),
            async { refresher.gate.notify_one() },
        );

        assert_eq!(first, second);
        assert_eq!(first.error().map(|e| e.is_invalid_grant()), Some(false));
        assert_eq!(provider.access_token(), "old");
        assert!(!provider.refresh_in_progress());
    }

    #[tokio::test]
    async fn test_refresh_after_completion_starts_a_new_flight() {
        let refresher = GatedRefresher::new(Err(AuthRefreshError::invalid_grant("revoked")));
        let provider = ShortLivedAccessTokenProvider::new(expired_token(), refresher.clone());

        refresher.gate.notify_one();
        provider.refresh_access_token_if_necessary().await;
        refresher.gate.notify_one();
        provider.refresh_access_token_if_necessary().await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }
}
