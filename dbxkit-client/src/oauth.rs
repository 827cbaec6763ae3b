// Refresh-token exchange against the OAuth 2 token endpoint (RFC 6749 section 6).

use crate::client::{ClientBuildError, DEFAULT_USER_AGENT};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dbxkit_core::{AccessToken, AccessTokenRefresher, AuthRefreshError, OAuth2Error};
use http::header::USER_AGENT;
use serde::Deserialize;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges a refresh token for a new short-lived access token.
#[derive(Debug, Clone)]
pub struct OAuthTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    app_key: String,
    locale: String,
    scopes: Vec<String>,
    user_agent: String,
}

impl OAuthTokenRefresher {
    pub fn new(api_host: &str, app_key: impl Into<String>) -> Result<Self, ClientBuildError> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| ClientBuildError::Http(e.to_string()))?;
        Ok(Self::with_client(client, api_host, app_key))
    }

    pub fn with_client(client: reqwest::Client, api_host: &str, app_key: impl Into<String>) -> Self {
        Self {
            client,
            token_url: format!("{}/oauth2/token", api_host.trim_end_matches('/')),
            app_key: app_key.into(),
            locale: "en".to_string(),
            scopes: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Scopes requested for the refreshed token; empty keeps the original grant.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    fn params(&self, refresh_token: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.app_key.clone()),
            ("locale", self.locale.clone()),
        ];
        if !self.scopes.is_empty() {
            params.push(("scope", self.scopes.join(" ")));
        }
        params
    }
}

#[async_trait]
impl AccessTokenRefresher for OAuthTokenRefresher {
    async fn refresh_access_token(&self, token: &AccessToken) -> Result<AccessToken, AuthRefreshError> {
        let Some(refresh_token) = token.refresh_token.as_deref() else {
            return Err(AuthRefreshError::new(
                OAuth2Error::Unknown,
                Some("Long-lived token can't be refreshed.".to_string()),
            ));
        };

        debug!(url = %self.token_url, "Refreshing access token");
        let started = Utc::now();
        let response = self
            .client
            .post(&self.token_url)
            .header(USER_AGENT, &self.user_agent)
            .form(&self.params(refresh_token))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;

        if !status.is_success() {
            let error = match serde_json::from_slice::<TokenErrorResponse>(&body) {
                Ok(e) => AuthRefreshError::new(OAuth2Error::from_code(&e.error), e.error_description),
                Err(_) => AuthRefreshError::new(OAuth2Error::Unknown, None),
            };
            warn!(status = status.as_u16(), error = %error, "Token refresh rejected");
            return Err(error);
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|_| AuthRefreshError::new(OAuth2Error::Unknown, Some("Invalid response.".to_string())))?;
        if !parsed.token_type.eq_ignore_ascii_case("bearer") {
            return Err(AuthRefreshError::new(
                OAuth2Error::Unknown,
                Some("Invalid response.".to_string()),
            ));
        }

        info!(expires_in = parsed.expires_in, "Access token refreshed");
        Ok(AccessToken {
            access_token: parsed.access_token,
            refresh_token: token.refresh_token.clone(),
            expires_at: Some(started + Duration::seconds(parsed.expires_in)),
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> AuthRefreshError {
    if err.is_timeout() {
        AuthRefreshError::timeout(err.to_string())
    } else {
        AuthRefreshError::new(OAuth2Error::Network, Some(format!("Transport error: {}", err)))
    }
}
