//! OAuth2 access-token cache for the device cloud.
//!
//! Tokens come from the refresh-token grant and live for about an hour.
//! Readers take the cached token under a read lock; a miss (or a token
//! inside the freshness margin) upgrades to the write lock with a second
//! check, so concurrent pipelines trigger at most one refresh.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{RelayError, Result};

const TOKEN_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v4/token";

/// Don't hand out tokens with less than this much life left.
const FRESHNESS_MARGIN: Duration = Duration::from_secs(60);

pub struct TokenCache {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: RwLock<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + FRESHNESS_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self::with_endpoint(http, config, TOKEN_ENDPOINT)
    }

    pub fn with_endpoint(http: reqwest::Client, config: &Config, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: config.refresh_token.clone(),
            cached: RwLock::new(None),
        }
    }

    /// Current access token, refreshing if stale.
    pub async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh() {
                return Ok(token.access_token.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if token.is_fresh() {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.refresh().await?;
        let access_token = token.access_token.clone();
        *slot = Some(token);
        Ok(access_token)
    }

    async fn refresh(&self) -> Result<CachedToken> {
        debug!("refreshing device-cloud access token");
        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Auth(format!("bad token response: {e}")))?;
        info!(expires_in = token.expires_in, "access token refreshed");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_http;

    fn test_config() -> Config {
        Config {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            project_id: "proj".into(),
            refresh_token: "rtok".into(),
            app_id: "app".into(),
            api_token: "atok".into(),
        }
    }

    #[tokio::test]
    async fn refreshes_once_and_caches() {
        let (base, mut exchanges) = spawn_http(vec![(
            200,
            r#"{"access_token":"ya29.token","expires_in":3599}"#.to_string(),
        )])
        .await;
        let cache = TokenCache::with_endpoint(reqwest::Client::new(), &test_config(), &base);

        assert_eq!(cache.bearer().await.unwrap(), "ya29.token");
        // Second call must be served from cache (no second scripted
        // response exists, so a network hit would error).
        assert_eq!(cache.bearer().await.unwrap(), "ya29.token");

        let exchange = exchanges.recv().await.unwrap();
        assert_eq!(exchange.method, "POST");
        assert!(exchange.body.contains("grant_type=refresh_token"));
        assert!(exchange.body.contains("client_id=cid"));
        assert!(exchange.body.contains("refresh_token=rtok"));
        assert!(exchanges.try_recv().is_err());
    }

    #[tokio::test]
    async fn refusal_is_an_auth_error() {
        let (base, _exchanges) = spawn_http(vec![(
            400,
            r#"{"error":"invalid_grant"}"#.to_string(),
        )])
        .await;
        let cache = TokenCache::with_endpoint(reqwest::Client::new(), &test_config(), &base);

        let err = cache.bearer().await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(_)));
        assert!(err.to_string().contains("invalid_grant"));
    }
}
