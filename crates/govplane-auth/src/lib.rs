// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lazy-refreshing bearer token cache for the gateway service account.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use govplane_error::{ErrorCode, GovError};
use govplane_model::{IdentityTokenResponse, TokenRecord};
use tokio::sync::Mutex;
use tracing::debug;

/// Refresh this far ahead of the token's stated expiry.
const SLACK_SECS: i64 = 10;

/// Caches a single bearer token for the gateway's service account, refreshing
/// it lazily on demand.
///
/// The refresh itself runs while holding the internal mutex, so a second
/// caller that arrives mid-refresh simply awaits the same lock and then
/// re-checks validity instead of issuing a second HTTP request. This
/// satisfies "at most one in-flight refresh" without a separate
/// notification mechanism.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    username: String,
    password: String,
    state: Mutex<Option<TokenRecord>>,
}

impl TokenCache {
    /// Build a cache targeting the identity provider's password grant
    /// endpoint for the given realm.
    pub fn new(
        idp_url: impl Into<String>,
        idp_realm: impl Into<String>,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let idp_url = idp_url.into();
        let idp_realm = idp_realm.into();
        Self {
            http: reqwest::Client::new(),
            token_url: format!(
                "{}/realms/{}/protocol/openid-connect/token",
                idp_url.trim_end_matches('/'),
                idp_realm
            ),
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            state: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, refreshing it first if absent or within
    /// the slack window of expiry.
    pub async fn get_token(&self) -> Result<String, GovError> {
        let mut guard = self.state.lock().await;
        let needs_refresh = match guard.as_ref() {
            Some(record) => Utc::now() >= record.expires_at,
            None => true,
        };
        if needs_refresh {
            let record = self.refresh().await?;
            *guard = Some(record);
        }
        Ok(guard.as_ref().expect("just populated").token.clone())
    }

    async fn refresh(&self) -> Result<TokenRecord, GovError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                GovError::new(ErrorCode::AuthenticationUnreachable, "identity provider unreachable")
                    .with_source(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GovError::new(
                ErrorCode::AuthenticationFailed,
                format!("identity provider rejected password grant (HTTP {status})"),
            )
            .with_context("body", body));
        }

        let parsed: IdentityTokenResponse = response.json().await.map_err(|e| {
            GovError::new(
                ErrorCode::AuthenticationFailed,
                "identity provider response did not parse",
            )
            .with_source(e)
        })?;

        let ttl = ChronoDuration::seconds((parsed.expires_in - SLACK_SECS).max(0));
        debug!(ttl_secs = parsed.expires_in, "refreshed gateway bearer token");
        Ok(TokenRecord {
            token: parsed.access_token,
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_and_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/test/protocol/openid-connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 300,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = TokenCache::new(server.uri(), "test", "gateway", "u", "p");
        let token = cache.get_token().await.unwrap();
        assert_eq!(token, "tok-1");

        // Second call within the TTL must not hit the mock again (expect(1)
        // above would panic on drop if it did).
        let token_again = cache.get_token().await.unwrap();
        assert_eq!(token_again, "tok-1");
    }

    #[tokio::test]
    async fn surfaces_rejection_as_authentication_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/test/protocol/openid-connect/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let cache = TokenCache::new(server.uri(), "test", "gateway", "u", "wrong");
        let err = cache.get_token().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn refreshes_once_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/test/protocol/openid-connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-expired-soon",
                "expires_in": 10,
            })))
            .expect(2)
            .mount(&server)
            .await;

        let cache = TokenCache::new(server.uri(), "test", "gateway", "u", "p");
        cache.get_token().await.unwrap();
        // expires_in (10) - SLACK_SECS (10) = 0, so the token is immediately
        // due for refresh on the next call.
        cache.get_token().await.unwrap();
    }
}
