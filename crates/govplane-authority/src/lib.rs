// SPDX-License-Identifier: MIT OR Apache-2.0
//! REST client for the policy authority: singleton discovery, bundle data
//! fetch, governance-instance enumeration, evaluation forwarding, and the
//! replay queue.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use govplane_auth::TokenCache;
use govplane_error::{ErrorCode, GovError};
use govplane_model::{ApprovalRecord, Decision, EvaluationRequest, ExecutionResult, PolicyDocument, ToolConfig};
use serde::Deserialize;
use tracing::warn;

const UNARY_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of an authority `{"items": [...]}` collection response.
#[derive(Debug, Deserialize)]
struct CollectionItem {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "serviceName", default)]
    service_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    items: Vec<CollectionItem>,
}

/// Client for the authority REST API.
///
/// One `reqwest::Client` is shared across all calls so connections are
/// reused. Every method attaches a fresh bearer token from the shared
/// [`TokenCache`].
pub struct AuthorityClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl AuthorityClient {
    /// Build a client targeting `base_url`, authenticating via `tokens`.
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builder");
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn bearer(&self) -> Result<String, GovError> {
        self.tokens.get_token().await
    }

    fn collection_url(&self, kind: &str) -> String {
        format!("{}/{kind}/", self.base_url)
    }

    fn action_url(&self, kind: &str, id: &str, action: &str) -> String {
        format!("{}/{kind}/{id}/{action}", self.base_url)
    }

    async fn get_collection(&self, kind: &str) -> Result<Collection, GovError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(self.collection_url(kind))
            .bearer_auth(token)
            .timeout(UNARY_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                GovError::new(ErrorCode::AuthorityUnreachable, format!("listing {kind}"))
                    .with_source(e)
            })?;
        Self::parse_json(resp, kind).await
    }

    async fn post_action<B: serde::Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        body: &B,
    ) -> Result<T, GovError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .post(self.action_url(kind, id, action))
            .bearer_auth(token)
            .json(body)
            .timeout(UNARY_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                GovError::new(
                    ErrorCode::AuthorityUnreachable,
                    format!("invoking {kind}/{id}/{action}"),
                )
                .with_source(e)
            })?;
        Self::parse_json(resp, action).await
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<T, GovError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GovError::new(
                ErrorCode::AuthorityRejected,
                format!("authority rejected {what} (HTTP {status})"),
            )
            .with_context("body", body));
        }
        let bytes = resp.bytes().await.map_err(|e| {
            GovError::new(ErrorCode::AuthorityMalformed, format!("reading {what} response"))
                .with_source(e)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            GovError::new(ErrorCode::AuthorityMalformed, format!("{what} response did not parse"))
                .with_source(e)
        })
    }

    /// Discover a protocol-instance singleton by listing `kind` and taking
    /// the first item's identifier.
    pub async fn find_singleton(&self, kind: &str) -> Result<Option<String>, GovError> {
        let collection = self.get_collection(kind).await?;
        Ok(collection.items.into_iter().next().map(|i| i.id))
    }

    /// Fetch the full catalog/access-rules document behind `store_id`.
    pub async fn fetch_bundle_data(&self, store_id: &str) -> Result<PolicyDocument, GovError> {
        self.post_action("PolicyStore", store_id, "fetchBundleData", &serde_json::json!({}))
            .await
    }

    /// Enumerate all governance instances, keyed by the service name each
    /// declares.
    pub async fn discover_governance_instances(&self) -> Result<BTreeMap<String, String>, GovError> {
        let collection = self.get_collection("GovernanceInstance").await?;
        let mut out = BTreeMap::new();
        for item in collection.items {
            match item.service_name {
                Some(name) => {
                    out.insert(name, item.id);
                }
                None => warn!(instance_id = %item.id, "governance instance missing serviceName"),
            }
        }
        Ok(out)
    }

    /// Fetch every tool config registered under a governance instance.
    pub async fn get_tool_configs(&self, instance_id: &str) -> Result<Vec<ToolConfig>, GovError> {
        self.post_action(
            "GovernanceInstance",
            instance_id,
            "getToolConfigs",
            &serde_json::json!({}),
        )
        .await
    }

    /// Forward an evaluation request to the authority for adjudication.
    pub async fn evaluate(
        &self,
        instance_id: &str,
        request: &EvaluationRequest,
    ) -> Result<Decision, GovError> {
        self.post_action("GovernanceInstance", instance_id, "evaluate", request)
            .await
    }

    /// Fetch approvals queued for replay under a governance instance.
    pub async fn get_queued_for_execution(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ApprovalRecord>, GovError> {
        self.post_action(
            "GovernanceInstance",
            instance_id,
            "getQueuedForExecution",
            &serde_json::json!({}),
        )
        .await
    }

    /// Record the outcome of replaying an approval.
    pub async fn record_execution(
        &self,
        instance_id: &str,
        result: &ExecutionResult,
    ) -> Result<(), GovError> {
        let _ignored: serde_json::Value = self
            .post_action("GovernanceInstance", instance_id, "recordExecution", result)
            .await?;
        Ok(())
    }

    /// Open the authority's state-change event stream, resuming from
    /// `last_event_id` when given. The returned response is an unparsed
    /// `text/event-stream`; SSE framing is the caller's responsibility.
    ///
    /// Unlike the unary calls, no read timeout is applied here — only the
    /// client's connect timeout governs how long opening the stream may take.
    pub async fn open_state_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Response, GovError> {
        let token = self.bearer().await?;
        let mut req = self
            .http
            .get(format!("{}/streams/states", self.base_url))
            .bearer_auth(token);
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }
        let resp = req.send().await.map_err(|e| {
            GovError::new(ErrorCode::AuthorityUnreachable, "opening state stream").with_source(e)
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GovError::new(
                ErrorCode::AuthorityRejected,
                format!("authority rejected state stream subscription (HTTP {status})"),
            ));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_with(server: &MockServer) -> AuthorityClient {
        let token_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 300,
            })))
            .mount(&token_server)
            .await;
        let tokens = Arc::new(TokenCache::new(token_server.uri(), "r", "c", "u", "p"));
        AuthorityClient::new(server.uri(), tokens)
    }

    #[tokio::test]
    async fn find_singleton_returns_first_item_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ApprovalPolicy/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"@id": "ap-1"}, {"@id": "ap-2"}]
            })))
            .mount(&server)
            .await;

        let client = client_with(&server).await;
        let found = client.find_singleton("ApprovalPolicy").await.unwrap();
        assert_eq!(found, Some("ap-1".to_string()));
    }

    #[tokio::test]
    async fn find_singleton_returns_none_when_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ApprovalPolicy/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;

        let client = client_with(&server).await;
        assert_eq!(client.find_singleton("ApprovalPolicy").await.unwrap(), None);
    }

    #[tokio::test]
    async fn discover_governance_instances_skips_missing_service_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/GovernanceInstance/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"@id": "gi-1", "serviceName": "gmail"},
                    {"@id": "gi-2"},
                ]
            })))
            .mount(&server)
            .await;

        let client = client_with(&server).await;
        let instances = client.discover_governance_instances().await.unwrap();
        assert_eq!(instances.get("gmail"), Some(&"gi-1".to_string()));
        assert_eq!(instances.len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/GovernanceInstance/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_with(&server).await;
        let err = client.discover_governance_instances().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthorityRejected);
    }
}
