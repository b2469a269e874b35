// SPDX-License-Identifier: MIT OR Apache-2.0
//! The replay worker: dispatches approved calls to backend MCP servers and
//! records the outcome at the authority.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use govplane_authority::AuthorityClient;
use govplane_model::{ApprovalRecord, ExecStatus, ExecutionResult};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{error, info, warn};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Replays approvals queued at the authority against their configured
/// backend MCP servers.
pub struct ReplayWorker {
    authority: Arc<AuthorityClient>,
    http: reqwest::Client,
    backends: BTreeMap<String, String>,
    trigger: Arc<Notify>,
    poll_interval: Duration,
}

impl ReplayWorker {
    /// Build a worker. `backends` maps a service name to the base URL of the
    /// MCP server that executes its calls.
    pub fn new(
        authority: Arc<AuthorityClient>,
        backends: BTreeMap<String, String>,
        trigger: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            authority,
            http: reqwest::Client::new(),
            backends,
            trigger,
            poll_interval,
        }
    }

    /// Run forever: wait for either the trigger or the poll timeout,
    /// whichever comes first, then drain the queue once.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.drain_once().await;
        }
    }

    /// Drain the approval queue once. Exposed directly for tests; `run`
    /// calls this on every wakeup.
    pub async fn drain_once(&self) {
        let instance_id = match self.authority.find_singleton("ApprovalPolicy").await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "replay worker could not discover the approval policy singleton");
                return;
            }
        };

        let approvals = match self.authority.get_queued_for_execution(&instance_id).await {
            Ok(approvals) => approvals,
            Err(e) => {
                warn!(error = %e, "replay worker could not fetch queued approvals");
                return;
            }
        };
        if approvals.is_empty() {
            return;
        }

        for approval in &approvals {
            let result = self.replay_one(approval).await;
            info!(
                approval_id = %result.approval_id,
                exec_status = ?result.exec_status,
                "replay attempt finished"
            );
            if let Err(e) = self.authority.record_execution(&instance_id, &result).await {
                error!(
                    approval_id = %approval.approval_id,
                    error = %e,
                    "failed to record replay execution result; will re-observe next cycle"
                );
            }
        }
    }

    async fn replay_one(&self, approval: &ApprovalRecord) -> ExecutionResult {
        let Some(service_name) = approval.service_name.as_deref() else {
            return failed(&approval.approval_id, "approval is missing serviceName".to_string());
        };
        let Some(backend_url) = self.backends.get(service_name) else {
            return failed(
                &approval.approval_id,
                format!("no backend configured for service '{service_name}'"),
            );
        };
        let Some(payload_str) = approval.request_payload.as_deref() else {
            return failed(&approval.approval_id, "approval is missing requestPayload".to_string());
        };
        let payload: Value = match serde_json::from_str(payload_str) {
            Ok(v) => v,
            Err(e) => {
                return failed(&approval.approval_id, format!("requestPayload did not parse: {e}"))
            }
        };

        if let Err(reason) = self.handshake(backend_url).await {
            return failed(&approval.approval_id, reason);
        }

        match self.http.post(backend_url).json(&payload).timeout(CALL_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                let text = resp.text().await.unwrap_or_default();
                ExecutionResult {
                    approval_id: approval.approval_id.clone(),
                    exec_status: ExecStatus::Completed,
                    exec_result: text,
                }
            }
            Ok(resp) => failed(
                &approval.approval_id,
                format!("backend rejected call (HTTP {})", resp.status()),
            ),
            Err(e) => failed(&approval.approval_id, format!("backend call failed: {e}")),
        }
    }

    async fn handshake(&self, backend_url: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "clientInfo": {
                    "name": "govplane-replay",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            },
        });
        let resp = self
            .http
            .post(backend_url)
            .json(&body)
            .timeout(INITIALIZE_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("backend initialize failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("backend rejected initialize (HTTP {})", resp.status()));
        }
        Ok(())
    }
}

fn failed(approval_id: &str, reason: String) -> ExecutionResult {
    ExecutionResult {
        approval_id: approval_id.to_string(),
        exec_status: ExecStatus::Failed,
        exec_result: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govplane_auth::TokenCache;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authority_against(server: &MockServer) -> Arc<AuthorityClient> {
        let token_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok", "expires_in": 300
            })))
            .mount(&token_server)
            .await;
        let tokens = Arc::new(TokenCache::new(token_server.uri(), "r", "c", "u", "p"));
        Arc::new(AuthorityClient::new(server.uri(), tokens))
    }

    #[tokio::test]
    async fn drain_once_noop_when_no_approval_policy_registered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ApprovalPolicy/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;
        let authority = authority_against(&server).await;
        let worker = ReplayWorker::new(authority, BTreeMap::new(), Arc::new(Notify::new()), Duration::from_secs(5));
        worker.drain_once().await;
    }

    #[tokio::test]
    async fn missing_backend_records_failed_without_contacting_any_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ApprovalPolicy/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"@id": "ap-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ApprovalPolicy/ap-1/getQueuedForExecution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"approvalId": "appr-1", "serviceName": "unconfigured-svc", "requestPayload": "{}"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ApprovalPolicy/ap-1/recordExecution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let authority = authority_against(&server).await;
        let worker = ReplayWorker::new(authority, BTreeMap::new(), Arc::new(Notify::new()), Duration::from_secs(5));
        worker.drain_once().await;
    }

    #[tokio::test]
    async fn successful_handshake_and_call_records_completed() {
        let server = MockServer::start().await;
        let backend = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ApprovalPolicy/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"@id": "ap-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ApprovalPolicy/ap-1/getQueuedForExecution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"approvalId": "appr-1", "serviceName": "gmail", "requestPayload": "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{}}"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ApprovalPolicy/ap-1/recordExecution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "ok"})))
            .mount(&backend)
            .await;

        let authority = authority_against(&server).await;
        let mut backends = BTreeMap::new();
        backends.insert("gmail".to_string(), backend.uri());
        let worker = ReplayWorker::new(authority, backends, Arc::new(Notify::new()), Duration::from_secs(5));
        worker.drain_once().await;
    }
}
