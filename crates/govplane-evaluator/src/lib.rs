// SPDX-License-Identifier: MIT OR Apache-2.0
//! The constraint evaluator HTTP server.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use govplane_authority::AuthorityClient;
use govplane_constraints::{evaluate_tool_config, ConstraintCache, ConstraintOutcome};
use govplane_model::{Decision, EvaluationRequest};
use serde::Serialize;
use tracing::warn;

/// Shared state for the evaluator's handlers.
pub struct EvaluatorState {
    /// Authority client, used to forward requests the cache can't decide.
    pub authority: Arc<AuthorityClient>,
    /// Constraint snapshot, refreshed independently of request handling.
    pub cache: Arc<ConstraintCache>,
}

/// Build the Axum router for the evaluator server.
pub fn build_app(state: Arc<EvaluatorState>) -> Router {
    Router::new()
        .route("/evaluate", post(post_evaluate))
        .route("/health", get(get_health))
        .layer(axum::middleware::from_fn(govplane_http::request_logger))
        .layer(axum::middleware::from_fn(govplane_http::request_id))
        .with_state(state)
}

async fn post_evaluate(
    State(state): State<Arc<EvaluatorState>>,
    Json(request): Json<EvaluationRequest>,
) -> Response {
    let snapshot = state.cache.snapshot().await;

    let Some(service) = snapshot.get(&request.service_name) else {
        return Json(Decision::deny(format!(
            "No governance instance for service '{}'",
            request.service_name
        )))
        .into_response();
    };

    let Some(tool_config) = service.tool_configs.get(&request.tool_name) else {
        return forward_to_authority(&state.authority, &service.instance_id, &request).await;
    };

    let arguments = match serde_json::from_str::<serde_json::Value>(&request.arguments) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };

    match evaluate_tool_config(tool_config, &arguments) {
        ConstraintOutcome::Violated(message) => Json(Decision::deny(message)).into_response(),
        ConstraintOutcome::Passed if !tool_config.requires_approval => {
            Json(Decision::allow("Constraints satisfied")).into_response()
        }
        ConstraintOutcome::Passed => {
            forward_to_authority(&state.authority, &service.instance_id, &request).await
        }
    }
}

async fn forward_to_authority(
    authority: &AuthorityClient,
    instance_id: &str,
    request: &EvaluationRequest,
) -> Response {
    match authority.evaluate(instance_id, request).await {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => {
            warn!(
                service_name = %request.service_name,
                tool_name = %request.tool_name,
                error = %e,
                "authority evaluation forward failed"
            );
            Json(Decision::deny(format!("Governance evaluation failed: {e}"))).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    cached_services: usize,
}

async fn get_health(State(state): State<Arc<EvaluatorState>>) -> Response {
    let cached_services = state.cache.len().await;
    Json(HealthBody {
        status: "healthy",
        cached_services,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use govplane_auth::TokenCache;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
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

    fn eval_request(service: &str, tool: &str, arguments: &str) -> EvaluationRequest {
        EvaluationRequest {
            service_name: service.to_string(),
            tool_name: tool.to_string(),
            caller_identity: "user-1".to_string(),
            caller_claims: serde_json::json!({}),
            arguments: arguments.to_string(),
            session_id: "sess-1".to_string(),
            request_payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_service_denies_fail_closed() {
        let server = MockServer::start().await;
        let authority = authority_against(&server).await;
        let cache = Arc::new(ConstraintCache::new(authority.clone()));
        let state = Arc::new(EvaluatorState { authority, cache });
        let app = build_app(state);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/evaluate")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::to_vec(&eval_request("unknown-svc", "send", "{}")).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let decision: Decision = serde_json::from_slice(&body).unwrap();
        assert!(!decision.is_allow());
        assert!(decision.message.contains("No governance instance"));
    }

    #[tokio::test]
    async fn malformed_body_returns_400() {
        let server = MockServer::start().await;
        let authority = authority_against(&server).await;
        let cache = Arc::new(ConstraintCache::new(authority.clone()));
        let state = Arc::new(EvaluatorState { authority, cache });
        let app = build_app(state);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/evaluate")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_cached_service_count() {
        let server = MockServer::start().await;
        let authority = authority_against(&server).await;
        let cache = Arc::new(ConstraintCache::new(authority.clone()));
        let state = Arc::new(EvaluatorState { authority, cache });
        let app = build_app(state);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["cached_services"], 0);
    }
}
