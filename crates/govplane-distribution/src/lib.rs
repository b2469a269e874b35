// SPDX-License-Identifier: MIT OR Apache-2.0
//! The distribution HTTP server: serves the current policy bundle and its
//! health status.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use govplane_events::EventStreamConsumer;
use govplane_rebuild::RebuildCoordinator;
use serde::Serialize;

/// Shared state for the distribution server's handlers.
pub struct DistributionState {
    /// Exact bundle name the server answers for, e.g. `mcp`.
    pub bundle_name: String,
    /// `/health` degrades once the served bundle is older than this.
    pub staleness_threshold: Duration,
    /// Reconciliation interval; used to judge a stalled event stream as stale.
    pub reconcile_interval: Duration,
    /// Owns the served bundle and rebuild counters.
    pub rebuild: Arc<RebuildCoordinator>,
    /// Tracks event-stream connectivity.
    pub stream: Arc<EventStreamConsumer>,
}

/// Build the Axum router for the distribution server.
pub fn build_app(state: Arc<DistributionState>) -> Router {
    Router::new()
        .route("/bundles/{name}/data.tar.gz", get(get_bundle))
        .route("/health", get(get_health))
        .layer(axum::middleware::from_fn(govplane_http::request_logger))
        .layer(axum::middleware::from_fn(govplane_http::request_id))
        .with_state(state)
}

async fn get_bundle(
    State(state): State<Arc<DistributionState>>,
    AxPath(name): AxPath<String>,
    headers: HeaderMap,
) -> Response {
    if name != state.bundle_name {
        return (StatusCode::NOT_FOUND, "unknown bundle").into_response();
    }

    let served = state.rebuild.served_bundle();
    let guard = served.read().await;
    let Some(bundle) = guard.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Bundle not ready").into_response();
    };

    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
        if if_none_match.as_bytes() == bundle.etag.as_bytes() {
            return (
                StatusCode::NOT_MODIFIED,
                [(header::ETAG, bundle.etag.clone())],
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::ETAG, bundle.etag.clone()),
        ],
        bundle.bytes.clone(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    revision: String,
    bundle_age_seconds: Option<u64>,
    sse_connected: bool,
    last_sse_event_at: Option<chrono::DateTime<Utc>>,
    rebuild_count: u64,
    rebuild_error_count: u64,
    staleness_threshold_seconds: u64,
}

async fn get_health(State(state): State<Arc<DistributionState>>) -> Response {
    let served = state.rebuild.served_bundle();
    let guard = served.read().await;
    let stream_status = state.stream.status().await;
    let (rebuild_count, rebuild_error_count) = state.rebuild.counters();
    let now = Utc::now();

    let (status, revision, bundle_age_seconds) = match guard.as_ref() {
        None => ("initializing", String::new(), None),
        Some(bundle) => {
            let age_secs = (now - bundle.built_at).num_seconds().max(0) as u64;
            let bundle_stale = age_secs > state.staleness_threshold.as_secs();
            let stream_stale = !stream_status.connected
                && stream_status
                    .last_event_at
                    .map(|t| (now - t).num_seconds() as u64 > state.reconcile_interval.as_secs())
                    .unwrap_or(false);
            let status = if bundle_stale || stream_stale { "degraded" } else { "healthy" };
            (status, bundle.revision.clone(), Some(age_secs))
        }
    };

    let http_status = if status == "initializing" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthBody {
        status,
        revision,
        bundle_age_seconds,
        sse_connected: stream_status.connected,
        last_sse_event_at: stream_status.last_event_at,
        rebuild_count,
        rebuild_error_count,
        staleness_threshold_seconds: state.staleness_threshold.as_secs(),
    };

    (http_status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use govplane_authority::AuthorityClient;
    use http_body_util::BodyExt;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn test_state() -> Arc<DistributionState> {
        let tokens = Arc::new(govplane_auth::TokenCache::new(
            "http://localhost:0",
            "r",
            "c",
            "u",
            "p",
        ));
        let authority = Arc::new(AuthorityClient::new("http://localhost:0", tokens));
        let trigger = Arc::new(Notify::new());
        let rebuild = Arc::new(RebuildCoordinator::new(authority.clone(), trigger.clone(), Duration::from_secs(30)));
        let stream = Arc::new(EventStreamConsumer::new(authority, trigger, None, None));
        Arc::new(DistributionState {
            bundle_name: "mcp".to_string(),
            staleness_threshold: Duration::from_secs(90),
            reconcile_interval: Duration::from_secs(30),
            rebuild,
            stream,
        })
    }

    #[tokio::test]
    async fn bundle_not_ready_returns_503() {
        let app = build_app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/bundles/mcp/data.tar.gz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_bundle_name_returns_404() {
        let app = build_app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/bundles/other/data.tar.gz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_is_initializing_before_first_build() {
        let app = build_app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "initializing");
    }

    #[tokio::test]
    async fn bundle_served_after_rebuild_honors_if_none_match() {
        let state = test_state();
        state.rebuild.served_bundle().write().await.replace(govplane_rebuild::ServedBundle {
            bytes: b"fake-gzip".to_vec(),
            etag: "\"abc123\"".to_string(),
            revision: "abc123".to_string(),
            built_at: Utc::now(),
        });
        let app = build_app(state);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/bundles/mcp/data.tar.gz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::ETAG).unwrap(), "\"abc123\"");

        let resp2 = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/bundles/mcp/data.tar.gz")
                    .header(header::IF_NONE_MATCH, "\"abc123\"")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp2.status(), StatusCode::NOT_MODIFIED);
    }
}
