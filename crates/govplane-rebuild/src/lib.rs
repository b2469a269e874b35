// SPDX-License-Identifier: MIT OR Apache-2.0
//! Debounced, latched rebuild coordinator.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use govplane_authority::AuthorityClient;
use govplane_bundle::build_bundle;
use govplane_error::{ErrorCode, GovError};
use govplane_model::PolicyDocument;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info};

/// How long the rebuild loop waits after a signal to coalesce a burst.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// The kind under which the authority lists the bundle's source singleton.
const POLICY_STORE_KIND: &str = "PolicyStore";

/// The bundle currently served by the distribution HTTP server.
#[derive(Debug, Clone)]
pub struct ServedBundle {
    /// Gzip-compressed tar archive bytes.
    pub bytes: Vec<u8>,
    /// Quoted ETag.
    pub etag: String,
    /// Revision identifier (unquoted).
    pub revision: String,
    /// When this bundle was built.
    pub built_at: DateTime<Utc>,
}

/// Coordinates rebuilds of the served bundle: a latched trigger, a periodic
/// reconciler, and the rebuild cycle itself.
pub struct RebuildCoordinator {
    authority: Arc<AuthorityClient>,
    served: Arc<RwLock<Option<ServedBundle>>>,
    trigger: Arc<Notify>,
    last_event_id: Arc<RwLock<Option<String>>>,
    rebuild_count: AtomicU64,
    rebuild_error_count: AtomicU64,
    reconcile_interval: Duration,
}

impl RebuildCoordinator {
    /// Build a coordinator. `trigger` is shared with the event-stream
    /// consumer so its `state` events can latch a rebuild too.
    pub fn new(
        authority: Arc<AuthorityClient>,
        trigger: Arc<Notify>,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            authority,
            served: Arc::new(RwLock::new(None)),
            trigger,
            last_event_id: Arc::new(RwLock::new(None)),
            rebuild_count: AtomicU64::new(0),
            rebuild_error_count: AtomicU64::new(0),
            reconcile_interval,
        }
    }

    /// Shared handle to the currently served bundle, for the distribution
    /// HTTP server to read.
    pub fn served_bundle(&self) -> Arc<RwLock<Option<ServedBundle>>> {
        self.served.clone()
    }

    /// Shared handle the event-stream consumer writes the last-observed
    /// event id into; each rebuild embeds its current value in the bundle
    /// metadata.
    pub fn last_event_id_handle(&self) -> Arc<RwLock<Option<String>>> {
        self.last_event_id.clone()
    }

    /// Current (rebuild_count, rebuild_error_count).
    pub fn counters(&self) -> (u64, u64) {
        (
            self.rebuild_count.load(Ordering::Relaxed),
            self.rebuild_error_count.load(Ordering::Relaxed),
        )
    }

    /// Periodically set the trigger unconditionally, ensuring eventual
    /// rebuilds regardless of event delivery.
    pub async fn run_reconciler(&self) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        loop {
            ticker.tick().await;
            self.trigger.notify_one();
        }
    }

    /// Observe the trigger, debounce, and perform rebuild cycles forever.
    pub async fn run_rebuild_loop(&self) {
        loop {
            self.trigger.notified().await;
            tokio::time::sleep(DEBOUNCE).await;
            // Discard any signal that arrived during the debounce sleep —
            // it is already covered by the rebuild we are about to run.
            let _ = self.trigger.notified().now_or_never();

            if let Err(err) = self.rebuild_once().await {
                self.rebuild_error_count.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "rebuild failed, continuing to serve last-good bundle");
            }
        }
    }

    /// Fetch fresh data, build a new revision, and swap it in if different
    /// from (or absent relative to) what's currently served.
    pub async fn rebuild_once(&self) -> Result<(), GovError> {
        let store_id = self.authority.find_singleton(POLICY_STORE_KIND).await?;
        let document = match store_id {
            Some(store_id) => self.authority.fetch_bundle_data(&store_id).await?,
            None => {
                info!("no policy store singleton registered, publishing empty document");
                PolicyDocument {
                    catalog: BTreeMap::new(),
                    access_rules: Vec::new(),
                    revoked_subjects: BTreeSet::new(),
                    governance_instances: BTreeMap::new(),
                    bundle_metadata: None,
                    extra: serde_json::Map::new(),
                }
            }
        };

        let previous = self.served.read().await.clone();
        let last_event_id = self.last_event_id.read().await.clone();
        let built_at = Utc::now();
        let built = build_bundle(&document, built_at, last_event_id.as_deref())
            .map_err(|e| GovError::new(ErrorCode::BundleBuildFailed, "building bundle").with_source(e))?;

        let changed = previous.as_ref().map(|p| p.revision != built.revision).unwrap_or(true);
        let new_bundle = ServedBundle {
            bytes: built.bytes,
            etag: built.etag,
            revision: built.revision.clone(),
            built_at,
        };

        *self.served.write().await = Some(new_bundle);
        self.rebuild_count.fetch_add(1, Ordering::Relaxed);

        info!(
            previous_revision = previous.as_ref().map(|p| p.revision.as_str()).unwrap_or(""),
            new_revision = %built.revision,
            changed,
            "bundle rebuilt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authority_with(server: &MockServer) -> Arc<AuthorityClient> {
        let token_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 300,
            })))
            .mount(&token_server)
            .await;
        let tokens = Arc::new(govplane_auth::TokenCache::new(token_server.uri(), "r", "c", "u", "p"));
        Arc::new(AuthorityClient::new(server.uri(), tokens))
    }

    #[tokio::test]
    async fn rebuild_once_populates_served_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/PolicyStore/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"@id": "store-1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/PolicyStore/store-1/fetchBundleData"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "catalog": {},
                "access_rules": [],
                "revoked_subjects": [],
                "governance_instances": {},
            })))
            .mount(&server)
            .await;

        let authority = authority_with(&server).await;
        let coordinator =
            RebuildCoordinator::new(authority, Arc::new(Notify::new()), Duration::from_secs(30));

        coordinator.rebuild_once().await.unwrap();
        let served = coordinator.served_bundle();
        assert!(served.read().await.is_some());
        assert_eq!(coordinator.counters(), (1, 0));
    }

    #[tokio::test]
    async fn rebuild_once_serves_empty_bundle_when_no_store_registered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/PolicyStore/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;

        let authority = authority_with(&server).await;
        let coordinator =
            RebuildCoordinator::new(authority, Arc::new(Notify::new()), Duration::from_secs(30));

        coordinator.rebuild_once().await.unwrap();
        let served = coordinator.served_bundle();
        let guard = served.read().await;
        assert!(guard.is_some());
        assert_eq!(coordinator.counters(), (1, 0));
    }
}
