// SPDX-License-Identifier: MIT OR Apache-2.0
//! Assembles the control plane's shared context and runs its background
//! tasks and HTTP surfaces to completion.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use govplane_auth::TokenCache;
use govplane_authority::AuthorityClient;
use govplane_config::ControlPlaneConfig;
use govplane_constraints::ConstraintCache;
use govplane_distribution::DistributionState;
use govplane_evaluator::EvaluatorState;
use govplane_events::EventStreamConsumer;
use govplane_rebuild::RebuildCoordinator;
use govplane_replay::ReplayWorker;
use tokio::sync::Notify;
use tracing::info;

/// Everything a running control plane process needs, assembled once in
/// `main` and shared by `Arc` clone into every spawned task.
pub struct AppContext {
    /// The configuration this context was built from.
    pub config: ControlPlaneConfig,
    /// REST client for the policy authority.
    pub authority: Arc<AuthorityClient>,
    /// Rebuild coordinator; owns the served bundle.
    pub rebuild: Arc<RebuildCoordinator>,
    /// Event-stream consumer; owns connectivity status.
    pub events: Arc<EventStreamConsumer>,
    /// Constraint cache, refreshed independently of request handling.
    pub constraints: Arc<ConstraintCache>,
    /// Replay worker, present only when replay is enabled in configuration.
    pub replay: Option<Arc<ReplayWorker>>,
}

impl AppContext {
    /// Build the shared context from configuration. Performs no I/O; all
    /// network calls happen once the background tasks are spawned.
    pub fn build(config: ControlPlaneConfig) -> Self {
        let tokens = Arc::new(TokenCache::new(
            config.idp_url.clone(),
            config.idp_realm.clone(),
            config.idp_client_id.clone(),
            config.gateway_username.clone(),
            config.gateway_password.clone(),
        ));
        let authority = Arc::new(AuthorityClient::new(config.authority_url.clone(), tokens));

        let rebuild_trigger = Arc::new(Notify::new());
        let rebuild = Arc::new(RebuildCoordinator::new(
            authority.clone(),
            rebuild_trigger.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        ));

        let replay_trigger: Option<Arc<Notify>> =
            config.replay_enabled.then(|| Arc::new(Notify::new()));

        let events = Arc::new(EventStreamConsumer::new(
            authority.clone(),
            rebuild_trigger,
            replay_trigger.clone(),
            Some(rebuild.last_event_id_handle()),
        ));

        let constraints = Arc::new(ConstraintCache::new(authority.clone()));

        let replay = replay_trigger.map(|trigger| {
            Arc::new(ReplayWorker::new(
                authority.clone(),
                config.replay_backends.clone(),
                trigger,
                Duration::from_secs(config.replay_poll_interval_secs),
            ))
        });

        Self {
            config,
            authority,
            rebuild,
            events,
            constraints,
            replay,
        }
    }
}

/// Spawn every background task and both HTTP surfaces, then run until
/// either a server exits or the process receives a termination signal.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    tokio::spawn({
        let events = ctx.events.clone();
        async move { events.run().await }
    });
    tokio::spawn({
        let rebuild = ctx.rebuild.clone();
        async move { rebuild.run_reconciler().await }
    });
    tokio::spawn({
        let rebuild = ctx.rebuild.clone();
        async move { rebuild.run_rebuild_loop().await }
    });
    tokio::spawn({
        let constraints = ctx.constraints.clone();
        let interval = Duration::from_secs(ctx.config.constraint_cache_refresh_secs);
        async move { constraints.run_refresh_loop(interval).await }
    });
    if let Some(replay) = ctx.replay.clone() {
        tokio::spawn(async move { replay.run().await });
    }

    let distribution_state = Arc::new(DistributionState {
        bundle_name: ctx.config.bundle_name.clone(),
        staleness_threshold: Duration::from_secs(ctx.config.staleness_threshold_secs),
        reconcile_interval: Duration::from_secs(ctx.config.reconcile_interval_secs),
        rebuild: ctx.rebuild.clone(),
        stream: ctx.events.clone(),
    });
    let distribution_app = govplane_distribution::build_app(distribution_state);
    let distribution_listener = tokio::net::TcpListener::bind(("0.0.0.0", ctx.config.distribution_port))
        .await
        .with_context(|| format!("bind distribution server on port {}", ctx.config.distribution_port))?;
    info!(port = ctx.config.distribution_port, "distribution server listening");

    let evaluator_state = Arc::new(EvaluatorState {
        authority: ctx.authority.clone(),
        cache: ctx.constraints.clone(),
    });
    let evaluator_app = govplane_evaluator::build_app(evaluator_state);
    let evaluator_listener = tokio::net::TcpListener::bind(("0.0.0.0", ctx.config.evaluator_port))
        .await
        .with_context(|| format!("bind evaluator server on port {}", ctx.config.evaluator_port))?;
    info!(port = ctx.config.evaluator_port, "evaluator server listening");

    tokio::select! {
        result = axum::serve(distribution_listener, distribution_app) => {
            result.context("distribution server exited")?;
        }
        result = axum::serve(evaluator_listener, evaluator_app) => {
            result.context("evaluator server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
