// SPDX-License-Identifier: MIT OR Apache-2.0
//! Constraint cache and pure constraint evaluation for the evaluator service.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use govplane_authority::AuthorityClient;
use govplane_model::{Constraint, ConstraintOperator, ToolConfig};
use regex::Regex;
use serde_json::Value;
use tracing::{error, info, warn};

/// A constraint with its `regex` patterns (if any) pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledConstraint {
    /// Argument name this constraint applies to.
    pub param_name: String,
    /// The comparison operator.
    pub operator: ConstraintOperator,
    /// Raw operator operands, as declared by the authority.
    pub values: Vec<String>,
    /// Human-readable violation message, when the authority supplied one.
    pub description: Option<String>,
    patterns: Vec<Regex>,
}

impl CompiledConstraint {
    fn compile(c: &Constraint, tool_name: &str) -> Self {
        let patterns = if c.operator == ConstraintOperator::Regex {
            c.values
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(tool_name, pattern, error = %e, "skipping unparseable constraint regex");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            param_name: c.param_name.clone(),
            operator: c.operator,
            values: c.values.clone(),
            description: c.description.clone(),
            patterns,
        }
    }
}

/// A [`ToolConfig`] with its constraints pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledToolConfig {
    /// Tool this configuration governs.
    pub tool_name: String,
    /// Whether a constraint-passing request still needs authority approval.
    pub requires_approval: bool,
    /// Constraints in authority-declared order; evaluated in that order.
    pub constraints: Vec<CompiledConstraint>,
}

/// One governance instance's worth of tool configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Governance instance identifier at the authority.
    pub instance_id: String,
    /// Tool configs, keyed by tool name.
    pub tool_configs: BTreeMap<String, CompiledToolConfig>,
}

/// Outcome of evaluating a tool's constraints against a set of arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintOutcome {
    /// Every constraint was satisfied (or not applicable).
    Passed,
    /// A constraint was violated; carries the message to surface to the caller.
    Violated(String),
}

/// Evaluate a tool's constraints, in declaration order, against `arguments`.
///
/// The first violation short-circuits the remaining constraints, matching the
/// authority's own fail-fast evaluation order.
pub fn evaluate_tool_config(
    tool_config: &CompiledToolConfig,
    arguments: &serde_json::Map<String, Value>,
) -> ConstraintOutcome {
    for constraint in &tool_config.constraints {
        let Some(arg_value) = arguments.get(&constraint.param_name) else {
            continue;
        };
        let text = coerce_to_text(arg_value);

        let violation = match constraint.operator {
            ConstraintOperator::In => (!constraint.values.iter().any(|v| v == &text)).then(|| {
                format!(
                    "'{}' value '{text}' not in allowed list {:?}",
                    constraint.param_name, constraint.values
                )
            }),
            ConstraintOperator::NotIn => constraint.values.iter().any(|v| v == &text).then(|| {
                format!("'{}' value '{text}' is in blocked list", constraint.param_name)
            }),
            ConstraintOperator::Contains => (!constraint.values.iter().any(|v| text.contains(v.as_str())))
                .then(|| format!("'{}' must contain one of {:?}", constraint.param_name, constraint.values)),
            ConstraintOperator::NotContains => {
                let found: Vec<&String> = constraint
                    .values
                    .iter()
                    .filter(|v| text.contains(v.as_str()))
                    .collect();
                (!found.is_empty())
                    .then(|| format!("'{}' must not contain {:?}", constraint.param_name, found))
            }
            ConstraintOperator::Regex => (!constraint.patterns.iter().any(|re| re.is_match(&text)))
                .then(|| format!("'{}' does not match any allowed pattern", constraint.param_name)),
            ConstraintOperator::MaxLength => {
                let max_len: usize = constraint
                    .values
                    .first()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                (text.len() > max_len).then(|| {
                    format!(
                        "'{}' length {} exceeds max {max_len}",
                        constraint.param_name,
                        text.len()
                    )
                })
            }
        };

        if let Some(detail) = violation {
            let message = match &constraint.description {
                Some(desc) => format!("Constraint violated: {desc}"),
                None => format!("Constraint violated: {detail}"),
            };
            return ConstraintOutcome::Violated(message);
        }
    }
    ConstraintOutcome::Passed
}

fn coerce_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Periodically-refreshed snapshot of constraint configuration across all
/// governance instances, keyed by service name.
///
/// Readers clone the `Arc` pointer rather than the map itself; the refresher
/// replaces the whole snapshot atomically, never merging partial state in.
pub struct ConstraintCache {
    authority: Arc<AuthorityClient>,
    state: tokio::sync::RwLock<Arc<BTreeMap<String, ServiceConfig>>>,
}

impl ConstraintCache {
    /// Build an empty cache. Call [`ConstraintCache::refresh`] (or
    /// [`ConstraintCache::run_refresh_loop`]) to populate it.
    pub fn new(authority: Arc<AuthorityClient>) -> Self {
        Self {
            authority,
            state: tokio::sync::RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Current snapshot. Cheap: clones an `Arc`, not the map.
    pub async fn snapshot(&self) -> Arc<BTreeMap<String, ServiceConfig>> {
        self.state.read().await.clone()
    }

    /// Number of services currently cached.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    /// Rebuild the snapshot from scratch. Services whose tool-config fetch
    /// fails are dropped from the new snapshot with a warning rather than
    /// failing the whole refresh.
    pub async fn refresh(&self) {
        let instances = match self.authority.discover_governance_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "constraint cache refresh failed: could not discover governance instances");
                return;
            }
        };

        let mut new_cache = BTreeMap::new();
        for (service_name, instance_id) in instances {
            match self.authority.get_tool_configs(&instance_id).await {
                Ok(tool_configs) => {
                    let compiled = tool_configs
                        .into_iter()
                        .map(|tc| compile_tool_config(&tc))
                        .map(|tc| (tc.tool_name.clone(), tc))
                        .collect::<BTreeMap<_, _>>();
                    new_cache.insert(
                        service_name,
                        ServiceConfig {
                            instance_id,
                            tool_configs: compiled,
                        },
                    );
                }
                Err(e) => {
                    warn!(service_name, error = %e, "failed to fetch tool configs, dropping service from cache");
                }
            }
        }

        let tool_count: usize = new_cache.values().map(|s| s.tool_configs.len()).sum();
        info!(
            services = new_cache.len(),
            tool_configs = tool_count,
            "constraint cache refreshed"
        );
        *self.state.write().await = Arc::new(new_cache);
    }

    /// Refresh once immediately, then every `interval`, forever.
    pub async fn run_refresh_loop(&self, interval: Duration) {
        self.refresh().await;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }
}

fn compile_tool_config(tc: &ToolConfig) -> CompiledToolConfig {
    CompiledToolConfig {
        tool_name: tc.tool_name.clone(),
        requires_approval: tc.requires_approval,
        constraints: tc
            .constraints
            .iter()
            .map(|c| CompiledConstraint::compile(c, &tc.tool_name))
            .collect(),
    }
}
