// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation for the MCP policy control plane.
//!
//! This crate provides [`ControlPlaneConfig`] — the top-level runtime
//! settings — loaded entirely from environment variables with safe
//! defaults, together with [`ConfigWarning`]s for advisory issues that do
//! not prevent startup.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong type.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// Name of the offending environment variable.
        var: String,
        /// Human-readable parse failure detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The replay worker is enabled but no backend map was configured.
    ReplayEnabledWithoutBackends,
    /// The staleness threshold is not a multiple of the reconcile interval.
    StalenessBelowReconcileInterval {
        /// Configured staleness threshold, in seconds.
        staleness_secs: u64,
        /// Configured reconcile interval, in seconds.
        reconcile_secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ReplayEnabledWithoutBackends => {
                write!(f, "replay is enabled but GOVPLANE_REPLAY_BACKENDS is empty")
            }
            ConfigWarning::StalenessBelowReconcileInterval {
                staleness_secs,
                reconcile_secs,
            } => write!(
                f,
                "staleness threshold ({staleness_secs}s) is not comfortably above the reconcile interval ({reconcile_secs}s); health may flap"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the policy control plane.
///
/// Every field has a safe default so the daemon can start with zero
/// configuration against a local authority and identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Base URL of the policy authority.
    pub authority_url: String,
    /// Base URL of the identity provider.
    pub idp_url: String,
    /// Identity provider realm.
    pub idp_realm: String,
    /// OAuth client id used for the password grant.
    pub idp_client_id: String,
    /// Gateway service-account username.
    pub gateway_username: String,
    /// Gateway service-account password.
    pub gateway_password: String,
    /// Port the distribution HTTP server binds.
    pub distribution_port: u16,
    /// Port the constraint evaluator HTTP server binds.
    pub evaluator_port: u16,
    /// Reconciler interval, in seconds.
    pub reconcile_interval_secs: u64,
    /// `/health` degrades to `degraded` once the bundle is older than this.
    pub staleness_threshold_secs: u64,
    /// Constraint cache refresh interval, in seconds.
    pub constraint_cache_refresh_secs: u64,
    /// Whether the replay worker runs at all.
    pub replay_enabled: bool,
    /// serviceName -> backend base URL.
    pub replay_backends: BTreeMap<String, String>,
    /// Replay poll interval, in seconds, used when no trigger fires first.
    pub replay_poll_interval_secs: u64,
    /// Bundle name segment in `/bundles/<name>/data.tar.gz`.
    pub bundle_name: String,
    /// `tracing_subscriber::EnvFilter` base directive.
    pub log_level: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            authority_url: "http://localhost:12000".to_string(),
            idp_url: "http://localhost:11000".to_string(),
            idp_realm: "mcpgateway".to_string(),
            idp_client_id: "mcpgateway".to_string(),
            gateway_username: "gateway".to_string(),
            gateway_password: "Welcome123".to_string(),
            distribution_port: 8282,
            evaluator_port: 8090,
            reconcile_interval_secs: 30,
            staleness_threshold_secs: 90,
            constraint_cache_refresh_secs: 30,
            replay_enabled: false,
            replay_backends: BTreeMap::new(),
            replay_poll_interval_secs: 5,
            bundle_name: "mcp".to_string(),
            log_level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Load a [`ControlPlaneConfig`] from the process environment, starting from
/// [`ControlPlaneConfig::default`] and overriding each field whose variable
/// is set.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if a numeric or JSON-shaped
/// variable fails to parse.
pub fn load_from_env() -> Result<ControlPlaneConfig, ConfigError> {
    let mut config = ControlPlaneConfig::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply environment variable overrides onto an existing config.
///
/// Recognised variables: `GOVPLANE_AUTHORITY_URL`, `GOVPLANE_IDP_URL`,
/// `GOVPLANE_IDP_REALM`, `GOVPLANE_IDP_CLIENT_ID`,
/// `GOVPLANE_GATEWAY_USERNAME`, `GOVPLANE_GATEWAY_PASSWORD`,
/// `GOVPLANE_DISTRIBUTION_PORT`, `GOVPLANE_EVALUATOR_PORT`,
/// `GOVPLANE_RECONCILE_INTERVAL_SECS`, `GOVPLANE_STALENESS_THRESHOLD_SECS`,
/// `GOVPLANE_CONSTRAINT_CACHE_REFRESH_SECS`, `GOVPLANE_REPLAY_ENABLED`,
/// `GOVPLANE_REPLAY_BACKENDS` (JSON object), `GOVPLANE_REPLAY_POLL_INTERVAL_SECS`,
/// `GOVPLANE_BUNDLE_NAME`, `GOVPLANE_LOG_LEVEL`.
pub fn apply_env_overrides(config: &mut ControlPlaneConfig) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var("GOVPLANE_AUTHORITY_URL") {
        config.authority_url = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_IDP_URL") {
        config.idp_url = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_IDP_REALM") {
        config.idp_realm = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_IDP_CLIENT_ID") {
        config.idp_client_id = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_GATEWAY_USERNAME") {
        config.gateway_username = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_GATEWAY_PASSWORD") {
        config.gateway_password = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_DISTRIBUTION_PORT") {
        config.distribution_port = parse_env("GOVPLANE_DISTRIBUTION_PORT", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_EVALUATOR_PORT") {
        config.evaluator_port = parse_env("GOVPLANE_EVALUATOR_PORT", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_RECONCILE_INTERVAL_SECS") {
        config.reconcile_interval_secs = parse_env("GOVPLANE_RECONCILE_INTERVAL_SECS", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_STALENESS_THRESHOLD_SECS") {
        config.staleness_threshold_secs = parse_env("GOVPLANE_STALENESS_THRESHOLD_SECS", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_CONSTRAINT_CACHE_REFRESH_SECS") {
        config.constraint_cache_refresh_secs =
            parse_env("GOVPLANE_CONSTRAINT_CACHE_REFRESH_SECS", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_REPLAY_ENABLED") {
        config.replay_enabled = parse_env("GOVPLANE_REPLAY_ENABLED", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_REPLAY_BACKENDS") {
        config.replay_backends =
            serde_json::from_str(&val).map_err(|e| ConfigError::InvalidValue {
                var: "GOVPLANE_REPLAY_BACKENDS".to_string(),
                reason: e.to_string(),
            })?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_REPLAY_POLL_INTERVAL_SECS") {
        config.replay_poll_interval_secs =
            parse_env("GOVPLANE_REPLAY_POLL_INTERVAL_SECS", &val)?;
    }
    if let Ok(val) = std::env::var("GOVPLANE_BUNDLE_NAME") {
        config.bundle_name = val;
    }
    if let Ok(val) = std::env::var("GOVPLANE_LOG_LEVEL") {
        config.log_level = val;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &str, val: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a loaded configuration, returning advisory warnings.
///
/// Hard errors (zero-valued intervals, empty URLs, unknown log level) come
/// back as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
pub fn validate_config(config: &ControlPlaneConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.authority_url.trim().is_empty() {
        errors.push("authority_url must not be empty".into());
    }
    if config.idp_url.trim().is_empty() {
        errors.push("idp_url must not be empty".into());
    }
    if config.bundle_name.trim().is_empty() {
        errors.push("bundle_name must not be empty".into());
    }
    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }
    if config.reconcile_interval_secs == 0 {
        errors.push("reconcile_interval_secs must be > 0".into());
    }
    if config.constraint_cache_refresh_secs == 0 {
        errors.push("constraint_cache_refresh_secs must be > 0".into());
    }
    if config.replay_poll_interval_secs == 0 {
        errors.push("replay_poll_interval_secs must be > 0".into());
    }
    if config.distribution_port == config.evaluator_port {
        errors.push("distribution_port and evaluator_port must differ".into());
    }

    if config.replay_enabled && config.replay_backends.is_empty() {
        warnings.push(ConfigWarning::ReplayEnabledWithoutBackends);
    }
    if config.staleness_threshold_secs < config.reconcile_interval_secs * 2 {
        warnings.push(ConfigWarning::StalenessBelowReconcileInterval {
            staleness_secs: config.staleness_threshold_secs,
            reconcile_secs: config.reconcile_interval_secs,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        let warnings = validate_config(&config).expect("defaults should validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = ControlPlaneConfig::default();
        config.log_level = "verbose".to_string();
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("log_level")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_matching_ports() {
        let mut config = ControlPlaneConfig::default();
        config.evaluator_port = config.distribution_port;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn warns_on_replay_enabled_without_backends() {
        let mut config = ControlPlaneConfig::default();
        config.replay_enabled = true;
        let warnings = validate_config(&config).expect("still valid");
        assert!(
            warnings.contains(&ConfigWarning::ReplayEnabledWithoutBackends)
        );
    }

    #[test]
    #[allow(unsafe_code)]
    fn parses_replay_backends_json() {
        // SAFETY: tests run single-threaded for env mutation via serial execution
        // within this module; no other test in this file touches this variable.
        unsafe {
            std::env::set_var(
                "GOVPLANE_REPLAY_BACKENDS",
                r#"{"gmail":"http://localhost:9001"}"#,
            );
        }
        let mut config = ControlPlaneConfig::default();
        apply_env_overrides(&mut config).expect("should parse");
        unsafe {
            std::env::remove_var("GOVPLANE_REPLAY_BACKENDS");
        }
        assert_eq!(
            config.replay_backends.get("gmail").map(String::as_str),
            Some("http://localhost:9001")
        );
    }
}
