//! Unified error taxonomy with stable error codes for the policy control plane.
//!
//! Every control-plane error carries an [`ErrorCode`] (a machine-readable,
//! stable string tag), a human-readable message, an optional cause chain,
//! and arbitrary key-value context. Use the builder returned by
//! [`GovError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Identity-provider token acquisition errors.
    Authentication,
    /// Authority REST/event-stream errors.
    Authority,
    /// Bundle canonicalization, hashing, or archive errors.
    Bundle,
    /// Constraint cache or evaluation errors.
    Evaluation,
    /// Replay/backend execution errors.
    Replay,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::Authority => "authority",
            Self::Bundle => "bundle",
            Self::Evaluation => "evaluation",
            Self::Replay => "replay",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Authentication --
    /// The identity provider rejected the password grant.
    AuthenticationFailed,
    /// The identity provider could not be reached.
    AuthenticationUnreachable,

    // -- Authority --
    /// The authority could not be reached (network error, timeout).
    AuthorityUnreachable,
    /// The authority returned a 4xx/5xx the client cannot retry past.
    AuthorityRejected,
    /// The authority's response body did not parse as the expected shape.
    AuthorityMalformed,

    // -- Bundle --
    /// The policy document could not be canonicalized or hashed.
    BundleBuildFailed,
    /// The served bundle has not been built yet.
    BundleNotReady,

    // -- Evaluation --
    /// No governance instance is cached for the requested service.
    EvaluationNoGovernance,
    /// Evaluation could not complete and was resolved fail-closed.
    EvaluationFailClosed,
    /// The evaluation request body was malformed.
    EvaluationBadRequest,

    // -- Replay --
    /// The approval's service has no configured backend.
    ReplayNoBackend,
    /// The stored request payload was not valid JSON.
    ReplayMalformedPayload,
    /// The backend MCP server failed the handshake or call.
    ReplayBackendFailed,

    // -- Config --
    /// Configuration value is invalid or missing.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationFailed | Self::AuthenticationUnreachable => {
                ErrorCategory::Authentication
            }

            Self::AuthorityUnreachable | Self::AuthorityRejected | Self::AuthorityMalformed => {
                ErrorCategory::Authority
            }

            Self::BundleBuildFailed | Self::BundleNotReady => ErrorCategory::Bundle,

            Self::EvaluationNoGovernance
            | Self::EvaluationFailClosed
            | Self::EvaluationBadRequest => ErrorCategory::Evaluation,

            Self::ReplayNoBackend | Self::ReplayMalformedPayload | Self::ReplayBackendFailed => {
                ErrorCategory::Replay
            }

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"AUTHORITY_UNREACHABLE"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AuthenticationUnreachable => "AUTHENTICATION_UNREACHABLE",
            Self::AuthorityUnreachable => "AUTHORITY_UNREACHABLE",
            Self::AuthorityRejected => "AUTHORITY_REJECTED",
            Self::AuthorityMalformed => "AUTHORITY_MALFORMED",
            Self::BundleBuildFailed => "BUNDLE_BUILD_FAILED",
            Self::BundleNotReady => "BUNDLE_NOT_READY",
            Self::EvaluationNoGovernance => "EVALUATION_NO_GOVERNANCE",
            Self::EvaluationFailClosed => "EVALUATION_FAIL_CLOSED",
            Self::EvaluationBadRequest => "EVALUATION_BAD_REQUEST",
            Self::ReplayNoBackend => "REPLAY_NO_BACKEND",
            Self::ReplayMalformedPayload => "REPLAY_MALFORMED_PAYLOAD",
            Self::ReplayBackendFailed => "REPLAY_BACKEND_FAILED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GovError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use govplane_error::{GovError, ErrorCode};
///
/// let err = GovError::new(ErrorCode::AuthorityUnreachable, "connect timed out")
///     .with_context("base_url", "https://authority.internal")
///     .with_context("timeout_ms", 10_000);
/// ```
pub struct GovError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl GovError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for GovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("GovError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for GovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for GovError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_construction() {
        let err = GovError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = GovError::new(ErrorCode::AuthorityUnreachable, "connect timed out");
        assert_eq!(err.to_string(), "[AUTHORITY_UNREACHABLE] connect timed out");
    }

    #[test]
    fn display_with_context() {
        let err = GovError::new(ErrorCode::ReplayBackendFailed, "handshake failed")
            .with_context("service", "gmail");
        let s = err.to_string();
        assert!(s.starts_with("[REPLAY_BACKEND_FAILED] handshake failed"));
        assert!(s.contains("gmail"));
    }

    #[test]
    fn categories_partition_codes() {
        assert_eq!(
            ErrorCode::EvaluationNoGovernance.category(),
            ErrorCategory::Evaluation
        );
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
    }

    #[test]
    fn code_round_trips_through_str() {
        assert_eq!(ErrorCode::BundleNotReady.as_str(), "BUNDLE_NOT_READY");
        assert_eq!(ErrorCode::BundleNotReady.to_string(), "BUNDLE_NOT_READY");
    }
}
