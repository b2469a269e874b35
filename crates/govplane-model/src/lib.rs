// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed records for the documents the control plane passes between the
//! authority, the constraint evaluator, and the replay worker.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The policy document served inside a bundle.
///
/// `extra` preserves any top-level key the authority adds that this crate
/// does not yet model explicitly, since the document crosses an opaque
/// authority boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDocument {
    /// Service name -> catalog entry.
    pub catalog: BTreeMap<String, ServiceEntry>,
    /// Ordered access-control rules.
    pub access_rules: Vec<AccessRule>,
    /// Subject identifiers whose access has been revoked.
    pub revoked_subjects: BTreeSet<String>,
    /// Service name -> opaque governance-instance identifier.
    pub governance_instances: BTreeMap<String, String>,
    /// Metadata injected by the bundle builder; absent before the first build.
    #[serde(rename = "_bundle_metadata", skip_serializing_if = "Option::is_none", default)]
    pub bundle_metadata: Option<BundleMetadata>,
    /// Unrecognised top-level keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of [`PolicyDocument::catalog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceEntry {
    /// Whether the service is currently enabled.
    pub enabled: bool,
    /// Tool name -> tag.
    pub tools: BTreeMap<String, ToolTag>,
}

/// The tag attached to a single tool within a [`ServiceEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolTag {
    /// e.g. `"open"` or `"gated"`.
    pub tag: String,
}

/// One entry of [`PolicyDocument::access_rules`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccessRule {
    /// Rule identifier.
    pub id: String,
    /// Subject match predicate.
    pub matcher: Matcher,
    /// What the rule grants when it matches.
    pub allow: AllowSet,
}

/// Subject match predicate for an [`AccessRule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Matcher {
    /// Discriminates how `claims`/`identity` are interpreted.
    #[serde(rename = "matchType")]
    pub match_type: String,
    /// Claim predicate, shape depends on `match_type`.
    #[serde(default)]
    pub claims: serde_json::Value,
    /// Exact subject identifier, when `match_type` names an identity match.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity: Option<String>,
}

/// What an [`AccessRule`] grants when its matcher matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AllowSet {
    /// Granted service names.
    pub services: Vec<String>,
    /// Granted tool names.
    pub tools: Vec<String>,
}

/// Metadata the bundle builder injects into the policy document at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleMetadata {
    /// When the bundle was built, RFC3339 UTC.
    pub built_at: DateTime<Utc>,
    /// The bundle's revision identifier.
    pub revision: String,
    /// The last event id observed before this build, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sse_event_id: Option<String>,
}

/// The manifest entry (`.manifest`) stored alongside `data.json` in a bundle archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleManifest {
    /// The bundle's revision identifier.
    pub revision: String,
    /// Top-level keys present in the policy document, in lexical order.
    pub roots: Vec<String>,
    /// Build metadata.
    pub metadata: BundleManifestMetadata,
}

/// Nested `metadata` object within [`BundleManifest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BundleManifestMetadata {
    /// When the bundle was built, RFC3339 UTC.
    pub built_at: DateTime<Utc>,
}

/// Per-tool constraint configuration, keyed by tool name within a service's
/// governance instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolConfig {
    /// Tool this config applies to.
    #[serde(rename = "toolName")]
    pub tool_name: String,
    /// Whether a passing evaluation still requires forwarding to the authority.
    #[serde(rename = "requiresApproval")]
    pub requires_approval: bool,
    /// Constraints evaluated in declaration order.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// A single constraint within a [`ToolConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    /// Name of the call argument this constraint inspects.
    #[serde(rename = "paramName")]
    pub param_name: String,
    /// How `values` is applied to the argument.
    pub operator: ConstraintOperator,
    /// Operand values; interpretation depends on `operator`.
    pub values: Vec<String>,
    /// Human-readable violation message, used verbatim when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// The operators a [`Constraint`] may apply.
///
/// A closed enum in place of the original's string matching: an unrecognised
/// operator is now a deserialization error at cache-refresh time rather than
/// a silently-skipped constraint at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    /// Deny unless the argument equals one of `values`.
    In,
    /// Deny if the argument equals one of `values`.
    NotIn,
    /// Deny unless the argument contains one of `values` as a substring.
    Contains,
    /// Deny if the argument contains any of `values` as a substring.
    NotContains,
    /// Deny unless the argument matches (search, not full-match) one of `values`.
    Regex,
    /// Deny if the argument's length exceeds `values[0]` parsed as an integer.
    MaxLength,
}

/// A request to evaluate one tool call against governance constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationRequest {
    /// Service the tool belongs to.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Tool being invoked.
    #[serde(rename = "toolName")]
    pub tool_name: String,
    /// Identifier of the calling subject.
    #[serde(rename = "callerIdentity")]
    pub caller_identity: String,
    /// Claims attached to the calling subject.
    #[serde(rename = "callerClaims", default)]
    pub caller_claims: serde_json::Value,
    /// Call arguments, encoded as a JSON text string.
    pub arguments: String,
    /// Session the call belongs to.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// The original JSON-RPC request, encoded as a JSON text string.
    #[serde(rename = "requestPayload")]
    pub request_payload: String,
}

/// The outcome of evaluating an [`EvaluationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// `allow` or `deny`.
    pub decision: DecisionKind,
    /// Authority-assigned request id, empty unless a forward produced one.
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// Human-readable explanation.
    pub message: String,
}

impl Decision {
    /// Build an `allow` decision with no request id.
    pub fn allow(message: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::Allow,
            request_id: String::new(),
            message: message.into(),
        }
    }

    /// Build a `deny` decision with no request id.
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::Deny,
            request_id: String::new(),
            message: message.into(),
        }
    }

    /// True if this decision is `allow`.
    pub fn is_allow(&self) -> bool {
        matches!(self.decision, DecisionKind::Allow)
    }
}

/// The two possible values of [`Decision::decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The call may proceed.
    Allow,
    /// The call must not proceed.
    Deny,
}

/// A queued approval, as returned by the authority's replay-input endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRecord {
    /// Unique identifier of the approval.
    #[serde(rename = "approvalId")]
    pub approval_id: String,
    /// Service the approved call targets.
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none", default)]
    pub service_name: Option<String>,
    /// The stored JSON-RPC request, encoded as a JSON text string.
    #[serde(rename = "requestPayload", skip_serializing_if = "Option::is_none", default)]
    pub request_payload: Option<String>,
    /// Any other authority-supplied fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The result of attempting to replay an [`ApprovalRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    /// The approval this result belongs to.
    #[serde(rename = "approvalId")]
    pub approval_id: String,
    /// `completed` or `failed`.
    #[serde(rename = "execStatus")]
    pub exec_status: ExecStatus,
    /// Backend response text on success, error text on failure.
    #[serde(rename = "execResult")]
    pub exec_result: String,
}

/// The two possible values of [`ExecutionResult::exec_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The backend call succeeded.
    Completed,
    /// The backend call failed, or the approval could not be dispatched.
    Failed,
}

/// A cached bearer token, internal to the token cache only — never serialized
/// over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    /// The bearer token itself.
    pub token: String,
    /// When this token should be considered expired (slack already applied).
    pub expires_at: DateTime<Utc>,
}

/// The identity provider's raw password-grant response body.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityTokenResponse {
    /// The bearer token.
    pub access_token: String,
    /// Token lifetime, in seconds, from the moment of the response.
    pub expires_in: i64,
}
