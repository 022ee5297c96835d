// crates/sentinel-gate-core/src/error.rs
// ============================================================================
// Module: Pipeline Error Taxonomy
// Description: Structured errors produced by the interceptor chain.
// Purpose: Distinguish client-visible denials from sanitized internal errors.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! The chain surfaces exactly two shapes to a client: a structured denial
//! (policy, outbound, approval, quarantine, scanner) and a sanitized internal
//! error. Raw internal detail is recorded in the audit stream only.
//!
//! Security posture: error text crosses the trust boundary; internal variants
//! must never leak upstream error bodies, hostnames, or credentials; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ids::RuleId;

// ============================================================================
// SECTION: Denial
// ============================================================================

/// Machine-readable denial code.
///
/// # Invariants
/// - Variants are stable for clients and hook scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    /// A policy rule denied the action.
    PolicyDenied,
    /// No policy rule matched the action.
    NoMatchingRule,
    /// An outbound rule blocked the destination.
    OutboundBlocked,
    /// An administrator rejected the approval request.
    ApprovalDenied,
    /// The approval request expired with `timeout_action = deny`.
    ApprovalTimeout,
    /// The pending-approval store was full and evicted this request.
    ApprovalOverflow,
    /// The target tool is quarantined.
    ToolQuarantined,
    /// The response scanner blocked the reply in enforce mode.
    ResponseBlocked,
    /// No upstream owns the requested tool.
    UnknownTool,
    /// The request failed shape or size validation.
    Validation,
}

impl DenialCode {
    /// Returns the stable wire label for the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolicyDenied => "policy_denied",
            Self::NoMatchingRule => "no_matching_rule",
            Self::OutboundBlocked => "outbound_blocked",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalOverflow => "approval_overflow",
            Self::ToolQuarantined => "tool_quarantined",
            Self::ResponseBlocked => "response_blocked",
            Self::UnknownTool => "unknown_tool",
            Self::Validation => "validation",
        }
    }
}

/// Structured, client-visible denial.
///
/// # Invariants
/// - `reason` is safe to show to the caller.
/// - `rule_id`/`rule_name` are set when a specific rule produced the denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// Machine-readable code.
    pub code: DenialCode,
    /// Identifier of the rule that produced the denial, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    /// Name of the rule that produced the denial, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// Operator-authored help text for remediation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

impl Denial {
    /// Creates a denial with a code and reason only.
    #[must_use]
    pub fn new(code: DenialCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            rule_id: None,
            rule_name: None,
            reason: reason.into(),
            help_text: None,
        }
    }

    /// Attaches the originating rule.
    #[must_use]
    pub fn with_rule(mut self, rule_id: RuleId, rule_name: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id);
        self.rule_name = Some(rule_name.into());
        self
    }

    /// Attaches operator help text.
    #[must_use]
    pub fn with_help(mut self, help_text: impl Into<String>) -> Self {
        self.help_text = Some(help_text.into());
        self
    }
}

// ============================================================================
// SECTION: Gate Error
// ============================================================================

/// Errors produced while processing one action through the chain.
///
/// # Invariants
/// - `Denied`, `RateLimited`, and `Unauthenticated` are client-visible.
/// - `Internal` and `Timeout` are sanitized before reaching clients; the raw
///   message goes to audit only.
#[derive(Debug, Error)]
pub enum GateError {
    /// Structured denial (policy, outbound, approval, quarantine, scanner).
    #[error("denied: {}", .0.reason)]
    Denied(Denial),
    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Duration after which the caller may retry.
        retry_after: Duration,
    },
    /// Authentication failed. The message is uniform on purpose.
    #[error("invalid credentials")]
    Unauthenticated,
    /// Internal failure; the payload is for audit, not for the client.
    #[error("internal error: {0}")]
    Internal(String),
    /// The action exceeded a processing deadline.
    #[error("request timeout")]
    Timeout,
}

impl GateError {
    /// Returns the denial payload when this is a structured denial.
    #[must_use]
    pub const fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(denial) => Some(denial),
            _ => None,
        }
    }

    /// Returns the sanitized message safe to surface to a client.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Denied(denial) => denial.reason.clone(),
            Self::RateLimited {
                ..
            } => "rate limit exceeded".to_string(),
            Self::Unauthenticated => "invalid credentials".to_string(),
            Self::Internal(_) => "Internal error".to_string(),
            Self::Timeout => "Request timeout".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Error taxonomy unit tests.

    use super::*;

    #[test]
    fn internal_errors_are_sanitized_for_clients() {
        let err = GateError::Internal("connect to 10.0.0.5:9000 refused".to_string());
        assert_eq!(err.client_message(), "Internal error");
        let err = GateError::Timeout;
        assert_eq!(err.client_message(), "Request timeout");
    }

    #[test]
    fn denial_builder_attaches_rule_and_help() {
        let denial = Denial::new(DenialCode::PolicyDenied, "writes disabled")
            .with_rule(RuleId::new("r1"), "no-writes")
            .with_help("ask an operator");
        assert_eq!(denial.code.as_str(), "policy_denied");
        assert_eq!(denial.rule_name.as_deref(), Some("no-writes"));
        assert_eq!(denial.help_text.as_deref(), Some("ask an operator"));
    }
}
