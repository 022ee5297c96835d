// crates/sentinel-gate-core/src/interceptors/policy.rs
// ============================================================================
// Module: Policy Stage
// Description: Runs the CEL policy evaluator for the action.
// Purpose: Deny, allow, or defer to the approval gate.
// Dependencies: crate::policy
// ============================================================================

//! ## Overview
//! The decision is recorded in the context for the audit and approval stages.
//! `approval_required` decisions continue down the chain; the approval stage
//! is the next one and takes over; plain denials stop here.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::Denial;
use crate::error::DenialCode;
use crate::error::GateError;
use crate::policy::PolicyError;
use crate::policy::PolicyEvaluator;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage running policy evaluation.
pub struct PolicyInterceptor {
    /// Shared evaluator.
    evaluator: Arc<PolicyEvaluator>,
}

impl PolicyInterceptor {
    /// Creates the stage over the shared evaluator.
    #[must_use]
    pub fn new(evaluator: Arc<PolicyEvaluator>) -> Self {
        Self {
            evaluator,
        }
    }
}

#[async_trait]
impl Interceptor for PolicyInterceptor {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        let session = cx.session();
        let decision = self
            .evaluator
            .evaluate(&action, session.as_ref(), cx.received_at)
            .await
            .map_err(|err| match err {
                PolicyError::Eval {
                    ..
                } => GateError::Internal(err.to_string()),
                other => GateError::Internal(other.to_string()),
            })?;
        cx.set_decision(decision.clone());
        if !decision.allowed && !decision.requires_approval {
            let code = if decision.rule_id.is_some() {
                DenialCode::PolicyDenied
            } else {
                DenialCode::NoMatchingRule
            };
            let mut denial = Denial::new(code, decision.reason.clone());
            if let (Some(rule_id), Some(rule_name)) = (decision.rule_id, decision.rule_name) {
                denial = denial.with_rule(rule_id, rule_name);
            }
            if let Some(help_text) = decision.help_text {
                denial = denial.with_help(help_text);
            }
            return Err(GateError::Denied(denial));
        }
        next.run(cx, action).await
    }
}
