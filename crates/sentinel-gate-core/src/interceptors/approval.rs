// crates/sentinel-gate-core/src/interceptors/approval.rs
// ============================================================================
// Module: Approval Stage
// Description: Blocks approval-required actions until a human decides.
// Purpose: Turn approval outcomes into allow/deny with timeout semantics.
// Dependencies: crate::approval
// ============================================================================

//! ## Overview
//! This stage only acts when the policy stage recorded an
//! `approval_required` decision; every other action flows straight through.
//! The blocked caller waits on the request's watch channel. Timeout applies
//! the originating rule's `timeout_action`; eviction from a full store is a
//! denial with reason `approval overflow`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::approval::ApprovalManager;
use crate::approval::ApprovalState;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::Denial;
use crate::error::DenialCode;
use crate::error::GateError;
use crate::policy::TimeoutAction;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage gating actions on human approval.
pub struct ApprovalInterceptor {
    /// Shared approval manager.
    approvals: Arc<ApprovalManager>,
}

impl ApprovalInterceptor {
    /// Creates the stage over the shared manager.
    #[must_use]
    pub fn new(approvals: Arc<ApprovalManager>) -> Self {
        Self {
            approvals,
        }
    }
}

#[async_trait]
impl Interceptor for ApprovalInterceptor {
    fn name(&self) -> &'static str {
        "approval"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        let Some(decision) = cx.decision().filter(|decision| decision.requires_approval) else {
            return next.run(cx, action).await;
        };
        let timeout = Duration::from_secs(decision.approval_timeout_secs.max(1));
        let (request_id, rx) = self
            .approvals
            .submit(action.clone(), timeout)
            .map_err(|err| GateError::Internal(err.to_string()))?;
        let state = self.approvals.wait(&request_id, rx, timeout).await;
        match state {
            ApprovalState::Approved => next.run(cx, action).await,
            ApprovalState::Denied => {
                let reason = self
                    .approvals
                    .status(&request_id)
                    .and_then(|request| request.reason)
                    .unwrap_or_else(|| "approval denied".to_string());
                let code = if reason == "approval overflow" {
                    DenialCode::ApprovalOverflow
                } else {
                    DenialCode::ApprovalDenied
                };
                Err(GateError::Denied(Denial::new(code, reason)))
            }
            ApprovalState::TimedOut => match decision.timeout_action {
                TimeoutAction::Allow => next.run(cx, action).await,
                TimeoutAction::Deny => Err(GateError::Denied(Denial::new(
                    DenialCode::ApprovalTimeout,
                    "approval timeout",
                ))),
            },
            ApprovalState::Pending => {
                Err(GateError::Internal("approval wait returned pending".to_string()))
            }
        }
    }
}
