// crates/sentinel-gate-core/src/interceptors/quarantine.rs
// ============================================================================
// Module: Quarantine Stage
// Description: Denies calls to tools flagged by the tool-security service.
// Purpose: Keep quarantined tools unreachable regardless of policy.
// Dependencies: crate::quarantine
// ============================================================================

//! Quarantine runs before policy on purpose: a quarantined tool must stay
//! unreachable even under an allow-all policy.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::Denial;
use crate::error::DenialCode;
use crate::error::GateError;
use crate::quarantine::QuarantineRegistry;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage denying quarantined tools.
pub struct QuarantineInterceptor {
    /// Shared quarantine registry.
    registry: Arc<QuarantineRegistry>,
}

impl QuarantineInterceptor {
    /// Creates the stage over the shared registry.
    #[must_use]
    pub fn new(registry: Arc<QuarantineRegistry>) -> Self {
        Self {
            registry,
        }
    }
}

#[async_trait]
impl Interceptor for QuarantineInterceptor {
    fn name(&self) -> &'static str {
        "quarantine"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        if action.action_type == ActionType::ToolCall && self.registry.is_quarantined(&action.name)
        {
            return Err(GateError::Denied(Denial::new(
                DenialCode::ToolQuarantined,
                "tool quarantined",
            )));
        }
        next.run(cx, action).await
    }
}
