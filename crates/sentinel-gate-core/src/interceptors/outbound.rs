// crates/sentinel-gate-core/src/interceptors/outbound.rs
// ============================================================================
// Module: Outbound Stage
// Description: Applies outbound rules to destination-bearing actions.
// Purpose: Block disallowed egress with a structured reason.
// Dependencies: crate::outbound
// ============================================================================

//! ## Overview
//! Only actions with a destination (explicit, or extracted from a URL
//! argument) consult the engine. The extracted destination is written back
//! onto the action so downstream stages and audit see what was checked.

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
use crate::ids::RuleId;
use crate::outbound::OutboundEngine;
use crate::outbound::destination_for;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage applying outbound rules.
pub struct OutboundInterceptor {
    /// Shared engine.
    engine: Arc<OutboundEngine>,
}

impl OutboundInterceptor {
    /// Creates the stage over the shared engine.
    #[must_use]
    pub fn new(engine: Arc<OutboundEngine>) -> Self {
        Self {
            engine,
        }
    }
}

#[async_trait]
impl Interceptor for OutboundInterceptor {
    fn name(&self) -> &'static str {
        "outbound"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        mut action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        let Some(dest) = destination_for(&action) else {
            return next.run(cx, action).await;
        };
        let block = self
            .engine
            .evaluate(cx, &dest)
            .await
            .map_err(|err| GateError::Internal(err.to_string()))?;
        if let Some(block) = block {
            let mut denial = Denial::new(
                DenialCode::OutboundBlocked,
                format!("outbound blocked: {}:{}", block.domain_or_ip, block.port),
            )
            .with_rule(RuleId::new(block.rule_id.as_str()), block.rule_name);
            if let Some(help_text) = block.help_text {
                denial = denial.with_help(help_text);
            }
            return Err(GateError::Denied(denial));
        }
        action.destination = Some(dest);
        next.run(cx, action).await
    }
}
