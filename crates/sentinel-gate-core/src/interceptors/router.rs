// crates/sentinel-gate-core/src/interceptors/router.rs
// ============================================================================
// Module: Router Stage
// Description: Terminal stage dispatching to the configured router.
// Purpose: Hand fully admitted actions to their upstream owner.
// Dependencies: crate::chain
// ============================================================================

//! The terminal stage. It never invokes its `Next`; dispatch is delegated to
//! the [`crate::chain::ActionRouter`] implementation (the upstream manager in
//! the gateway, fakes in tests).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::chain::ActionContext;
use crate::chain::ActionRouter;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::GateError;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Terminal dispatch stage.
pub struct RouterInterceptor {
    /// Configured dispatcher.
    router: Arc<dyn ActionRouter>,
}

impl RouterInterceptor {
    /// Creates the stage over the dispatcher.
    #[must_use]
    pub fn new(router: Arc<dyn ActionRouter>) -> Self {
        Self {
            router,
        }
    }
}

#[async_trait]
impl Interceptor for RouterInterceptor {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        _next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        self.router.dispatch(cx, &action).await
    }
}
