// crates/sentinel-gate-core/src/interceptors/auth.rs
// ============================================================================
// Module: Authentication Stage
// Description: Credential resolution and session attachment.
// Purpose: Resolve the presented key into an identity or keep the action
//          anonymous.
// Dependencies: crate::auth
// ============================================================================

//! ## Overview
//! When the ingress extracted a credential, it must verify: an invalid key is
//! a hard authentication failure with the uniform message. When no credential
//! was presented the action continues anonymously; downstream policy decides
//! what anonymous callers may do. Successful verification attaches (or
//! creates) a session and stamps the identity onto the action.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::auth::AuthStore;
use crate::auth::SessionStore;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::GateError;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage resolving credentials into identities and sessions.
pub struct AuthenticationInterceptor {
    /// Identity and key store.
    auth: Arc<AuthStore>,
    /// Session store.
    sessions: Arc<SessionStore>,
}

impl AuthenticationInterceptor {
    /// Creates the stage over the shared stores.
    #[must_use]
    pub fn new(auth: Arc<AuthStore>, sessions: Arc<SessionStore>) -> Self {
        Self {
            auth,
            sessions,
        }
    }
}

#[async_trait]
impl Interceptor for AuthenticationInterceptor {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        mut action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        if let Some(presented) = cx.presented_key.as_deref() {
            let identity =
                self.auth.verify_key(presented).map_err(|_| GateError::Unauthenticated)?;
            let session = self.sessions.attach(&identity);
            cx.set_session(session);
            action.identity = identity;
        }
        next.run(cx, action).await
    }
}
