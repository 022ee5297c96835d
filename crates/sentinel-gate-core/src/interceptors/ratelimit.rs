// crates/sentinel-gate-core/src/interceptors/ratelimit.rs
// ============================================================================
// Module: Rate Limit Stages
// Description: Per-IP and per-identity GCRA checks.
// Purpose: Bound request rates before expensive stages run.
// Dependencies: crate::ratelimit
// ============================================================================

//! ## Overview
//! Two stages wrap the shared [`RateLimitService`]: the IP stage runs before
//! authentication, the identity stage after it. The identity stage skips
//! anonymous actions; without an identity there is no bucket to charge.
//! Both stages no-op when their limiter class is disabled.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::GateError;
use crate::ratelimit::RateLimitKind;
use crate::ratelimit::RateLimitService;

// ============================================================================
// SECTION: IP Stage
// ============================================================================

/// Stage charging the client-IP bucket.
pub struct IpRateLimitInterceptor {
    /// Shared limiter service.
    limits: Arc<RateLimitService>,
}

impl IpRateLimitInterceptor {
    /// Creates the stage over the shared service.
    #[must_use]
    pub fn new(limits: Arc<RateLimitService>) -> Self {
        Self {
            limits,
        }
    }
}

#[async_trait]
impl Interceptor for IpRateLimitInterceptor {
    fn name(&self) -> &'static str {
        "ip_rate_limit"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        if let Some(peer_ip) = cx.peer_ip {
            let decision = self.limits.allow(RateLimitKind::Ip, &peer_ip.to_string());
            if !decision.allowed {
                return Err(GateError::RateLimited {
                    retry_after: decision.retry_after.unwrap_or(Duration::from_secs(1)),
                });
            }
        }
        next.run(cx, action).await
    }
}

// ============================================================================
// SECTION: Identity Stage
// ============================================================================

/// Stage charging the authenticated-identity bucket.
pub struct IdentityRateLimitInterceptor {
    /// Shared limiter service.
    limits: Arc<RateLimitService>,
}

impl IdentityRateLimitInterceptor {
    /// Creates the stage over the shared service.
    #[must_use]
    pub fn new(limits: Arc<RateLimitService>) -> Self {
        Self {
            limits,
        }
    }
}

#[async_trait]
impl Interceptor for IdentityRateLimitInterceptor {
    fn name(&self) -> &'static str {
        "identity_rate_limit"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        if !action.identity.is_anonymous() {
            let decision =
                self.limits.allow(RateLimitKind::Identity, action.identity.id.as_str());
            if !decision.allowed {
                return Err(GateError::RateLimited {
                    retry_after: decision.retry_after.unwrap_or(Duration::from_secs(1)),
                });
            }
        }
        next.run(cx, action).await
    }
}
