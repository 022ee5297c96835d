// crates/sentinel-gate-core/src/interceptors/validate.rs
// ============================================================================
// Module: Validation Stage
// Description: Shape and size caps applied before any other work.
// Purpose: Reject malformed or oversized actions immediately.
// Dependencies: crate::chain
// ============================================================================

//! ## Overview
//! Malformed JSON never reaches this stage (ingresses reject it at parse
//! time); this stage enforces the structural caps: non-empty action name,
//! bounded name length, bounded serialized argument size.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::Denial;
use crate::error::DenialCode;
use crate::error::GateError;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Validation caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Maximum action name length in bytes.
    pub max_name_len: usize,
    /// Maximum serialized argument size in bytes.
    pub max_args_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_name_len: 256,
            max_args_bytes: 1024 * 1024,
        }
    }
}

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage enforcing shape and size caps.
pub struct ValidationInterceptor {
    /// Configured caps.
    config: ValidationConfig,
}

impl ValidationInterceptor {
    /// Creates the stage with the given caps.
    #[must_use]
    pub const fn new(config: ValidationConfig) -> Self {
        Self {
            config,
        }
    }
}

#[async_trait]
impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        if action.name.is_empty() {
            return Err(GateError::Denied(Denial::new(
                DenialCode::Validation,
                "action name must not be empty",
            )));
        }
        if action.name.len() > self.config.max_name_len {
            return Err(GateError::Denied(Denial::new(
                DenialCode::Validation,
                format!("action name exceeds {} bytes", self.config.max_name_len),
            )));
        }
        if action.arguments_size() > self.config.max_args_bytes {
            return Err(GateError::Denied(Denial::new(
                DenialCode::Validation,
                format!("arguments exceed {} bytes", self.config.max_args_bytes),
            )));
        }
        next.run(cx, action).await
    }
}
