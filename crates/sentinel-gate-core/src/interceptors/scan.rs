// crates/sentinel-gate-core/src/interceptors/scan.rs
// ============================================================================
// Module: Response Scan Stage
// Description: Scans the reply on the way back out.
// Purpose: Record findings in monitor mode, deny in enforce mode.
// Dependencies: crate::scanner
// ============================================================================

//! ## Overview
//! Unlike the other gates, this stage wraps the downstream call and inspects
//! the reply after it returns. Findings always land in the scan holder the
//! audit stage installed; enforce mode additionally replaces the reply with a
//! structured denial naming the finding categories.

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
use crate::scanner::ScanControl;
use crate::scanner::ScanMode;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage scanning replies.
pub struct ResponseScanInterceptor {
    /// Shared live-configurable control.
    control: ScanControl,
}

impl ResponseScanInterceptor {
    /// Creates the stage over the shared control.
    #[must_use]
    pub const fn new(control: ScanControl) -> Self {
        Self {
            control,
        }
    }
}

#[async_trait]
impl Interceptor for ResponseScanInterceptor {
    fn name(&self) -> &'static str {
        "response_scan"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        let reply = next.run(cx, action).await?;
        let mode = self.control.mode();
        if mode == ScanMode::Disabled {
            return Ok(reply);
        }
        let Some(payload) = reply.as_json() else {
            return Ok(reply);
        };
        let text = payload.to_string();
        let findings = self.control.scan(&text);
        if findings.is_empty() {
            return Ok(reply);
        }
        if let Some(holder) = cx.scan_holder()
            && let Ok(mut slot) = holder.lock()
        {
            slot.extend(findings.iter().cloned());
        }
        if mode == ScanMode::Enforce {
            let mut categories: Vec<&str> =
                findings.iter().map(|finding| finding.category.as_str()).collect();
            categories.sort_unstable();
            categories.dedup();
            return Err(GateError::Denied(Denial::new(
                DenialCode::ResponseBlocked,
                format!("response blocked by scanner: {}", categories.join(", ")),
            )));
        }
        Ok(reply)
    }
}
