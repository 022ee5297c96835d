// crates/sentinel-gate-core/src/interceptors/audit.rs
// ============================================================================
// Module: Audit Stage
// Description: Enter/decision/exit records around the rest of the chain.
// Purpose: Assign the correlation id and guarantee ordered records on both
//          the allow and deny paths.
// Dependencies: crate::audit
// ============================================================================

//! ## Overview
//! This stage assigns the action's correlation id, installs the scan-result
//! holder later stages populate, and emits three records per action: enter
//! before calling the remainder of the chain, then a decision record and an
//! exit record after it returns, on every path, including denials and
//! internal errors. Records for one action are sent sequentially by this
//! stage, which keeps them totally ordered through the async writer.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::audit::AuditPhase;
use crate::audit::AuditRecord;
use crate::audit::AuditService;
use crate::chain::ActionContext;
use crate::chain::Interceptor;
use crate::chain::Next;
use crate::error::GateError;
use crate::ids::CorrelationId;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// Stage bracketing the chain with audit records.
pub struct AuditInterceptor {
    /// Audit producer handle.
    audit: AuditService,
}

impl AuditInterceptor {
    /// Creates the stage over the audit service.
    #[must_use]
    pub const fn new(audit: AuditService) -> Self {
        Self {
            audit,
        }
    }

    /// Builds the base record for the action.
    fn base_record(
        correlation_id: &CorrelationId,
        action: &CanonicalAction,
        phase: AuditPhase,
    ) -> AuditRecord {
        AuditRecord {
            correlation_id: correlation_id.clone(),
            phase,
            action_type: action.action_type.as_str().to_string(),
            action_name: action.name.clone(),
            identity: action.identity.name.clone(),
            gateway: action.gateway.as_str().to_string(),
            decision: None,
            rule_id: None,
            latency_ms: None,
            scan_findings: Vec::new(),
            request_bytes: Some(action.arguments_size() as u64),
            response_bytes: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Interceptor for AuditInterceptor {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        mut action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        let correlation_id = CorrelationId::generate();
        action.correlation_id = Some(correlation_id.clone());
        cx.set_correlation(correlation_id.clone());
        let holder = Arc::new(Mutex::new(Vec::new()));
        cx.install_scan_holder(Arc::clone(&holder));

        self.audit
            .record(Self::base_record(&correlation_id, &action, AuditPhase::Enter))
            .await;

        let snapshot = action.clone();
        let result = next.run(cx, action).await;

        let (decision_label, detail) = match &result {
            Ok(_) => ("allow".to_string(), None),
            Err(GateError::Denied(denial)) => {
                (format!("deny:{}", denial.code.as_str()), Some(denial.reason.clone()))
            }
            Err(err) => ("error".to_string(), Some(err.to_string())),
        };
        let decision = cx.decision();

        let mut decision_record =
            Self::base_record(&correlation_id, &snapshot, AuditPhase::Decision);
        decision_record.decision = Some(decision_label.clone());
        decision_record.rule_id = decision.as_ref().and_then(|d| d.rule_id.clone());
        self.audit.record(decision_record).await;

        let mut exit_record = Self::base_record(&correlation_id, &snapshot, AuditPhase::Exit);
        exit_record.decision = Some(decision_label);
        exit_record.rule_id = decision.and_then(|d| d.rule_id);
        exit_record.response_bytes = match &result {
            Ok(reply) => reply
                .as_json()
                .and_then(|value| serde_json::to_vec(value).ok())
                .map(|bytes| bytes.len() as u64),
            Err(_) => None,
        };
        exit_record.detail = detail;
        exit_record.latency_ms = u64::try_from(
            Utc::now()
                .signed_duration_since(cx.received_at)
                .num_milliseconds()
                .max(0),
        )
        .ok();
        exit_record.scan_findings = holder.lock().map(|findings| findings.clone()).unwrap_or_default();
        self.audit.record(exit_record).await;

        result
    }
}
