// crates/sentinel-gate-core/src/chain.rs
// ============================================================================
// Module: Interceptor Chain
// Description: Ordered, composable pipeline stages with a next-caller contract.
// Purpose: Process every canonical action through a fixed stage order.
// Dependencies: async-trait, chrono, serde_json, tokio
// ============================================================================

//! ## Overview
//! The chain is built once at startup and shared across connections. Each
//! stage implements [`Interceptor`] and receives a [`Next`] handle for the
//! remainder of the chain. `Next` is a move-only value: invoking it consumes
//! it, so a conforming stage can call its continuation at most once, and the
//! deny path simply drops it. Stateful collaborators (policy store, approval
//! manager, ...) are consulted by stages; the chain itself owns no mutable
//! state.
//!
//! Security posture: stages run on untrusted input and must fail closed; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::action::ActionReply;
use crate::action::CanonicalAction;
use crate::auth::Session;
use crate::error::GateError;
use crate::policy::Decision;
use crate::scanner::ScanFinding;

// ============================================================================
// SECTION: Action Context
// ============================================================================

/// Shared holder for scan findings, installed by the audit-enter stage and
/// populated by the response scanner.
pub type ScanHolder = Arc<Mutex<Vec<ScanFinding>>>;

/// Per-action context threaded through every stage.
///
/// # Invariants
/// - One context per action; never reused.
/// - Fields are interior-mutable so stages can record results while the
///   action value itself moves down the chain.
pub struct ActionContext {
    /// Remote peer address when the ingress knows one.
    pub peer_ip: Option<IpAddr>,
    /// Credential presented by the client, extracted by the ingress.
    pub presented_key: Option<String>,
    /// Instant the action was admitted.
    pub received_at: DateTime<Utc>,
    /// Correlation id assigned by the audit-enter stage.
    correlation: OnceLock<crate::ids::CorrelationId>,
    /// Scan-result holder installed by the audit-enter stage.
    scan: OnceLock<ScanHolder>,
    /// Session resolved by the authentication stage.
    session: Mutex<Option<Session>>,
    /// Policy decision recorded for the audit-exit stage.
    decision: Mutex<Option<Decision>>,
    /// DNS answers pinned for the lifetime of this action, keyed by domain.
    pinned_dns: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl ActionContext {
    /// Creates a fresh context for one action.
    #[must_use]
    pub fn new(peer_ip: Option<IpAddr>, presented_key: Option<String>) -> Self {
        Self {
            peer_ip,
            presented_key,
            received_at: Utc::now(),
            correlation: OnceLock::new(),
            scan: OnceLock::new(),
            session: Mutex::new(None),
            decision: Mutex::new(None),
            pinned_dns: Mutex::new(HashMap::new()),
        }
    }

    /// Records the correlation id assigned on admission. First write wins.
    pub fn set_correlation(&self, id: crate::ids::CorrelationId) {
        let _ = self.correlation.set(id);
    }

    /// Returns the correlation id when assigned.
    #[must_use]
    pub fn correlation(&self) -> Option<crate::ids::CorrelationId> {
        self.correlation.get().cloned()
    }

    /// Installs the scan-result holder. Later installs are ignored.
    pub fn install_scan_holder(&self, holder: ScanHolder) {
        let _ = self.scan.set(holder);
    }

    /// Returns the scan-result holder when installed.
    #[must_use]
    pub fn scan_holder(&self) -> Option<ScanHolder> {
        self.scan.get().cloned()
    }

    /// Records the session resolved by authentication.
    pub fn set_session(&self, session: Session) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
    }

    /// Returns a copy of the resolved session, when any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|slot| slot.clone())
    }

    /// Records the policy decision for audit.
    pub fn set_decision(&self, decision: Decision) {
        if let Ok(mut slot) = self.decision.lock() {
            *slot = Some(decision);
        }
    }

    /// Returns a copy of the recorded policy decision, when any.
    #[must_use]
    pub fn decision(&self) -> Option<Decision> {
        self.decision.lock().ok().and_then(|slot| slot.clone())
    }

    /// Returns the pinned DNS answer for a domain, when one was recorded.
    #[must_use]
    pub fn pinned_ips(&self, domain: &str) -> Option<Vec<IpAddr>> {
        self.pinned_dns.lock().ok().and_then(|map| map.get(domain).cloned())
    }

    /// Pins a DNS answer for a domain for the remainder of this action.
    ///
    /// The first answer wins; later pins for the same domain are ignored so a
    /// re-resolution cannot change the address set mid-action.
    pub fn pin_ips(&self, domain: &str, ips: Vec<IpAddr>) {
        if let Ok(mut map) = self.pinned_dns.lock() {
            map.entry(domain.to_string()).or_insert(ips);
        }
    }
}

// ============================================================================
// SECTION: Interceptor Contract
// ============================================================================

/// Future type returned by [`Next::run`].
pub type InterceptFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ActionReply, GateError>> + Send + 'a>>;

/// Handle for the remainder of the chain.
///
/// # Invariants
/// - Consuming `run` enforces the at-most-once contract by move semantics.
/// - The terminal stage must not invoke its `Next`; doing so is an internal
///   error.
pub struct Next<'a> {
    /// Remaining stages, outermost first.
    stages: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain with the (possibly mutated) action.
    pub fn run(self, cx: &'a ActionContext, action: CanonicalAction) -> InterceptFuture<'a> {
        Box::pin(async move {
            let Some((stage, rest)) = self.stages.split_first() else {
                return Err(GateError::Internal("interceptor chain exhausted".to_string()));
            };
            let next = Next {
                stages: rest,
            };
            stage.intercept(cx, action, next).await
        })
    }
}

/// One stage of the pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Stable stage name for audit and diagnostics.
    fn name(&self) -> &'static str;

    /// Processes one action.
    ///
    /// On the allow path the stage must invoke `next` exactly once; on the
    /// deny path it must drop `next` without invoking it. Resources acquired
    /// by the stage must be finalized on both paths.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Denied`] for structured denials and any other
    /// variant for failures that abort the action.
    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError>;
}

// ============================================================================
// SECTION: Action Router
// ============================================================================

/// Terminal dispatcher consulted by the router stage.
///
/// The gateway implements this over the upstream manager; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait ActionRouter: Send + Sync {
    /// Dispatches a fully admitted action to its owner.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Denied`] with code `unknown_tool` when no upstream
    /// owns the requested tool, and sanitized internal errors for transport
    /// failures.
    async fn dispatch(
        &self,
        cx: &ActionContext,
        action: &CanonicalAction,
    ) -> Result<ActionReply, GateError>;
}

// ============================================================================
// SECTION: Chain
// ============================================================================

/// The assembled pipeline.
///
/// # Invariants
/// - Stage order is fixed at construction and never changes at runtime;
///   admin updates mutate the stores stages consult, not the chain.
pub struct InterceptorChain {
    /// Stages in fixed order, outermost first.
    stages: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    /// Builds a chain from stages in outermost-first order.
    ///
    /// The final stage must be terminal (it never invokes its `Next`).
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            stages,
        }
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Executes one action through the full chain.
    ///
    /// # Errors
    ///
    /// Propagates the first stage error; see [`Interceptor::intercept`].
    pub async fn execute(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
    ) -> Result<ActionReply, GateError> {
        let next = Next {
            stages: &self.stages,
        };
        next.run(cx, action).await
    }
}

#[cfg(test)]
#[path = "chain/tests.rs"]
mod tests;
