// crates/sentinel-gate-core/src/approval.rs
// ============================================================================
// Module: Approval Manager
// Description: Bounded, blocking state machine for human-in-the-loop gates.
// Purpose: Hold actions pending approval and resolve them exactly once.
// Dependencies: chrono, serde, tokio
// ============================================================================

//! ## Overview
//! Each `approval_required` decision allocates a pending entry. The store is
//! bounded: when full, the oldest pending entry is evicted and its waiters
//! denied with reason `approval overflow`. A request leaves `pending` exactly
//! once: administrator approval/denial, expiry, and eviction all race for
//! the single transition and later attempts are rejected. Waiters block on a
//! per-request watch channel; a waiter whose caller is cancelled simply drops
//! its receiver while the entry (and any other waiters) survive.
//!
//! Security posture: approval requests snapshot untrusted action data for
//! operator display; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::action::CanonicalAction;
use crate::ids::ApprovalId;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Default pending-store capacity.
pub const DEFAULT_APPROVAL_CAPACITY: usize = 100;

/// Seconds a terminal entry stays queryable for the polling surface.
const TERMINAL_RETENTION_SECS: i64 = 15 * 60;

/// Approval request lifecycle state.
///
/// # Invariants
/// - `Pending` is left exactly once; every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Awaiting an administrator decision.
    Pending,
    /// Approved; the action proceeds.
    Approved,
    /// Explicitly rejected.
    Denied,
    /// Expired while pending.
    TimedOut,
}

impl ApprovalState {
    /// Returns true for any state other than `Pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns the stable wire label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Public view of an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier.
    pub request_id: ApprovalId,
    /// Snapshot of the gated action.
    pub action: CanonicalAction,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
    /// Current state.
    pub state: ApprovalState,
    /// Reason recorded with the terminal transition, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Approval manager errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// The request does not exist (never created or already swept).
    #[error("unknown approval request: {0}")]
    Unknown(ApprovalId),
    /// The request already left `pending`.
    #[error("approval request {request_id} already resolved to {state:?}")]
    AlreadyResolved {
        /// Request identifier.
        request_id: ApprovalId,
        /// Terminal state the request reached first.
        state: ApprovalState,
    },
    /// Manager lock was poisoned.
    #[error("approval store lock poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Entry
// ============================================================================

/// Internal entry sharing one watch channel with all waiters.
struct Entry {
    /// Request view (state mirrors the watch value).
    request: ApprovalRequest,
    /// Transition broadcaster.
    tx: watch::Sender<ApprovalState>,
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Bounded approval manager.
pub struct ApprovalManager {
    /// Entries keyed by request id, with pending insertion order.
    inner: Mutex<Inner>,
    /// Maximum simultaneous pending entries.
    capacity: usize,
}

/// Lock-guarded manager state.
struct Inner {
    /// Entries keyed by request id.
    entries: HashMap<ApprovalId, Entry>,
    /// Pending ids in insertion order, oldest first.
    pending_order: VecDeque<ApprovalId>,
}

impl ApprovalManager {
    /// Creates a manager with the given pending capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pending_order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Allocates a pending request for an action.
    ///
    /// When the store is full, the oldest pending request is evicted and its
    /// waiters observe `Denied` with reason `approval overflow`, which the
    /// chain surfaces under the overflow denial code.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Poisoned`] when the store lock is poisoned.
    pub fn submit(
        &self,
        action: CanonicalAction,
        timeout: Duration,
    ) -> Result<(ApprovalId, watch::Receiver<ApprovalState>), ApprovalError> {
        let mut inner = self.inner.lock().map_err(|_| ApprovalError::Poisoned)?;
        while inner.pending_order.len() >= self.capacity {
            if let Some(oldest) = inner.pending_order.pop_front() {
                if let Some(entry) = inner.entries.get_mut(&oldest)
                    && entry.request.state == ApprovalState::Pending
                {
                    entry.request.state = ApprovalState::Denied;
                    entry.request.reason = Some("approval overflow".to_string());
                    let _ = entry.tx.send(ApprovalState::Denied);
                }
            } else {
                break;
            }
        }
        let request_id = ApprovalId::generate();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let (tx, rx) = watch::channel(ApprovalState::Pending);
        inner.entries.insert(
            request_id.clone(),
            Entry {
                request: ApprovalRequest {
                    request_id: request_id.clone(),
                    action,
                    created_at: now,
                    expires_at,
                    state: ApprovalState::Pending,
                    reason: None,
                },
                tx,
            },
        );
        inner.pending_order.push_back(request_id.clone());
        Ok((request_id, rx))
    }

    /// Applies an administrator decision.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unknown`] for missing requests and
    /// [`ApprovalError::AlreadyResolved`] when the request already left
    /// `pending`.
    pub fn resolve(&self, id: &ApprovalId, approve: bool) -> Result<ApprovalState, ApprovalError> {
        let state = if approve { ApprovalState::Approved } else { ApprovalState::Denied };
        self.transition(id, state)
    }

    /// Times out a request that is still pending.
    ///
    /// Returns the state the request actually ended in, so a racing approval
    /// is honored rather than overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Unknown`] for missing requests.
    pub fn expire(&self, id: &ApprovalId) -> Result<ApprovalState, ApprovalError> {
        match self.transition(id, ApprovalState::TimedOut) {
            Ok(state) => Ok(state),
            Err(ApprovalError::AlreadyResolved {
                state, ..
            }) => Ok(state),
            Err(err) => Err(err),
        }
    }

    /// Performs the single pending→terminal transition.
    fn transition(
        &self,
        id: &ApprovalId,
        target: ApprovalState,
    ) -> Result<ApprovalState, ApprovalError> {
        let mut inner = self.inner.lock().map_err(|_| ApprovalError::Poisoned)?;
        let entry =
            inner.entries.get_mut(id).ok_or_else(|| ApprovalError::Unknown(id.clone()))?;
        if entry.request.state.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                request_id: id.clone(),
                state: entry.request.state,
            });
        }
        entry.request.state = target;
        entry.request.reason = Some(
            match target {
                ApprovalState::Pending => "pending",
                ApprovalState::Approved => "approved",
                ApprovalState::Denied => "approval denied",
                ApprovalState::TimedOut => "approval timeout",
            }
            .to_string(),
        );
        let _ = entry.tx.send(target);
        inner.pending_order.retain(|pending| pending != id);
        Ok(target)
    }

    /// Returns the current view of a request.
    #[must_use]
    pub fn status(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.entries.get(id).map(|entry| entry.request.clone()))
    }

    /// Returns every request, pending and terminal.
    #[must_use]
    pub fn list(&self) -> Vec<ApprovalRequest> {
        self.inner
            .lock()
            .map(|inner| inner.entries.values().map(|entry| entry.request.clone()).collect())
            .unwrap_or_default()
    }

    /// Expires every pending request whose deadline has passed. Returns the
    /// number expired.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<ApprovalId> = self
            .inner
            .lock()
            .map(|inner| {
                inner
                    .entries
                    .values()
                    .filter(|entry| {
                        entry.request.state == ApprovalState::Pending
                            && entry.request.expires_at <= now
                    })
                    .map(|entry| entry.request.request_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut count = 0;
        for id in expired {
            if self.expire(&id).is_ok() {
                count += 1;
            }
        }
        self.prune_terminal(now);
        count
    }

    /// Removes terminal entries past the polling retention window so the map
    /// stays bounded while the status endpoint can still report recent
    /// outcomes.
    fn prune_terminal(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::seconds(TERMINAL_RETENTION_SECS);
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.retain(|_, entry| {
                entry.request.state == ApprovalState::Pending
                    || entry.request.expires_at + retention > now
            });
        }
    }

    /// Waits for a terminal state, expiring the request when its deadline
    /// passes first.
    ///
    /// Dropping the returned future detaches this waiter only; the entry and
    /// other waiters are unaffected.
    pub async fn wait(
        &self,
        id: &ApprovalId,
        mut rx: watch::Receiver<ApprovalState>,
        timeout: Duration,
    ) -> ApprovalState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *rx.borrow();
            if current.is_terminal() {
                return current;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Sender gone without a terminal transition: treat as timeout.
                    return self.expire(id).unwrap_or(ApprovalState::TimedOut);
                }
                Err(_) => {
                    return self.expire(id).unwrap_or(ApprovalState::TimedOut);
                }
            }
        }
    }

    /// Spawns the periodic expiry sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = manager.sweep();
                if expired > 0 {
                    tracing::debug!(expired, "approval sweeper timed out pending requests");
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "approval/tests.rs"]
mod tests;
