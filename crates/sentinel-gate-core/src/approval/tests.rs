// crates/sentinel-gate-core/src/approval/tests.rs
// ============================================================================
// Module: Approval Manager Unit Tests
// Description: State machine, eviction, and waiter behavior tests.
// Purpose: Validate single-transition semantics and bounded capacity.
// Dependencies: sentinel-gate-core
// ============================================================================

//! Exercises the approval manager with direct transitions and waiters.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::sync::Arc;
use std::time::Duration;

use super::ApprovalError;
use super::ApprovalManager;
use super::ApprovalState;
use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::action::GatewayKind;
use crate::action::Protocol;

/// Builds a tool-call action fixture.
fn tool_call(name: &str) -> CanonicalAction {
    CanonicalAction::new(ActionType::ToolCall, name, Protocol::Mcp, GatewayKind::McpGateway)
}

#[tokio::test]
async fn transitions_after_the_first_are_rejected() {
    let manager = ApprovalManager::new(10);
    let (id, _rx) = manager.submit(tool_call("deploy"), Duration::from_secs(60)).unwrap();
    assert_eq!(manager.resolve(&id, true).unwrap(), ApprovalState::Approved);
    let err = manager.resolve(&id, false).unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::AlreadyResolved {
            state: ApprovalState::Approved,
            ..
        }
    ));
    // Expiry after a terminal state reports the terminal state, unchanged.
    assert_eq!(manager.expire(&id).unwrap(), ApprovalState::Approved);
}

#[tokio::test]
async fn waiter_observes_the_administrator_decision() {
    let manager = Arc::new(ApprovalManager::new(10));
    let (id, rx) = manager.submit(tool_call("deploy"), Duration::from_secs(60)).unwrap();
    let waiter = {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        tokio::spawn(async move { manager.wait(&id, rx, Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.resolve(&id, false).unwrap();
    assert_eq!(waiter.await.unwrap(), ApprovalState::Denied);
}

#[tokio::test]
async fn waiting_past_the_deadline_times_out() {
    let manager = ApprovalManager::new(10);
    let (id, rx) = manager.submit(tool_call("deploy"), Duration::from_millis(30)).unwrap();
    let state = manager.wait(&id, rx, Duration::from_millis(30)).await;
    assert_eq!(state, ApprovalState::TimedOut);
    let status = manager.status(&id).unwrap();
    assert_eq!(status.state, ApprovalState::TimedOut);
    assert_eq!(status.reason.as_deref(), Some("approval timeout"));
}

#[tokio::test]
async fn overflow_evicts_the_oldest_pending_request() {
    let manager = ApprovalManager::new(2);
    let (first, rx_first) = manager.submit(tool_call("a"), Duration::from_secs(60)).unwrap();
    let (_second, _rx2) = manager.submit(tool_call("b"), Duration::from_secs(60)).unwrap();
    let (_third, _rx3) = manager.submit(tool_call("c"), Duration::from_secs(60)).unwrap();
    // The first request was evicted and its waiter sees the denial.
    let state = manager.wait(&first, rx_first, Duration::from_secs(1)).await;
    assert_eq!(state, ApprovalState::Denied);
    let status = manager.status(&first).unwrap();
    assert_eq!(status.reason.as_deref(), Some("approval overflow"));
}

#[tokio::test]
async fn dropping_one_waiter_leaves_the_entry_for_others() {
    let manager = Arc::new(ApprovalManager::new(10));
    let (id, rx_keep) = manager.submit(tool_call("deploy"), Duration::from_secs(60)).unwrap();
    let rx_drop = rx_keep.clone();
    drop(rx_drop);
    let waiter = {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        tokio::spawn(async move { manager.wait(&id, rx_keep, Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.resolve(&id, true).unwrap();
    assert_eq!(waiter.await.unwrap(), ApprovalState::Approved);
}

#[tokio::test]
async fn sweep_expires_only_overdue_pending_requests() {
    let manager = ApprovalManager::new(10);
    let (overdue, _rx_a) = manager.submit(tool_call("a"), Duration::from_millis(1)).unwrap();
    let (fresh, _rx_b) = manager.submit(tool_call("b"), Duration::from_secs(60)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.sweep(), 1);
    assert_eq!(manager.status(&overdue).unwrap().state, ApprovalState::TimedOut);
    assert_eq!(manager.status(&fresh).unwrap().state, ApprovalState::Pending);
}
