// crates/sentinel-gate-gateway/src/mcp/tests.rs
// ============================================================================
// Module: MCP Ingress Unit Tests
// Description: Dispatch tests for pass-through authentication and audit.
// Purpose: Prove handshake and discovery traffic is authenticated and leaves
//          an audit trail.
// Dependencies: sentinel-gate-gateway
// ============================================================================

//! Exercises the JSON-RPC dispatcher against an in-memory gateway state.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::sync::Arc;
use std::time::Duration;

use sentinel_gate_config::SentinelConfig;
use sentinel_gate_core::Identity;
use sentinel_gate_core::IdentityId;

use super::dispatch;
use crate::server::GatewayState;
use crate::server::build_state;

/// Builds a gateway state with a fast audit flush and one known key.
fn state_with_key(key: &str) -> Arc<GatewayState> {
    let mut config = SentinelConfig::default();
    config.audit.flush_interval_ms = 5;
    let state = build_state(config).unwrap();
    state.auth.upsert_identity(Identity {
        id: IdentityId::new("ops"),
        name: "ops".to_string(),
        roles: vec!["admin".to_string()],
    });
    state.auth.issue_key(IdentityId::new("ops"), key).unwrap();
    state
}

/// Returns retained audit records for a method after letting the flusher run.
async fn records_for(state: &GatewayState, method: &str) -> Vec<sentinel_gate_core::AuditRecord> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    state
        .audit_memory
        .snapshot()
        .into_iter()
        .filter(|record| record.action_name == method)
        .collect()
}

#[tokio::test]
async fn tools_list_is_audited() {
    let state = state_with_key("sg_test");
    let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
    let (response, correlation) =
        dispatch(&state, None, None, body).await.expect("response for a request with an id");
    assert!(response.error.is_none());
    let correlation = correlation.expect("pass-through responses carry a correlation id");

    let records = records_for(&state, "tools/list").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision.as_deref(), Some("pass_through"));
    assert_eq!(records[0].correlation_id.as_str(), correlation);
    assert_eq!(records[0].gateway, "mcp-gateway");
}

#[tokio::test]
async fn initialize_is_audited() {
    let state = state_with_key("sg_test");
    let body = br#"{"jsonrpc":"2.0","id":7,"method":"initialize"}"#;
    let (response, correlation) = dispatch(&state, None, None, body).await.unwrap();
    assert!(response.error.is_none());
    assert!(correlation.is_some());

    let records = records_for(&state, "initialize").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision.as_deref(), Some("pass_through"));
    assert_eq!(records[0].identity, "anonymous");
}

#[tokio::test]
async fn invalid_credentials_on_passthrough_methods_are_denied_and_audited() {
    let state = state_with_key("sg_test");
    for method in ["initialize", "tools/list"] {
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{method}"}}"#);
        let (response, _) = dispatch(
            &state,
            None,
            Some("sg_wrong".to_string()),
            body.as_bytes(),
        )
        .await
        .unwrap();
        let error = response.error.expect("invalid key must fail");
        assert_eq!(error["code"], super::CODE_UNAUTHENTICATED);

        let records = records_for(&state, method).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision.as_deref(), Some("deny:unauthenticated"));
    }
}

#[tokio::test]
async fn valid_credentials_are_attributed_in_the_audit_record() {
    let state = state_with_key("sg_test");
    let body = br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#;
    let (response, _) =
        dispatch(&state, None, Some("sg_test".to_string()), body).await.unwrap();
    assert!(response.error.is_none());

    let records = records_for(&state, "tools/list").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, "ops");
}
