// crates/sentinel-gate-core/src/chain/tests.rs
// ============================================================================
// Module: Chain Unit Tests
// Description: Ordering and next-caller contract tests for the chain.
// Purpose: Verify stage order, exactly-once invocation, and deny
//          short-circuiting.
// Dependencies: sentinel-gate-core
// ============================================================================

//! Exercises the chain with recording stages and a counting terminal.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::json;

use super::ActionContext;
use super::Interceptor;
use super::InterceptorChain;
use super::Next;
use crate::action::ActionReply;
use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::action::GatewayKind;
use crate::action::Protocol;
use crate::error::Denial;
use crate::error::DenialCode;
use crate::error::GateError;

/// Stage that records its invocation and optionally denies.
struct RecordingStage {
    /// Stage label.
    label: &'static str,
    /// Shared invocation log.
    log: Arc<Mutex<Vec<&'static str>>>,
    /// Deny instead of continuing.
    deny: bool,
}

#[async_trait]
impl Interceptor for RecordingStage {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn intercept(
        &self,
        cx: &ActionContext,
        action: CanonicalAction,
        next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        self.log.lock().unwrap().push(self.label);
        if self.deny {
            return Err(GateError::Denied(Denial::new(DenialCode::Validation, "stop")));
        }
        next.run(cx, action).await
    }
}

/// Terminal stage that counts dispatches.
struct Terminal {
    /// Shared invocation log.
    log: Arc<Mutex<Vec<&'static str>>>,
    /// Dispatch counter.
    dispatched: Arc<AtomicUsize>,
}

#[async_trait]
impl Interceptor for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn intercept(
        &self,
        _cx: &ActionContext,
        _action: CanonicalAction,
        _next: Next<'_>,
    ) -> Result<ActionReply, GateError> {
        self.log.lock().unwrap().push("terminal");
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(ActionReply::Json(json!({"ok": true})))
    }
}

/// Builds a tool-call action fixture.
fn tool_call(name: &str) -> CanonicalAction {
    CanonicalAction::new(ActionType::ToolCall, name, Protocol::Mcp, GatewayKind::McpGateway)
}

/// Builds a chain of recording stages ending in a counting terminal.
fn build(
    deny_at: Option<&'static str>,
) -> (InterceptorChain, Arc<Mutex<Vec<&'static str>>>, Arc<AtomicUsize>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let dispatched = Arc::new(AtomicUsize::new(0));
    let labels = ["alpha", "beta", "gamma"];
    let mut stages: Vec<Arc<dyn Interceptor>> = labels
        .iter()
        .map(|label| {
            Arc::new(RecordingStage {
                label,
                log: Arc::clone(&log),
                deny: deny_at == Some(*label),
            }) as Arc<dyn Interceptor>
        })
        .collect();
    stages.push(Arc::new(Terminal {
        log: Arc::clone(&log),
        dispatched: Arc::clone(&dispatched),
    }));
    (InterceptorChain::new(stages), log, dispatched)
}

#[tokio::test]
async fn stages_run_in_order_exactly_once_on_the_happy_path() {
    let (chain, log, dispatched) = build(None);
    let cx = ActionContext::new(None, None);
    let reply = chain.execute(&cx, tool_call("read_file")).await.unwrap();
    assert_eq!(reply, ActionReply::Json(json!({"ok": true})));
    assert_eq!(*log.lock().unwrap(), vec!["alpha", "beta", "gamma", "terminal"]);
    assert_eq!(dispatched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deny_short_circuits_later_stages() {
    let (chain, log, dispatched) = build(Some("beta"));
    let cx = ActionContext::new(None, None);
    let err = chain.execute(&cx, tool_call("read_file")).await.unwrap_err();
    assert!(matches!(err, GateError::Denied(_)));
    assert_eq!(*log.lock().unwrap(), vec!["alpha", "beta"]);
    assert_eq!(dispatched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dns_pins_are_first_write_wins() {
    let cx = ActionContext::new(None, None);
    cx.pin_ips("example.com", vec!["10.1.2.3".parse().unwrap()]);
    cx.pin_ips("example.com", vec!["8.8.8.8".parse().unwrap()]);
    let pinned = cx.pinned_ips("example.com").unwrap();
    assert_eq!(pinned, vec!["10.1.2.3".parse::<std::net::IpAddr>().unwrap()]);
}

#[tokio::test]
async fn scan_holder_installs_once() {
    let cx = ActionContext::new(None, None);
    let first = Arc::new(Mutex::new(Vec::new()));
    cx.install_scan_holder(Arc::clone(&first));
    let second = Arc::new(Mutex::new(Vec::new()));
    cx.install_scan_holder(second);
    assert!(Arc::ptr_eq(&cx.scan_holder().unwrap(), &first));
}
