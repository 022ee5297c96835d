// crates/sentinel-gate-supervisor/src/claudehook.rs
// ============================================================================
// Module: Claude PreToolUse Hook Entry
// Description: Stdin→decision→stdout bridge for Claude Code hooks.
// Purpose: Let Claude consult the gateway before every tool use.
// Dependencies: reqwest, serde_json
// ============================================================================

//! ## Overview
//! Claude invokes `sentinel-gate claude-hook` with a JSON hook event on
//! stdin. The event's tool name and input become a `tool_call` evaluation
//! against the decision API; the verdict is written to stdout in the hook
//! response shape Claude expects. Unreachable gateways honor the configured
//! fail mode.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Claude hook errors.
#[derive(Debug, Error)]
pub enum ClaudeHookError {
    /// Stdin was unreadable or not JSON.
    #[error("hook event read failed: {0}")]
    Input(String),
    /// Stdout write failed.
    #[error("hook response write failed: {0}")]
    Output(String),
}

// ============================================================================
// SECTION: Entry
// ============================================================================

/// Runs the hook: read one event, evaluate, answer.
///
/// # Errors
///
/// Returns [`ClaudeHookError`] on IO failures; gateway failures fall back to
/// the configured fail mode instead of erroring.
pub async fn run() -> Result<(), ClaudeHookError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| ClaudeHookError::Input(err.to_string()))?;
    let event: Value =
        serde_json::from_str(&input).map_err(|err| ClaudeHookError::Input(err.to_string()))?;

    let tool_name = event
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let tool_input = event.get("tool_input").cloned().unwrap_or_else(|| json!({}));

    let server = std::env::var("SENTINELGATE_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8400".to_string());
    let api_key = std::env::var("SENTINELGATE_API_KEY").unwrap_or_default();
    let fail_closed = std::env::var("SENTINELGATE_FAIL_MODE")
        .map(|mode| mode == "closed")
        .unwrap_or(false);

    let decision = evaluate(&server, &api_key, &tool_name, tool_input).await;
    let response = match decision {
        Some(result) => {
            let verdict = result.get("decision").and_then(Value::as_str).unwrap_or("deny");
            if verdict == "allow" {
                json!({"decision": "approve"})
            } else {
                json!({
                    "decision": "block",
                    "reason": result.get("reason").and_then(Value::as_str).unwrap_or("denied"),
                })
            }
        }
        None if fail_closed => json!({
            "decision": "block",
            "reason": "SentinelGate gateway unreachable (fail-closed)",
        }),
        None => json!({"decision": "approve"}),
    };

    let serialized =
        serde_json::to_string(&response).map_err(|err| ClaudeHookError::Output(err.to_string()))?;
    use std::io::Write;
    std::io::stdout()
        .write_all(serialized.as_bytes())
        .map_err(|err| ClaudeHookError::Output(err.to_string()))
}

/// Posts one evaluation; `None` means the gateway was unreachable.
async fn evaluate(
    server: &str,
    api_key: &str,
    tool_name: &str,
    tool_input: Value,
) -> Option<Value> {
    let client =
        reqwest::Client::builder().timeout(Duration::from_secs(5)).no_proxy().build().ok()?;
    let response = client
        .post(format!("http://{server}/admin/api/v1/policy/evaluate"))
        .bearer_auth(api_key)
        .json(&json!({
            "action_type": "tool_call",
            "action_name": tool_name,
            "arguments": tool_input,
            "protocol": "runtime",
            "identity_name": "claude-hook",
            "identity_roles": ["agent"],
        }))
        .send()
        .await
        .ok()?;
    response.json().await.ok()
}
