// crates/sentinel-gate-gateway/src/mcp.rs
// ============================================================================
// Module: MCP Ingress
// Description: JSON-RPC over streamable HTTP plus the stdio adapter.
// Purpose: Translate MCP requests into canonical actions exactly once.
// Dependencies: axum, sentinel-gate-core, serde_json, tokio
// ============================================================================

//! ## Overview
//! `tools/call` is the method subjected to the full chain; `initialize` and
//! `tools/list` pass through after authentication and audit only. The HTTP
//! surface takes one JSON-RPC body per POST; the stdio adapter reads
//! newline-delimited JSON from stdin and answers on stdout. Every response
//! carries the server-issued correlation id header so operators can
//! cross-reference audit records.
//!
//! Security posture: request bodies are untrusted and size-capped before
//! parsing; denial payloads are structured, internal errors sanitized; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ConnectInfo;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use chrono::Utc;
use sentinel_gate_core::ActionContext;
use sentinel_gate_core::ActionReply;
use sentinel_gate_core::ActionType;
use sentinel_gate_core::AuditPhase;
use sentinel_gate_core::AuditRecord;
use sentinel_gate_core::CanonicalAction;
use sentinel_gate_core::CorrelationId;
use sentinel_gate_core::GateError;
use sentinel_gate_core::GatewayKind;
use sentinel_gate_core::Protocol;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

use crate::server::GatewayState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted JSON-RPC request body size.
pub const MAX_REQUEST_BYTES: usize = 2 * 1024 * 1024;
/// Response header carrying the server-issued correlation id.
pub const CORRELATION_HEADER: &str = "X-Sentinel-Correlation-Id";

/// JSON-RPC error code for structured denials.
const CODE_DENIED: i64 = -32003;
/// JSON-RPC error code for authentication failures.
const CODE_UNAUTHENTICATED: i64 = -32001;
/// JSON-RPC error code for rate limiting.
const CODE_RATE_LIMITED: i64 = -32005;
/// JSON-RPC internal error code.
const CODE_INTERNAL: i64 = -32603;
/// JSON-RPC invalid-request code.
const CODE_INVALID: i64 = -32600;
/// JSON-RPC method-not-found code.
const CODE_METHOD_NOT_FOUND: i64 = -32601;

// ============================================================================
// SECTION: JSON-RPC Envelopes
// ============================================================================

/// JSON-RPC request envelope.
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    /// Request identifier; absent for notifications.
    #[serde(default)]
    id: Option<Value>,
    /// Method name.
    method: String,
    /// Method parameters.
    #[serde(default)]
    params: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    /// Protocol version tag.
    jsonrpc: &'static str,
    /// Request identifier echoed back.
    id: Value,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl JsonRpcResponse {
    /// Builds a success response.
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    fn err(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let mut error = json!({"code": code, "message": message.into()});
        if let (Some(data), Some(slot)) = (data, error.as_object_mut()) {
            slot.insert("data".to_string(), data);
        }
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ============================================================================
// SECTION: Dispatch
// ============================================================================

/// Extracts the bearer credential from request headers.
fn bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

/// Resolves the presented credential for a pass-through method.
///
/// Returns the identity name label, `anonymous` when no credential was
/// presented. An invalid credential is a hard authentication failure.
fn authenticate_passthrough(
    state: &GatewayState,
    presented_key: Option<&str>,
) -> Result<String, ()> {
    match presented_key {
        Some(key) => state.auth.verify_key(key).map(|identity| identity.name).map_err(|_| ()),
        None => Ok("anonymous".to_string()),
    }
}

/// Emits one audit record for a method that bypasses the chain
/// (`initialize`, `tools/list`), so handshake and discovery traffic stays
/// observable. Returns the correlation id for the response header.
async fn record_passthrough(
    state: &GatewayState,
    method: &str,
    identity: &str,
    decision: &str,
) -> CorrelationId {
    let correlation_id = CorrelationId::generate();
    state
        .audit
        .record(AuditRecord {
            correlation_id: correlation_id.clone(),
            phase: AuditPhase::Exit,
            action_type: "mcp_method".to_string(),
            action_name: method.to_string(),
            identity: identity.to_string(),
            gateway: GatewayKind::McpGateway.as_str().to_string(),
            decision: Some(decision.to_string()),
            rule_id: None,
            latency_ms: None,
            scan_findings: Vec::new(),
            request_bytes: None,
            response_bytes: None,
            detail: None,
            timestamp: Utc::now(),
        })
        .await;
    correlation_id
}

/// Handles one JSON-RPC body and returns the response body (None for
/// notifications).
async fn dispatch(
    state: &Arc<GatewayState>,
    peer_ip: Option<std::net::IpAddr>,
    presented_key: Option<String>,
    body: &[u8],
) -> Option<(JsonRpcResponse, Option<String>)> {
    if body.len() > MAX_REQUEST_BYTES {
        return Some((
            JsonRpcResponse::err(Value::Null, CODE_INVALID, "request too large", None),
            None,
        ));
    }
    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return Some((
                JsonRpcResponse::err(
                    Value::Null,
                    CODE_INVALID,
                    format!("malformed json-rpc request: {err}"),
                    None,
                ),
                None,
            ));
        }
    };
    let id = request.id.clone()?;

    match request.method.as_str() {
        // Authentication and audit only for these two; no policy gate on
        // handshake or discovery.
        "initialize" => {
            let Ok(identity) = authenticate_passthrough(state, presented_key.as_deref()) else {
                let correlation =
                    record_passthrough(state, "initialize", "anonymous", "deny:unauthenticated")
                        .await;
                return Some((
                    JsonRpcResponse::err(id, CODE_UNAUTHENTICATED, "invalid credentials", None),
                    Some(correlation.to_string()),
                ));
            };
            let correlation =
                record_passthrough(state, "initialize", &identity, "pass_through").await;
            Some((
                JsonRpcResponse::ok(
                    id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "serverInfo": {
                            "name": "sentinel-gate",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                        "capabilities": {"tools": {}},
                    }),
                ),
                Some(correlation.to_string()),
            ))
        }
        "tools/list" => {
            let Ok(identity) = authenticate_passthrough(state, presented_key.as_deref()) else {
                let correlation =
                    record_passthrough(state, "tools/list", "anonymous", "deny:unauthenticated")
                        .await;
                return Some((
                    JsonRpcResponse::err(id, CODE_UNAUTHENTICATED, "invalid credentials", None),
                    Some(correlation.to_string()),
                ));
            };
            let correlation =
                record_passthrough(state, "tools/list", &identity, "pass_through").await;
            let tools: Vec<Value> = state
                .upstreams
                .all_tools()
                .into_iter()
                .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                .collect();
            Some((
                JsonRpcResponse::ok(id, json!({"tools": tools})),
                Some(correlation.to_string()),
            ))
        }
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some((
                    JsonRpcResponse::err(id, CODE_INVALID, "missing tool name", None),
                    None,
                ));
            };
            let mut action = CanonicalAction::new(
                ActionType::ToolCall,
                name,
                Protocol::Mcp,
                GatewayKind::McpGateway,
            );
            if let Some(Value::Object(arguments)) = params.get("arguments").cloned() {
                action.arguments = arguments;
            }
            let cx = ActionContext::new(peer_ip, presented_key);
            let result = state.chain.execute(&cx, action).await;
            let correlation = cx.correlation().map(|id| id.to_string());
            match result {
                Ok(ActionReply::Json(value)) => Some((
                    JsonRpcResponse::ok(id, json!({"content": [{"type": "json", "json": value}]})),
                    correlation,
                )),
                Ok(ActionReply::PassThrough) => Some((
                    JsonRpcResponse::err(id, CODE_INTERNAL, "Internal error", None),
                    correlation,
                )),
                Err(err) => Some((error_response(id, &err), correlation)),
            }
        }
        _ => Some((
            JsonRpcResponse::err(
                id,
                CODE_METHOD_NOT_FOUND,
                format!("unsupported method: {}", request.method),
                None,
            ),
            None,
        )),
    }
}

/// Maps a gate error onto the JSON-RPC error surface.
fn error_response(id: Value, err: &GateError) -> JsonRpcResponse {
    match err {
        GateError::Denied(denial) => JsonRpcResponse::err(
            id,
            CODE_DENIED,
            denial.reason.clone(),
            Some(json!({
                "code": denial.code.as_str(),
                "rule_id": denial.rule_id,
                "rule_name": denial.rule_name,
                "help_text": denial.help_text,
            })),
        ),
        GateError::RateLimited {
            retry_after,
        } => JsonRpcResponse::err(
            id,
            CODE_RATE_LIMITED,
            "rate limit exceeded",
            Some(json!({
                "retry_after_ms": u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)
            })),
        ),
        GateError::Unauthenticated => {
            JsonRpcResponse::err(id, CODE_UNAUTHENTICATED, "invalid credentials", None)
        }
        GateError::Internal(_) => JsonRpcResponse::err(id, CODE_INTERNAL, "Internal error", None),
        GateError::Timeout => JsonRpcResponse::err(id, CODE_INTERNAL, "Request timeout", None),
    }
}

// ============================================================================
// SECTION: HTTP Surface
// ============================================================================

/// Axum handler for the streamable-HTTP MCP endpoint.
pub async fn handle_mcp(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = bearer_key(&headers);
    match dispatch(&state, Some(peer.ip()), key, &body).await {
        Some((response, correlation)) => {
            let mut http_response =
                (StatusCode::OK, axum::Json(serde_json::to_value(&response).unwrap_or_default()))
                    .into_response();
            if let Some(correlation) = correlation
                && let Ok(value) = axum::http::HeaderValue::from_str(&correlation)
            {
                http_response.headers_mut().insert(CORRELATION_HEADER, value);
            }
            http_response
        }
        None => StatusCode::ACCEPTED.into_response(),
    }
}

// ============================================================================
// SECTION: Stdio Surface
// ============================================================================

/// Serves newline-delimited JSON-RPC on the process stdio.
///
/// # Errors
///
/// Returns an IO error string when stdio reads or writes fail.
pub async fn run_stdio(state: Arc<GatewayState>) -> Result<(), String> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await.map_err(|err| err.to_string())? {
        if line.trim().is_empty() {
            continue;
        }
        let Some((response, _)) = dispatch(&state, None, None, line.as_bytes()).await else {
            continue;
        };
        let serialized = serde_json::to_string(&response).map_err(|err| err.to_string())?;
        stdout
            .write_all(serialized.as_bytes())
            .await
            .map_err(|err| err.to_string())?;
        stdout.write_all(b"\n").await.map_err(|err| err.to_string())?;
        stdout.flush().await.map_err(|err| err.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "mcp/tests.rs"]
mod tests;
