// crates/sentinel-gate-gateway/src/upstream/tests.rs
// ============================================================================
// Module: Upstream Manager Unit Tests
// Description: Discovery, routing, failure marking, and framing bounds.
// Purpose: Validate entry behavior with scripted message streams.
// Dependencies: sentinel-gate-gateway
// ============================================================================

//! Exercises upstream entries with in-memory fake transports.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use sentinel_gate_config::UpstreamConfig;
use sentinel_gate_config::UpstreamTransport;
use serde_json::json;

use super::MAX_SCAN_BUFFER;
use super::MessageStream;
use super::UpstreamEntry;
use super::UpstreamError;
use super::UpstreamStatus;
use super::http::HttpClient;

/// Fake stream replaying scripted responses.
struct ScriptedStream {
    /// Responses returned in order.
    responses: StdMutex<VecDeque<Result<Vec<u8>, String>>>,
}

impl ScriptedStream {
    /// Creates a stream that answers with the given JSON payloads.
    fn new(responses: Vec<Result<serde_json::Value, String>>) -> Self {
        Self {
            responses: StdMutex::new(
                responses
                    .into_iter()
                    .map(|result| result.map(|value| value.to_string().into_bytes()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl MessageStream for ScriptedStream {
    async fn start(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn send(&self, _message: &[u8]) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, UpstreamError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(reason)) => Err(UpstreamError::Transport(reason)),
            None => Err(UpstreamError::Transport("script exhausted".to_string())),
        }
    }

    async fn close(&self) {}

    async fn died(&self) {
        std::future::pending::<()>().await;
    }
}

/// Builds a stdio-flavored config (the fake stream ignores it).
fn config(id: &str) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        name: id.to_string(),
        transport: UpstreamTransport::Stdio,
        endpoint: None,
        command: Some("unused".to_string()),
        args: Vec::new(),
        backoff_ceiling_secs: 1,
    }
}

/// Installs a fake client on an entry and marks it connected.
async fn install(entry: &UpstreamEntry, stream: Arc<dyn MessageStream>) {
    *entry.client.lock().await = Some(stream);
    entry.set_status(UpstreamStatus::Connected);
}

#[tokio::test]
async fn discovery_populates_the_tool_cache() {
    let entry = UpstreamEntry::new(config("files"));
    let stream = Arc::new(ScriptedStream::new(vec![Ok(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {"tools": [{"name": "read_file"}, {"name": "write_file"}]}
    }))]));
    install(&entry, stream).await;
    let count = entry.discover_tools().await.unwrap();
    assert_eq!(count, 2);
    assert!(entry.owns_tool("read_file"));
    assert!(entry.owns_tool("write_file"));
    assert!(!entry.owns_tool("fetch"));
}

#[tokio::test]
async fn transport_failure_marks_the_entry_failed() {
    let entry = UpstreamEntry::new(config("files"));
    let stream = Arc::new(ScriptedStream::new(vec![Err("pipe broke".to_string())]));
    install(&entry, stream).await;
    let err = entry.request("tools/call", None).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Transport(_)));
    assert_eq!(entry.status(), UpstreamStatus::Failed);
    assert!(entry.view().last_error.unwrap().contains("pipe broke"));
}

#[tokio::test]
async fn jsonrpc_error_payloads_become_protocol_errors() {
    let entry = UpstreamEntry::new(config("files"));
    let stream = Arc::new(ScriptedStream::new(vec![Ok(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": -32000, "message": "tool exploded"}
    }))]));
    install(&entry, stream).await;
    let err = entry.request("tools/call", None).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Protocol(_)));
    // Protocol errors are server answers, not transport failures.
    assert_eq!(entry.status(), UpstreamStatus::Connected);
}

#[tokio::test]
async fn oversized_requests_fail_the_scan_buffer() {
    let client = HttpClient::new("http://127.0.0.1:1/never".to_string());
    client.start().await.unwrap();
    let oversized = vec![b'x'; MAX_SCAN_BUFFER + 1];
    let err = client.send(&oversized).await.unwrap_err();
    assert!(matches!(err, UpstreamError::BufferExceeded { .. }));
}

#[tokio::test]
async fn http_client_start_close_is_reusable() {
    let client = HttpClient::new("http://127.0.0.1:1/never".to_string());
    client.start().await.unwrap();
    assert!(matches!(client.start().await, Err(UpstreamError::AlreadyStarted)));
    client.close().await;
    client.start().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn sanitized_messages_never_leak_detail() {
    let transport = UpstreamError::Transport("connect 10.0.0.5:9000 refused".to_string());
    assert_eq!(transport.sanitized(), "Internal error");
    assert_eq!(UpstreamError::Timeout.sanitized(), "Request timeout");
}
