// crates/sentinel-gate-gateway/tests/http_client_bounds.rs
// ============================================================================
// Module: HTTP Client Bounds Tests
// Description: Response cap and session-id echo against a stub server.
// Purpose: Validate the upstream HTTP client against hostile responses.
// Dependencies: sentinel-gate-gateway, tiny_http
// ============================================================================

//! Exercises the HTTP upstream client against a local `tiny_http` stub.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::sync::Arc;
use std::thread;

use sentinel_gate_gateway::upstream::MAX_RESPONSE_BYTES;
use sentinel_gate_gateway::upstream::MessageStream;
use sentinel_gate_gateway::upstream::UpstreamError;
use sentinel_gate_gateway::upstream::http::HttpClient;

/// Spawns a one-shot stub server; each closure answers one request.
fn spawn_stub(
    responders: Vec<Box<dyn FnOnce(tiny_http::Request) + Send>>,
) -> (String, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = format!("http://{}/mcp", server.server_addr());
    let handle = thread::spawn(move || {
        for responder in responders {
            match server.recv() {
                Ok(request) => responder(request),
                Err(_) => return,
            }
        }
    });
    (addr, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_responses_are_rejected_at_the_cap() {
    let (endpoint, server) = spawn_stub(vec![Box::new(|request: tiny_http::Request| {
        let oversized = vec![b'a'; MAX_RESPONSE_BYTES + 1];
        let response = tiny_http::Response::from_data(oversized);
        let _ = request.respond(response);
    })]);

    let client = HttpClient::new(endpoint);
    client.start().await.unwrap();
    client.send(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}").await.map_or_else(
        |err| {
            assert!(matches!(err, UpstreamError::ResponseTooLarge));
        },
        |()| panic!("oversized response must be rejected"),
    );
    client.close().await;
    server.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_id_echoes_the_last_server_value() {
    let responder = |session: &'static str| {
        Box::new(move |request: tiny_http::Request| {
            let header =
                tiny_http::Header::from_bytes(&b"Mcp-Session-Id"[..], session.as_bytes()).unwrap();
            let response = tiny_http::Response::from_string("{}").with_header(header);
            let _ = request.respond(response);
        }) as Box<dyn FnOnce(tiny_http::Request) + Send>
    };
    let (endpoint, server) = spawn_stub(vec![responder("alpha"), responder("beta")]);

    let client = Arc::new(HttpClient::new(endpoint));
    client.start().await.unwrap();
    client.send(b"{}").await.unwrap();
    let _ = client.recv().await.unwrap();
    assert_eq!(client.session_id().as_deref(), Some("alpha"));
    client.send(b"{}").await.unwrap();
    let _ = client.recv().await.unwrap();
    // The stored id is overwritten with whatever the server last returned.
    assert_eq!(client.session_id().as_deref(), Some("beta"));
    client.close().await;
    assert!(client.session_id().is_none());
    server.join().unwrap();
}
