// crates/sentinel-gate-gateway/src/upstream/http.rs
// ============================================================================
// Module: HTTP Upstream Client
// Description: Request-per-message client for streamable-HTTP MCP servers.
// Purpose: Bridge the byte-stream contract to one HTTP POST per message.
// Dependencies: reqwest, tokio
// ============================================================================

//! ## Overview
//! An internal pipe pair bridges the chain's byte-stream interface to one
//! HTTP POST per framed message: `send` posts the message and pushes the
//! response body into the pipe; `recv` pops it. Requests larger than the scan
//! buffer fail; responses are capped at the response limit to defend against
//! malicious upstreams. The client tracks the `Mcp-Session-Id` header by
//! echoing whatever the server last returned. TLS dials require 1.2 or
//! newer. `close` returns the client to its initial state so `start` can run
//! again (request-per-cycle flows need this).
//!
//! Security posture: upstream responses are hostile input; errors must be
//! sanitized by the caller before reaching clients; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderValue;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::MAX_RESPONSE_BYTES;
use super::MAX_SCAN_BUFFER;
use super::MessageStream;
use super::UpstreamError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Session header tracked across requests.
const SESSION_HEADER: &str = "Mcp-Session-Id";
/// Request timeout for one POST exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Depth of the internal response pipe.
const PIPE_DEPTH: usize = 32;

// ============================================================================
// SECTION: Client
// ============================================================================

/// Started-state transport resources.
struct Started {
    /// HTTP client used for POSTs.
    client: reqwest::Client,
    /// Response pipe writer.
    tx: mpsc::Sender<Vec<u8>>,
    /// Response pipe reader.
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// HTTP transport client.
pub struct HttpClient {
    /// Endpoint URL.
    endpoint: String,
    /// Started-state resources; `None` before start and after close.
    state: Mutex<Option<Started>>,
    /// Last session id the server returned.
    session_id: StdMutex<Option<String>>,
}

impl HttpClient {
    /// Creates a client for the given endpoint.
    #[must_use]
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            state: Mutex::new(None),
            session_id: StdMutex::new(None),
        }
    }

    /// Returns the last session id the server issued.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|slot| slot.clone())
    }

    /// Reads a response body while enforcing the response cap.
    async fn read_capped(response: reqwest::Response) -> Result<Vec<u8>, UpstreamError> {
        let mut response = response;
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?
        {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(UpstreamError::ResponseTooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl MessageStream for HttpClient {
    async fn start(&self) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(UpstreamError::AlreadyStarted);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        *state = Some(Started {
            client,
            tx,
            rx: Mutex::new(rx),
        });
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> Result<(), UpstreamError> {
        if message.len() > MAX_SCAN_BUFFER {
            return Err(UpstreamError::BufferExceeded {
                actual: message.len(),
            });
        }
        let guard = self.state.lock().await;
        let started = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        let mut request = started
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(message.to_vec());
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Transport(err.to_string())
            }
        })?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            && let Ok(mut slot) = self.session_id.lock()
        {
            // Echo whatever the server last returned on the next request.
            *slot = Some(session.to_string());
        }
        let status = response.status();
        let body = Self::read_capped(response).await?;
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!("http status {}", status.as_u16())));
        }
        started
            .tx
            .send(body)
            .await
            .map_err(|_| UpstreamError::Transport("response pipe closed".to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, UpstreamError> {
        let guard = self.state.lock().await;
        let started = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        let mut rx = started.rx.lock().await;
        rx.recv().await.ok_or(UpstreamError::NotConnected)
    }

    async fn close(&self) {
        *self.state.lock().await = None;
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = None;
        }
    }

    async fn died(&self) {
        // HTTP has no out-of-band death signal.
        std::future::pending::<()>().await;
    }
}
