// crates/sentinel-gate-gateway/src/upstream/mod.rs
// ============================================================================
// Module: Upstream Manager
// Description: Lifecycle, reconnection, and tool routing for MCP upstreams.
// Purpose: Keep one live client per upstream and route tool calls to owners.
// Dependencies: sentinel-gate-core, tokio, serde_json
// ============================================================================

//! ## Overview
//! One [`UpstreamEntry`] exists per configured upstream. A supervisor task per
//! entry drives the connect → discover → serve → reconnect loop with
//! exponential backoff capped at the configured ceiling. Tool discovery runs
//! after every connect and a periodic sweeper revisits entries with zero
//! discovered tools. The manager is the chain's terminal router: tool calls
//! resolve through the discovery cache, unknown tools are denied.
//!
//! Security posture: upstreams are untrusted; responses are size-capped and
//! transport errors are sanitized before reaching clients (raw detail goes to
//! the audit stream); see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod http;
pub mod stdio;

#[cfg(test)]
mod tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use sentinel_gate_config::UpstreamConfig;
use sentinel_gate_config::UpstreamTransport;
use sentinel_gate_core::ActionContext;
use sentinel_gate_core::ActionReply;
use sentinel_gate_core::ActionRouter;
use sentinel_gate_core::ActionType;
use sentinel_gate_core::CanonicalAction;
use sentinel_gate_core::Denial;
use sentinel_gate_core::DenialCode;
use sentinel_gate_core::GateError;
use sentinel_gate_core::UpstreamId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::Notify;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Initial scan-buffer size for message framing.
pub const INITIAL_SCAN_BUFFER: usize = 256 * 1024;
/// Maximum framed message size; larger messages fail the scan.
pub const MAX_SCAN_BUFFER: usize = 1024 * 1024;
/// Maximum upstream response size.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
/// Initial reconnect backoff.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Interval of the zero-tool discovery sweeper.
const DISCOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Upstream transport errors. Internal only; sanitize before clients.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Client is not connected.
    #[error("upstream not connected")]
    NotConnected,
    /// Start called on an already-started client.
    #[error("upstream client already started")]
    AlreadyStarted,
    /// Transport IO failed.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// Message exceeds the framing scan buffer.
    #[error("message exceeds scan buffer ({actual} > {MAX_SCAN_BUFFER})")]
    BufferExceeded {
        /// Actual message size in bytes.
        actual: usize,
    },
    /// Response exceeds the response size cap.
    #[error("response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,
    /// Request timed out.
    #[error("upstream request timed out")]
    Timeout,
    /// Protocol-level failure (bad JSON-RPC payload).
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Maps the error onto the sanitized message a client may see.
    #[must_use]
    pub const fn sanitized(&self) -> &'static str {
        match self {
            Self::Timeout => "Request timeout",
            _ => "Internal error",
        }
    }
}

// ============================================================================
// SECTION: Message Stream Contract
// ============================================================================

/// Bidirectional newline-delimited message stream.
///
/// Both transports implement this shape: stdio writes to a subprocess pipe,
/// HTTP bridges an internal pipe pair to one POST per message.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Starts the transport. Stdio may start once; HTTP is restartable after
    /// `close`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when the transport cannot be established.
    async fn start(&self) -> Result<(), UpstreamError>;

    /// Sends one framed message.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] on IO failure or oversized messages.
    async fn send(&self, message: &[u8]) -> Result<(), UpstreamError>;

    /// Receives one framed message.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] on IO failure or oversized messages.
    async fn recv(&self) -> Result<Vec<u8>, UpstreamError>;

    /// Closes the transport. Idempotent; kills any live subprocess.
    async fn close(&self);

    /// Resolves when the transport dies out-of-band (subprocess exit).
    /// Pending forever for transports without such a signal.
    async fn died(&self);
}

// ============================================================================
// SECTION: Status
// ============================================================================

/// Upstream lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and admin display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    /// No client exists.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Client is live.
    Connected,
    /// Last attempt or request failed; reconnect pending.
    Failed,
}

/// Admin view of one upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamView {
    /// Upstream identifier.
    pub id: UpstreamId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: UpstreamStatus,
    /// Last error text, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Tools discovered on the upstream.
    pub discovered_tools: Vec<String>,
}

// ============================================================================
// SECTION: Entry
// ============================================================================

/// Runtime state for one configured upstream.
pub struct UpstreamEntry {
    /// Static configuration.
    config: UpstreamConfig,
    /// Identifier derived from the configuration.
    id: UpstreamId,
    /// Current status.
    status: RwLock<UpstreamStatus>,
    /// Last error text.
    last_error: RwLock<Option<String>>,
    /// Discovered tool names.
    tools: RwLock<Vec<String>>,
    /// Live client; requests serialize through this lock.
    client: Mutex<Option<Arc<dyn MessageStream>>>,
    /// JSON-RPC id counter.
    next_id: AtomicU64,
    /// Failure notifications for the supervisor.
    failed: Notify,
    /// Shutdown flag for the supervisor loop.
    shutdown: Notify,
}

impl UpstreamEntry {
    /// Creates an entry in the disconnected state.
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        let id = UpstreamId::new(config.id.clone());
        Self {
            config,
            id,
            status: RwLock::new(UpstreamStatus::Disconnected),
            last_error: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            client: Mutex::new(None),
            next_id: AtomicU64::new(1),
            failed: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    /// Returns the upstream identifier.
    #[must_use]
    pub const fn id(&self) -> &UpstreamId {
        &self.id
    }

    /// Returns the admin view.
    #[must_use]
    pub fn view(&self) -> UpstreamView {
        UpstreamView {
            id: self.id.clone(),
            name: self.config.name.clone(),
            status: self.status(),
            last_error: self.last_error.read().ok().and_then(|slot| slot.clone()),
            discovered_tools: self.tools.read().map(|tools| tools.clone()).unwrap_or_default(),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> UpstreamStatus {
        self.status.read().map(|status| *status).unwrap_or(UpstreamStatus::Disconnected)
    }

    /// Records a status transition.
    fn set_status(&self, status: UpstreamStatus) {
        if let Ok(mut slot) = self.status.write() {
            *slot = status;
        }
    }

    /// Records the last error.
    fn set_error(&self, error: Option<String>) {
        if let Ok(mut slot) = self.last_error.write() {
            *slot = error;
        }
    }

    /// Returns true when the entry's tool cache names the tool.
    fn owns_tool(&self, tool: &str) -> bool {
        self.tools.read().map(|tools| tools.iter().any(|t| t == tool)).unwrap_or(false)
    }

    /// Builds a transport client for the configuration.
    fn build_client(&self) -> Arc<dyn MessageStream> {
        match self.config.transport {
            UpstreamTransport::Stdio => Arc::new(stdio::StdioClient::new(
                self.config.command.clone().unwrap_or_default(),
                self.config.args.clone(),
            )),
            UpstreamTransport::Http => Arc::new(http::HttpClient::new(
                self.config.endpoint.clone().unwrap_or_default(),
            )),
        }
    }

    /// Sends one JSON-RPC request and awaits its response on the live client.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] when no client is live or the exchange
    /// fails; failures also notify the supervisor.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload =
            serde_json::to_vec(&request).map_err(|err| UpstreamError::Protocol(err.to_string()))?;

        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref().map(Arc::clone) else {
            return Err(UpstreamError::NotConnected);
        };
        let result = async {
            client.send(&payload).await?;
            client.recv().await
        }
        .await;
        drop(guard);

        let response_bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                self.set_status(UpstreamStatus::Failed);
                self.set_error(Some(err.to_string()));
                self.failed.notify_one();
                return Err(err);
            }
        };
        let response: Value = serde_json::from_slice(&response_bytes)
            .map_err(|err| UpstreamError::Protocol(err.to_string()))?;
        if let Some(error) = response.get("error") {
            return Err(UpstreamError::Protocol(error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Runs tool discovery, replacing the cache on success.
    async fn discover_tools(&self) -> Result<usize, UpstreamError> {
        let result = self.request("tools/list", None).await?;
        let names: Vec<String> = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let count = names.len();
        if let Ok(mut tools) = self.tools.write() {
            *tools = names;
        }
        Ok(count)
    }
}

// ============================================================================
// SECTION: Supervisor
// ============================================================================

/// Connect/serve/reconnect loop for one entry.
async fn supervise(entry: Arc<UpstreamEntry>) {
    let ceiling = Duration::from_secs(entry.config.backoff_ceiling_secs.max(1));
    let mut backoff = INITIAL_BACKOFF;
    loop {
        entry.set_status(UpstreamStatus::Connecting);
        let client = entry.build_client();
        if let Err(err) = client.start().await {
            entry.set_status(UpstreamStatus::Failed);
            entry.set_error(Some(err.to_string()));
            tracing::warn!(upstream = %entry.id, error = %err, "upstream connect failed");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = entry.shutdown.notified() => return,
            }
            backoff = (backoff * 2).min(ceiling);
            continue;
        }
        {
            let mut guard = entry.client.lock().await;
            *guard = Some(Arc::clone(&client));
        }
        entry.set_status(UpstreamStatus::Connected);
        entry.set_error(None);
        backoff = INITIAL_BACKOFF;

        match entry.discover_tools().await {
            Ok(count) => {
                tracing::info!(upstream = %entry.id, tools = count, "upstream connected");
            }
            Err(err) => {
                // Discovery failure is non-fatal; the sweeper retries later.
                tracing::warn!(upstream = %entry.id, error = %err, "tool discovery failed");
            }
        }
        if entry.status() == UpstreamStatus::Connected {
            tokio::select! {
                () = entry.failed.notified() => {}
                () = client.died() => {
                    entry.set_status(UpstreamStatus::Failed);
                    entry.set_error(Some("upstream transport exited".to_string()));
                }
                () = entry.shutdown.notified() => {
                    client.close().await;
                    let mut guard = entry.client.lock().await;
                    *guard = None;
                    return;
                }
            }
        }
        client.close().await;
        {
            let mut guard = entry.client.lock().await;
            *guard = None;
        }
        tracing::warn!(upstream = %entry.id, "upstream failed; reconnecting");
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = entry.shutdown.notified() => return,
        }
        backoff = (backoff * 2).min(ceiling);
    }
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Upstream manager and terminal router.
pub struct UpstreamManager {
    /// Entries keyed by upstream id.
    entries: RwLock<HashMap<UpstreamId, Arc<UpstreamEntry>>>,
}

impl Default for UpstreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Adds an upstream and spawns its supervisor. Replaces an existing entry
    /// with the same id (the old supervisor is shut down).
    pub fn add(&self, config: UpstreamConfig) -> Arc<UpstreamEntry> {
        let entry = Arc::new(UpstreamEntry::new(config));
        if let Ok(mut entries) = self.entries.write() {
            if let Some(previous) = entries.insert(entry.id().clone(), Arc::clone(&entry)) {
                previous.shutdown.notify_waiters();
            }
        }
        tokio::spawn(supervise(Arc::clone(&entry)));
        entry
    }

    /// Removes an upstream, shutting its supervisor down. Returns true when
    /// found.
    pub fn remove(&self, id: &UpstreamId) -> bool {
        let removed = self
            .entries
            .write()
            .ok()
            .and_then(|mut entries| entries.remove(id));
        removed.inspect(|entry| entry.shutdown.notify_waiters()).is_some()
    }

    /// Returns the admin view of every upstream.
    #[must_use]
    pub fn list(&self) -> Vec<UpstreamView> {
        self.entries
            .read()
            .map(|entries| entries.values().map(|entry| entry.view()).collect())
            .unwrap_or_default()
    }

    /// Returns the entry owning a tool, consulting the discovery cache.
    #[must_use]
    pub fn owner_of(&self, tool: &str) -> Option<Arc<UpstreamEntry>> {
        self.entries
            .read()
            .ok()?
            .values()
            .find(|entry| entry.owns_tool(tool))
            .map(Arc::clone)
    }

    /// Returns every discovered tool name across upstreams.
    #[must_use]
    pub fn all_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self
            .entries
            .read()
            .map(|entries| {
                entries
                    .values()
                    .flat_map(|entry| {
                        entry.tools.read().map(|tools| tools.clone()).unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        tools.sort_unstable();
        tools.dedup();
        tools
    }

    /// Spawns the zero-tool discovery sweeper.
    pub fn spawn_discovery_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISCOVERY_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let entries: Vec<Arc<UpstreamEntry>> = manager
                    .entries
                    .read()
                    .map(|entries| entries.values().map(Arc::clone).collect())
                    .unwrap_or_default();
                for entry in entries {
                    let empty =
                        entry.tools.read().map(|tools| tools.is_empty()).unwrap_or(true);
                    if empty && entry.status() == UpstreamStatus::Connected {
                        if let Err(err) = entry.discover_tools().await {
                            tracing::debug!(upstream = %entry.id, error = %err, "discovery retry failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ActionRouter for UpstreamManager {
    async fn dispatch(
        &self,
        _cx: &ActionContext,
        action: &CanonicalAction,
    ) -> Result<ActionReply, GateError> {
        match action.action_type {
            ActionType::ToolCall => {
                let Some(entry) = self.owner_of(&action.name) else {
                    return Err(GateError::Denied(Denial::new(
                        DenialCode::UnknownTool,
                        "unknown tool",
                    )));
                };
                let params = json!({
                    "name": action.name,
                    "arguments": Value::Object(action.arguments.clone()),
                });
                match entry.request("tools/call", Some(params)).await {
                    Ok(result) => Ok(ActionReply::Json(result)),
                    Err(err @ UpstreamError::Timeout) => {
                        tracing::warn!(upstream = %entry.id, error = %err, "upstream call timed out");
                        Err(GateError::Timeout)
                    }
                    Err(err) => {
                        tracing::warn!(upstream = %entry.id, error = %err, "upstream call failed");
                        Err(GateError::Internal(err.to_string()))
                    }
                }
            }
            // The transport layer forwards HTTP requests itself once the
            // chain admits them.
            ActionType::HttpRequest => Ok(ActionReply::PassThrough),
            ActionType::FileAccess | ActionType::CommandExec => {
                // Runtime-hook actions carry no upstream; an admitted action
                // simply reports the decision back to the hook.
                Ok(ActionReply::Json(json!({"decision": "allow"})))
            }
        }
    }
}
