// crates/sentinel-gate-core/src/action.rs
// ============================================================================
// Module: Canonical Action Model
// Description: Unified action shape flowing through the interceptor chain.
// Purpose: Represent every agent action identically regardless of ingress.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every inbound request (MCP tool call, proxied HTTP request, file access or
//! command execution reported by a runtime hook) is translated into a
//! [`CanonicalAction`] exactly once on entry. All pipeline stages consume this
//! shape and nothing else; ingresses translate back on exit.
//!
//! Security posture: every field originates from an untrusted client; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::ids::CorrelationId;
use crate::ids::IdentityId;

// ============================================================================
// SECTION: Action Classification
// ============================================================================

/// Kind of action being requested.
///
/// # Invariants
/// - Variants are stable for serialization and policy activation labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// MCP tool invocation.
    ToolCall,
    /// Outbound HTTP request.
    HttpRequest,
    /// File read/write/delete reported by a runtime hook.
    FileAccess,
    /// Subprocess execution reported by a runtime hook.
    CommandExec,
}

impl ActionType {
    /// Returns the stable wire label for the action type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::HttpRequest => "http_request",
            Self::FileAccess => "file_access",
            Self::CommandExec => "command_exec",
        }
    }
}

/// Protocol the action originated on.
///
/// # Invariants
/// - Variants are stable for serialization and policy activation labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// MCP JSON-RPC.
    Mcp,
    /// Plain HTTP.
    Http,
    /// WebSocket upgrade.
    Websocket,
    /// In-process runtime hook.
    Runtime,
}

impl Protocol {
    /// Returns the stable wire label for the protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mcp => "mcp",
            Self::Http => "http",
            Self::Websocket => "websocket",
            Self::Runtime => "runtime",
        }
    }
}

/// Ingress that admitted the action.
///
/// # Invariants
/// - Variants are stable for serialization and policy activation labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayKind {
    /// The MCP JSON-RPC endpoint.
    McpGateway,
    /// The HTTP forward/reverse proxy.
    HttpGateway,
    /// The decision API used by runtime hooks.
    Runtime,
}

impl GatewayKind {
    /// Returns the stable wire label for the ingress.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::McpGateway => "mcp-gateway",
            Self::HttpGateway => "http-gateway",
            Self::Runtime => "runtime",
        }
    }
}

// ============================================================================
// SECTION: Identity
// ============================================================================

/// Authenticated identity attached to an action.
///
/// # Invariants
/// - Roles are compared by exact string match; order is not significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Identity identifier.
    pub id: IdentityId,
    /// Display name.
    pub name: String,
    /// Granted roles.
    pub roles: Vec<String>,
}

impl Identity {
    /// Returns the anonymous identity used before authentication.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: IdentityId::new("anonymous"),
            name: "anonymous".to_string(),
            roles: Vec::new(),
        }
    }

    /// Returns true when the identity carries the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|candidate| candidate == role)
    }

    /// Returns true when this is the anonymous placeholder identity.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.id.as_str() == "anonymous"
    }
}

// ============================================================================
// SECTION: Destination
// ============================================================================

/// Network or filesystem destination of an action.
///
/// # Invariants
/// - `ip` is set only when the host was an IP literal or after DNS pinning.
/// - `port` of zero means "not specified"; use [`Destination::effective_port`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Full destination URL when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Destination domain name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Destination IP literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Destination port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// URL scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// URL path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Executable path for command actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Destination {
    /// Returns the effective port, defaulting from the scheme.
    ///
    /// Missing ports default to 443 for `https`/`wss` and 80 otherwise.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        match self.scheme.as_deref() {
            Some("https" | "wss") => 443,
            _ => 80,
        }
    }

    /// Returns the host label for reporting (domain, else IP, else empty).
    #[must_use]
    pub fn host_label(&self) -> &str {
        self.domain.as_deref().or(self.ip.as_deref()).unwrap_or("")
    }
}

// ============================================================================
// SECTION: Canonical Action
// ============================================================================

/// The pivot type flowing through the interceptor chain.
///
/// # Invariants
/// - `identity` is anonymous until the authentication stage resolves it.
/// - `correlation_id` is assigned by the audit-enter stage exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalAction {
    /// Kind of action.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Action-specific verb: tool name, HTTP method, file operation, or
    /// executable path.
    pub name: String,
    /// Action arguments.
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Identity attached by authentication.
    pub identity: Identity,
    /// Origin protocol.
    pub protocol: Protocol,
    /// Detected framework label when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Ingress that admitted the action.
    pub gateway: GatewayKind,
    /// Destination when the action targets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    /// Correlation identifier, assigned on admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl CanonicalAction {
    /// Creates an anonymous action with the minimum required fields.
    #[must_use]
    pub fn new(
        action_type: ActionType,
        name: impl Into<String>,
        protocol: Protocol,
        gateway: GatewayKind,
    ) -> Self {
        Self {
            action_type,
            name: name.into(),
            arguments: Map::new(),
            identity: Identity::anonymous(),
            protocol,
            framework: None,
            gateway,
            destination: None,
            correlation_id: None,
        }
    }

    /// Returns an argument value by key.
    #[must_use]
    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }

    /// Returns the serialized byte size of the arguments map.
    ///
    /// Used by the validation stage for size caps; serialization of a JSON
    /// map cannot fail, so a failure is treated as an oversized payload.
    #[must_use]
    pub fn arguments_size(&self) -> usize {
        serde_json::to_vec(&self.arguments).map_or(usize::MAX, |bytes| bytes.len())
    }
}

// ============================================================================
// SECTION: Action Reply
// ============================================================================

/// Result of a fully processed action, flowing back through the chain.
///
/// # Invariants
/// - `PassThrough` is produced only for HTTP-gateway actions and instructs the
///   transport layer to forward the original request itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReply {
    /// JSON payload returned by the upstream (tool result, decision body).
    Json(Value),
    /// Transport-level pass-through signal for the HTTP gateway.
    PassThrough,
}

impl ActionReply {
    /// Returns the JSON payload when present.
    #[must_use]
    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::PassThrough => None,
        }
    }
}

#[cfg(test)]
mod tests {
    //! Canonical action model unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    #[test]
    fn effective_port_defaults_from_scheme() {
        let mut dest = Destination {
            scheme: Some("https".to_string()),
            ..Destination::default()
        };
        assert_eq!(dest.effective_port(), 443);
        dest.scheme = Some("http".to_string());
        assert_eq!(dest.effective_port(), 80);
        dest.port = Some(8443);
        assert_eq!(dest.effective_port(), 8443);
    }

    #[test]
    fn anonymous_identity_has_no_roles() {
        let identity = Identity::anonymous();
        assert!(identity.is_anonymous());
        assert!(!identity.has_role("admin"));
    }

    #[test]
    fn action_type_labels_are_stable() {
        assert_eq!(ActionType::ToolCall.as_str(), "tool_call");
        assert_eq!(ActionType::CommandExec.as_str(), "command_exec");
        let json = serde_json::to_string(&ActionType::HttpRequest).unwrap();
        assert_eq!(json, "\"http_request\"");
    }

    #[test]
    fn gateway_labels_use_kebab_case() {
        let json = serde_json::to_string(&GatewayKind::McpGateway).unwrap();
        assert_eq!(json, "\"mcp-gateway\"");
        assert_eq!(GatewayKind::HttpGateway.as_str(), "http-gateway");
    }
}
