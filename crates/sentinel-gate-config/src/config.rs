// crates/sentinel-gate-config/src/config.rs
// ============================================================================
// Module: SentinelGate Configuration
// Description: Configuration loading and validation for the gateway.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: sentinel-gate-core, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits. Missing
//! or invalid configuration fails closed. Every limit has a documented
//! default so an empty file yields a working loopback-only gateway.
//! Security posture: config inputs are untrusted; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use sentinel_gate_core::RateLimitConfig;
use sentinel_gate_core::ScanMode;
use sentinel_gate_core::ScanPattern;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "SENTINEL_GATE_CONFIG";
/// Environment variable used to override the state path.
pub const STATE_PATH_ENV_VAR: &str = "SENTINEL_GATE_STATE_PATH";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
/// Maximum number of configuration-file API keys.
const MAX_CONFIG_API_KEYS: usize = 64;
/// Maximum number of configured upstreams.
const MAX_UPSTREAMS: usize = 64;
/// Minimum CEL evaluation timeout in milliseconds.
const MIN_EVAL_TIMEOUT_MS: u64 = 100;
/// Maximum CEL evaluation timeout in milliseconds.
const MAX_EVAL_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
///
/// # Invariants
/// - Every variant names the offending field or file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("config read failed for {path}: {reason}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// IO error text.
        reason: String,
    },
    /// File exceeds the size limit.
    #[error("config file {path} exceeds {MAX_CONFIG_FILE_SIZE} bytes")]
    TooLarge {
        /// Offending path.
        path: PathBuf,
    },
    /// TOML parsing failed.
    #[error("config parse failed: {0}")]
    Parse(String),
    /// A field failed validation.
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Root SentinelGate configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SentinelConfig {
    /// Server bind and shutdown settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Rate-limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    /// Audit pipeline settings.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Policy evaluator limits.
    #[serde(default)]
    pub policy: PolicyLimitsConfig,
    /// Approval manager settings.
    #[serde(default)]
    pub approvals: ApprovalConfig,
    /// Response scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Configured MCP upstreams.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// TLS inspection settings.
    #[serde(default)]
    pub tls_inspection: TlsInspectionConfig,
    /// Persisted state path override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

/// Server bind and shutdown settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Gateway bind address (MCP + admin + decision API).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// HTTP proxy bind address.
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: SocketAddr,
    /// Allow binding to non-loopback addresses.
    #[serde(default)]
    pub allow_non_loopback: bool,
    /// Grace period for in-flight actions on shutdown, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            proxy_addr: default_proxy_addr(),
            allow_non_loopback: false,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Session idle timeout in seconds.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// Session sweeper interval in seconds.
    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,
    /// Configuration-file API keys (legacy digest path).
    #[serde(default)]
    pub api_keys: Vec<ConfigApiKey>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_idle_secs: default_session_idle_secs(),
            session_sweep_secs: default_session_sweep_secs(),
            api_keys: Vec::new(),
        }
    }
}

/// One configuration-file API key pinned by digest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigApiKey {
    /// Identity name the key authenticates as.
    pub identity: String,
    /// Roles granted to the identity.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Key digest in `sha256:<hex>` form (see `sentinel-gate hash-key`).
    pub key_hash: String,
}

/// Rate-limit settings for both limiter classes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSection {
    /// Per-client-IP limiter.
    #[serde(default)]
    pub ip: RateLimitConfig,
    /// Per-identity limiter.
    #[serde(default)]
    pub identity: RateLimitConfig,
    /// Idle-bucket sweep interval in seconds.
    #[serde(default = "default_rate_sweep_secs")]
    pub sweep_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            ip: RateLimitConfig::default(),
            identity: RateLimitConfig::default(),
            sweep_secs: default_rate_sweep_secs(),
        }
    }
}

/// Audit pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Whether audit records are produced.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Channel capacity in records.
    #[serde(default = "default_audit_channel_size")]
    pub channel_size: usize,
    /// Maximum records per flushed batch.
    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,
    /// Flush interval in milliseconds.
    #[serde(default = "default_audit_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Producer send timeout in milliseconds.
    #[serde(default = "default_audit_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Queue-depth percentage that triggers a saturation warning.
    #[serde(default = "default_audit_warning_threshold")]
    pub warning_threshold: u8,
    /// In-memory retention for admin queries, in records.
    #[serde(default = "default_audit_memory_records")]
    pub memory_records: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_size: default_audit_channel_size(),
            batch_size: default_audit_batch_size(),
            flush_interval_ms: default_audit_flush_interval_ms(),
            send_timeout_ms: default_audit_send_timeout_ms(),
            warning_threshold: default_audit_warning_threshold(),
            memory_records: default_audit_memory_records(),
        }
    }
}

/// Policy evaluator limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyLimitsConfig {
    /// Maximum condition source length in characters.
    #[serde(default = "default_max_source_len")]
    pub max_source_len: usize,
    /// Maximum bracket nesting depth.
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,
    /// Evaluation cost budget in abstract units.
    #[serde(default = "default_cost_budget")]
    pub cost_budget: u64,
    /// Wall-clock evaluation timeout in milliseconds.
    #[serde(default = "default_eval_timeout_ms")]
    pub eval_timeout_ms: u64,
}

impl Default for PolicyLimitsConfig {
    fn default() -> Self {
        Self {
            max_source_len: default_max_source_len(),
            max_nesting: default_max_nesting(),
            cost_budget: default_cost_budget(),
            eval_timeout_ms: default_eval_timeout_ms(),
        }
    }
}

/// Approval manager settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalConfig {
    /// Maximum simultaneous pending requests.
    #[serde(default = "default_approval_capacity")]
    pub capacity: usize,
    /// Expiry sweeper interval in seconds.
    #[serde(default = "default_approval_sweep_secs")]
    pub sweep_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            capacity: default_approval_capacity(),
            sweep_secs: default_approval_sweep_secs(),
        }
    }
}

/// Response scanner settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Scanner operating mode.
    #[serde(default = "default_scan_mode")]
    pub mode: ScanMode,
    /// Extra patterns appended to the built-in set.
    #[serde(default)]
    pub extra_patterns: Vec<ScanPattern>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: default_scan_mode(),
            extra_patterns: Vec::new(),
        }
    }
}

/// Upstream transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamTransport {
    /// Subprocess speaking newline-delimited JSON-RPC on stdio.
    Stdio,
    /// Streamable HTTP JSON-RPC endpoint.
    Http,
}

/// One configured MCP upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Transport kind.
    pub transport: UpstreamTransport,
    /// HTTP endpoint URL (http transport only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Command to launch (stdio transport only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio transport only).
    #[serde(default)]
    pub args: Vec<String>,
    /// Reconnect backoff ceiling in seconds.
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
}

/// TLS inspection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsInspectionConfig {
    /// Whether CONNECT streams are terminated and inspected.
    #[serde(default)]
    pub enabled: bool,
    /// Local root CA certificate path (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
    /// Local root CA key path (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_path: Option<PathBuf>,
    /// Leaf certificate lifetime in seconds.
    #[serde(default = "default_leaf_ttl_secs")]
    pub leaf_ttl_secs: u64,
}

impl Default for TlsInspectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            ca_key_path: None,
            leaf_ttl_secs: default_leaf_ttl_secs(),
        }
    }
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl SentinelConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, oversized,
    /// unparseable, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let metadata = fs::metadata(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let config: Self =
            toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every field against its documented bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.api_keys.len() > MAX_CONFIG_API_KEYS {
            return Err(ConfigError::Invalid {
                field: "auth.api_keys",
                reason: format!("at most {MAX_CONFIG_API_KEYS} keys"),
            });
        }
        for key in &self.auth.api_keys {
            if !key.key_hash.starts_with("sha256:") || key.key_hash.len() != "sha256:".len() + 64 {
                return Err(ConfigError::Invalid {
                    field: "auth.api_keys.key_hash",
                    reason: "expected sha256:<64 hex chars>".to_string(),
                });
            }
            if key.identity.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "auth.api_keys.identity",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.policy.eval_timeout_ms < MIN_EVAL_TIMEOUT_MS
            || self.policy.eval_timeout_ms > MAX_EVAL_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid {
                field: "policy.eval_timeout_ms",
                reason: format!("must be within {MIN_EVAL_TIMEOUT_MS}..={MAX_EVAL_TIMEOUT_MS}"),
            });
        }
        if self.policy.max_source_len == 0 || self.policy.cost_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "policy",
                reason: "limits must be non-zero".to_string(),
            });
        }
        if self.approvals.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "approvals.capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.audit.warning_threshold > 100 {
            return Err(ConfigError::Invalid {
                field: "audit.warning_threshold",
                reason: "percentage must be 0..=100".to_string(),
            });
        }
        if self.upstreams.len() > MAX_UPSTREAMS {
            return Err(ConfigError::Invalid {
                field: "upstreams",
                reason: format!("at most {MAX_UPSTREAMS} upstreams"),
            });
        }
        for upstream in &self.upstreams {
            match upstream.transport {
                UpstreamTransport::Http if upstream.endpoint.is_none() => {
                    return Err(ConfigError::Invalid {
                        field: "upstreams.endpoint",
                        reason: format!("upstream {} requires an endpoint", upstream.id),
                    });
                }
                UpstreamTransport::Stdio if upstream.command.is_none() => {
                    return Err(ConfigError::Invalid {
                        field: "upstreams.command",
                        reason: format!("upstream {} requires a command", upstream.id),
                    });
                }
                _ => {}
            }
        }
        if self.tls_inspection.enabled
            && (self.tls_inspection.ca_cert_path.is_none()
                || self.tls_inspection.ca_key_path.is_none())
        {
            return Err(ConfigError::Invalid {
                field: "tls_inspection",
                reason: "enabled inspection requires ca_cert_path and ca_key_path".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Default gateway bind address.
fn default_bind_addr() -> SocketAddr {
    #[allow(clippy::unwrap_used, reason = "Literal address always parses.")]
    "127.0.0.1:8400".parse().unwrap()
}

/// Default HTTP proxy bind address.
fn default_proxy_addr() -> SocketAddr {
    #[allow(clippy::unwrap_used, reason = "Literal address always parses.")]
    "127.0.0.1:8401".parse().unwrap()
}

/// Default shutdown grace in milliseconds.
const fn default_shutdown_grace_ms() -> u64 {
    10_000
}

/// Default session idle timeout in seconds.
const fn default_session_idle_secs() -> u64 {
    1800
}

/// Default session sweeper interval in seconds.
const fn default_session_sweep_secs() -> u64 {
    60
}

/// Default rate-limit sweep interval in seconds.
const fn default_rate_sweep_secs() -> u64 {
    300
}

/// Default `true` helper for serde.
const fn default_true() -> bool {
    true
}

/// Default audit channel size.
const fn default_audit_channel_size() -> usize {
    1000
}

/// Default audit batch size.
const fn default_audit_batch_size() -> usize {
    100
}

/// Default audit flush interval in milliseconds.
const fn default_audit_flush_interval_ms() -> u64 {
    1000
}

/// Default audit send timeout in milliseconds.
const fn default_audit_send_timeout_ms() -> u64 {
    100
}

/// Default audit warning threshold percentage.
const fn default_audit_warning_threshold() -> u8 {
    80
}

/// Default in-memory audit retention in records.
const fn default_audit_memory_records() -> usize {
    10_000
}

/// Default maximum CEL source length.
const fn default_max_source_len() -> usize {
    1024
}

/// Default maximum CEL nesting depth.
const fn default_max_nesting() -> usize {
    50
}

/// Default CEL cost budget.
const fn default_cost_budget() -> u64 {
    100_000
}

/// Default CEL evaluation timeout in milliseconds.
const fn default_eval_timeout_ms() -> u64 {
    5000
}

/// Default approval capacity.
const fn default_approval_capacity() -> usize {
    100
}

/// Default approval sweeper interval in seconds.
const fn default_approval_sweep_secs() -> u64 {
    1
}

/// Default scanner mode.
const fn default_scan_mode() -> ScanMode {
    ScanMode::Disabled
}

/// Default reconnect backoff ceiling in seconds.
const fn default_backoff_ceiling_secs() -> u64 {
    60
}

/// Default leaf certificate lifetime in seconds.
const fn default_leaf_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    //! Configuration validation unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    #[test]
    fn empty_config_validates_with_defaults() {
        let config: SentinelConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind_addr.port(), 8400);
        assert!(!config.server.allow_non_loopback);
        assert_eq!(config.audit.channel_size, 1000);
        assert_eq!(config.policy.cost_budget, 100_000);
    }

    #[test]
    fn malformed_key_hash_is_rejected() {
        let config: SentinelConfig = toml::from_str(
            r#"
            [[auth.api_keys]]
            identity = "ops"
            key_hash = "plaintext-key"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth.api_keys.key_hash"));
    }

    #[test]
    fn http_upstream_requires_endpoint() {
        let config: SentinelConfig = toml::from_str(
            r#"
            [[upstreams]]
            id = "u1"
            name = "files"
            transport = "http"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn enabled_tls_inspection_requires_ca_material() {
        let config: SentinelConfig = toml::from_str(
            r#"
            [tls_inspection]
            enabled = true
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
