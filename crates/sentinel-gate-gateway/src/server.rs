// crates/sentinel-gate-gateway/src/server.rs
// ============================================================================
// Module: Gateway Server
// Description: State assembly, router construction, lifecycle, signals.
// Purpose: Build the runtime once and serve both ingress surfaces.
// Dependencies: axum, sentinel-gate-config, sentinel-gate-core, tokio
// ============================================================================

//! ## Overview
//! `build_state` wires every store, the chain, the upstream manager, and the
//! background sweepers from configuration plus the persisted state document.
//! `run` serves the gateway (MCP + admin + decision API) and the HTTP proxy,
//! writes the PID file, and handles signals: the first graceful signal stops
//! accepting new work and drains in-flight actions within the configured
//! grace period; a second signal aborts immediately.
//!
//! Security posture: binds loopback-only unless explicitly configured
//! otherwise; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use sentinel_gate_config::SentinelConfig;
use sentinel_gate_config::StateDocument;
use sentinel_gate_config::StateStore;
use sentinel_gate_core::AgentRegistry;
use sentinel_gate_core::ApprovalManager;
use sentinel_gate_core::AuditService;
use sentinel_gate_core::AuditServiceConfig;
use sentinel_gate_core::AuditSink;
use sentinel_gate_core::AuthStore;
use sentinel_gate_core::ChainComponents;
use sentinel_gate_core::EvalLimits;
use sentinel_gate_core::Identity;
use sentinel_gate_core::IdentityId;
use sentinel_gate_core::InterceptorChain;
use sentinel_gate_core::MemoryAuditSink;
use sentinel_gate_core::OutboundAction;
use sentinel_gate_core::OutboundEngine;
use sentinel_gate_core::OutboundMatch;
use sentinel_gate_core::OutboundRule;
use sentinel_gate_core::OutboundRuleId;
use sentinel_gate_core::OutboundStore;
use sentinel_gate_core::PolicyEvaluator;
use sentinel_gate_core::PolicyStore;
use sentinel_gate_core::QuarantineRegistry;
use sentinel_gate_core::RateLimitService;
use sentinel_gate_core::ScanControl;
use sentinel_gate_core::SessionStore;
use sentinel_gate_core::SystemDnsResolver;
use sentinel_gate_core::ValidationConfig;
use sentinel_gate_core::build_chain;
use sentinel_gate_core::default_patterns;
use thiserror::Error;
use tokio::sync::Notify;

use crate::admin;
use crate::mcp;
use crate::tlsca::TlsAuthority;
use crate::upstream::UpstreamManager;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Gateway bootstrap and serve errors.
///
/// # Invariants
/// - Variants are stable for CLI error mapping.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Persisted state failed to load or seed.
    #[error("state error: {0}")]
    State(String),
    /// Policy or rule material failed registration.
    #[error("policy registration failed: {0}")]
    Policy(String),
    /// TLS inspection material failed to load.
    #[error("tls authority error: {0}")]
    Tls(String),
    /// Socket bind or serve failed.
    #[error("serve failed: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Gateway State
// ============================================================================

/// Everything the handlers share.
pub struct GatewayState {
    /// Loaded configuration.
    pub config: SentinelConfig,
    /// The assembled chain.
    pub chain: InterceptorChain,
    /// Identity and key store.
    pub auth: Arc<AuthStore>,
    /// Session store.
    pub sessions: Arc<SessionStore>,
    /// Policy store.
    pub policies: Arc<PolicyStore>,
    /// Policy evaluator (decision API path).
    pub evaluator: Arc<PolicyEvaluator>,
    /// Outbound rule store.
    pub outbound: Arc<OutboundStore>,
    /// Outbound engine (decision API path).
    pub outbound_engine: Arc<OutboundEngine>,
    /// Approval manager.
    pub approvals: Arc<ApprovalManager>,
    /// Tool quarantine registry.
    pub quarantine: Arc<QuarantineRegistry>,
    /// Shared scanner control.
    pub scan: ScanControl,
    /// Audit producer handle.
    pub audit: AuditService,
    /// In-memory audit retention for admin queries.
    pub audit_memory: Arc<MemoryAuditSink>,
    /// Supervised-agent registry.
    pub agents: Arc<AgentRegistry>,
    /// Upstream manager / terminal router.
    pub upstreams: Arc<UpstreamManager>,
    /// Persisted state store, when configured.
    pub state_store: Option<Mutex<StateStore>>,
    /// Live CSRF tokens.
    pub csrf_tokens: Mutex<HashSet<String>>,
    /// Reverse-proxy targets.
    pub http_targets: RwLock<Vec<sentinel_gate_config::ReverseProxyTarget>>,
    /// TLS inspection authority when enabled.
    pub tls: Option<Arc<TlsAuthority>>,
    /// Shutdown notifier (first graceful signal).
    pub shutdown: Arc<Notify>,
}

impl GatewayState {
    /// Persists the current stores into the state document.
    pub fn persist(&self) {
        let Some(store) = &self.state_store else {
            return;
        };
        let document = StateDocument {
            version: 0,
            identities: self.auth.list_identities(),
            api_keys: self.auth.list_keys(),
            policies: self.policies.list(),
            upstreams: self.config.upstreams.clone(),
            outbound_rules: self.outbound.ordered(),
            http_targets: self.http_targets.read().map(|t| t.clone()).unwrap_or_default(),
            tls_inspection: self.config.tls_inspection.clone(),
            scan_mode: self.scan.mode(),
        };
        if let Ok(store) = store.lock()
            && let Err(err) = store.save(&document)
        {
            tracing::error!(error = %err, "state persistence failed");
        }
    }
}

/// Default first-boot outbound blocklist, loaded only when the store is
/// empty: cloud metadata endpoints and link-local ranges.
fn default_outbound_blocklist() -> Vec<OutboundRule> {
    vec![
        OutboundRule {
            id: OutboundRuleId::new("builtin-metadata-cidr"),
            name: "cloud-metadata-ranges".to_string(),
            matcher: OutboundMatch::Cidr {
                networks: vec![
                    #[allow(clippy::unwrap_used, reason = "Literal CIDR always parses.")]
                    "169.254.0.0/16".parse().unwrap(),
                ],
            },
            action: OutboundAction::Deny,
            help_text: Some("link-local and cloud metadata ranges are blocked".to_string()),
            priority: 0,
        },
        OutboundRule {
            id: OutboundRuleId::new("builtin-metadata-domain"),
            name: "metadata-hostnames".to_string(),
            matcher: OutboundMatch::Domain {
                pattern: "metadata.google.internal".to_string(),
            },
            action: OutboundAction::Deny,
            help_text: Some("cloud metadata hostnames are blocked".to_string()),
            priority: 0,
        },
    ]
}

/// Builds the full gateway state from configuration and persisted state.
///
/// # Errors
///
/// Returns [`ServeError`] when state loading, policy registration, or TLS
/// material fails.
pub fn build_state(config: SentinelConfig) -> Result<Arc<GatewayState>, ServeError> {
    let state_store = config.state_path.clone().map(StateStore::new);
    let document = match &state_store {
        Some(store) => store.load().map_err(|err| ServeError::State(err.to_string()))?,
        None => StateDocument::default(),
    };

    let auth = Arc::new(AuthStore::new());
    for identity in document.identities.clone() {
        auth.upsert_identity(identity);
    }
    for key in document.api_keys.clone() {
        // Stored keys already carry their hashes; restore them verbatim.
        auth.restore_key(key);
    }
    for config_key in &config.auth.api_keys {
        let identity_id = IdentityId::new(config_key.identity.clone());
        auth.upsert_identity(Identity {
            id: identity_id.clone(),
            name: config_key.identity.clone(),
            roles: config_key.roles.clone(),
        });
        auth.register_legacy_digest(config_key.key_hash.clone(), identity_id);
    }

    let sessions = Arc::new(SessionStore::new(Duration::from_secs(
        config.auth.session_idle_secs.max(1),
    )));

    let limits = EvalLimits {
        max_source_len: config.policy.max_source_len,
        max_nesting: config.policy.max_nesting,
        cost_budget: config.policy.cost_budget,
        timeout: Duration::from_millis(config.policy.eval_timeout_ms),
    };
    let policies = Arc::new(PolicyStore::new(limits));
    policies
        .replace_all(document.policies.clone())
        .map_err(|err| ServeError::Policy(err.to_string()))?;
    let evaluator = Arc::new(PolicyEvaluator::new(Arc::clone(&policies)));

    let outbound = Arc::new(OutboundStore::new());
    if document.outbound_rules.is_empty() {
        outbound.replace_all(default_outbound_blocklist());
    } else {
        outbound.replace_all(document.outbound_rules.clone());
    }
    let outbound_engine =
        Arc::new(OutboundEngine::new(Arc::clone(&outbound), Arc::new(SystemDnsResolver)));

    let approvals = Arc::new(ApprovalManager::new(config.approvals.capacity));
    let quarantine = Arc::new(QuarantineRegistry::new());

    let mut patterns = default_patterns();
    patterns.extend(config.scanner.extra_patterns.clone());
    let scan = ScanControl::new(document.scan_mode, patterns);

    let audit_memory = Arc::new(MemoryAuditSink::new(config.audit.memory_records));
    let (audit, _audit_flusher) = AuditService::spawn(
        AuditServiceConfig {
            channel_size: config.audit.channel_size,
            batch_size: config.audit.batch_size,
            flush_interval_ms: config.audit.flush_interval_ms,
            send_timeout_ms: config.audit.send_timeout_ms,
            warning_threshold: config.audit.warning_threshold,
        },
        Arc::clone(&audit_memory) as Arc<dyn AuditSink>,
    );

    let upstreams = Arc::new(UpstreamManager::new());
    for upstream in &config.upstreams {
        upstreams.add(upstream.clone());
    }
    for upstream in &document.upstreams {
        if !config.upstreams.iter().any(|configured| configured.id == upstream.id) {
            upstreams.add(upstream.clone());
        }
    }
    let _discovery_sweeper = upstreams.spawn_discovery_sweeper();

    let rate_limits =
        Arc::new(RateLimitService::new(config.rate_limit.ip, config.rate_limit.identity));
    let _rate_sweeper =
        rate_limits.spawn_sweeper(Duration::from_secs(config.rate_limit.sweep_secs.max(1)));
    let _session_sweeper =
        sessions.spawn_sweeper(Duration::from_secs(config.auth.session_sweep_secs.max(1)));
    let _approval_sweeper =
        approvals.spawn_sweeper(Duration::from_secs(config.approvals.sweep_secs.max(1)));

    let tls = if config.tls_inspection.enabled {
        let cert = config
            .tls_inspection
            .ca_cert_path
            .clone()
            .ok_or_else(|| ServeError::Tls("missing ca_cert_path".to_string()))?;
        let key = config
            .tls_inspection
            .ca_key_path
            .clone()
            .ok_or_else(|| ServeError::Tls("missing ca_key_path".to_string()))?;
        Some(Arc::new(
            TlsAuthority::load(
                &cert,
                &key,
                Duration::from_secs(config.tls_inspection.leaf_ttl_secs.max(60)),
            )
            .map_err(|err| ServeError::Tls(err.to_string()))?,
        ))
    } else {
        None
    };

    let chain = build_chain(ChainComponents {
        validation: ValidationConfig::default(),
        rate_limits,
        auth: Arc::clone(&auth),
        sessions: Arc::clone(&sessions),
        audit: audit.clone(),
        quarantine: Arc::clone(&quarantine),
        evaluator: Arc::clone(&evaluator),
        approvals: Arc::clone(&approvals),
        outbound: Arc::clone(&outbound_engine),
        scan: scan.clone(),
        router: Arc::clone(&upstreams) as Arc<dyn sentinel_gate_core::ActionRouter>,
    });

    Ok(Arc::new(GatewayState {
        config,
        chain,
        auth,
        sessions,
        policies,
        evaluator,
        outbound,
        outbound_engine,
        approvals,
        quarantine,
        scan,
        audit,
        audit_memory,
        agents: Arc::new(AgentRegistry::new()),
        upstreams,
        state_store: state_store.map(Mutex::new),
        csrf_tokens: Mutex::new(HashSet::new()),
        http_targets: RwLock::new(document.http_targets),
        tls,
        shutdown: Arc::new(Notify::new()),
    }))
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the gateway router (health, MCP, admin, decision API).
#[must_use]
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/mcp", post(mcp::handle_mcp))
        .merge(admin::router())
        .with_state(state)
}

/// Liveness probe.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({"status": "ok"})))
}

/// Readiness probe: ready once the chain exists (stores are in-memory).
async fn handle_ready(State(_state): State<Arc<GatewayState>>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({"status": "ready"})))
}

// ============================================================================
// SECTION: PID File
// ============================================================================

/// Returns the SentinelGate home directory (`~/.sentinelgate`).
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".sentinelgate")
}

/// Returns the server PID file path.
#[must_use]
pub fn pid_file() -> PathBuf {
    home_dir().join("server.pid")
}

/// Writes the current PID into the PID file.
///
/// # Errors
///
/// Returns [`ServeError::Io`] when the file cannot be written.
pub fn write_pid_file() -> Result<(), ServeError> {
    let path = pid_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| ServeError::Io(err.to_string()))?;
    }
    std::fs::write(&path, std::process::id().to_string())
        .map_err(|err| ServeError::Io(err.to_string()))
}

/// Removes the PID file; best effort.
pub fn remove_pid_file() {
    let _ = std::fs::remove_file(pid_file());
}

// ============================================================================
// SECTION: Serve
// ============================================================================

/// Serves the gateway until a shutdown signal arrives.
///
/// # Errors
///
/// Returns [`ServeError::Io`] when binding or serving fails.
pub async fn run(state: Arc<GatewayState>) -> Result<(), ServeError> {
    let bind_addr = state.config.server.bind_addr;
    enforce_loopback(&bind_addr, state.config.server.allow_non_loopback)?;
    write_pid_file()?;

    let proxy_state = Arc::clone(&state);
    let proxy_addr = state.config.server.proxy_addr;
    tokio::spawn(async move {
        if let Err(err) = crate::httpgw::serve_proxy(proxy_state, proxy_addr).await {
            tracing::error!(error = %err, "http proxy exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|err| ServeError::Io(err.to_string()))?;
    tracing::info!(addr = %bind_addr, "gateway listening");

    let shutdown = Arc::clone(&state.shutdown);
    let grace = Duration::from_millis(state.config.server.shutdown_grace_ms);
    let app = router(Arc::clone(&state))
        .into_make_service_with_connect_info::<SocketAddr>();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        wait_for_signal(&shutdown).await;
        tracing::info!("graceful shutdown started; draining in-flight actions");
    });
    let result = tokio::select! {
        served = serve => served.map_err(|err| ServeError::Io(err.to_string())),
        () = async {
            // Second signal (or grace expiry after the first) aborts.
            wait_for_signal(&state.shutdown).await;
            tokio::select! {
                () = wait_for_signal(&state.shutdown) => {}
                () = tokio::time::sleep(grace) => {}
            }
        } => {
            tracing::warn!("immediate shutdown");
            Ok(())
        }
    };
    remove_pid_file();
    result
}

/// Resolves on SIGINT/SIGTERM or a programmatic shutdown notification.
async fn wait_for_signal(shutdown: &Notify) {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match term.as_mut() {
                    Some(term) => {
                        term.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            () = shutdown.notified() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = shutdown.notified() => {}
        }
    }
}

/// Refuses non-loopback binds unless explicitly allowed.
fn enforce_loopback(addr: &SocketAddr, allow_non_loopback: bool) -> Result<(), ServeError> {
    if !addr.ip().is_loopback() && !allow_non_loopback {
        return Err(ServeError::Io(format!(
            "refusing non-loopback bind {addr}; set server.allow_non_loopback = true to override"
        )));
    }
    Ok(())
}
