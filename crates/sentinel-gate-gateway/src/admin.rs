// crates/sentinel-gate-gateway/src/admin.rs
// ============================================================================
// Module: Admin and Decision API
// Description: CRUD for stores, CSRF handling, and the decision endpoints.
// Purpose: Give operators and runtime hooks one narrow HTTP surface.
// Dependencies: axum, sentinel-gate-core, serde_json
// ============================================================================

//! ## Overview
//! Two audiences share this router: administrators (CRUD over identities,
//! keys, policies, outbound rules, upstreams, agents, scanner mode) and
//! runtime hooks (policy evaluation, approval polling, outbound tests, audit
//! batch upload). State-changing admin calls require the CSRF cookie echoed
//! in the `X-CSRF-Token` header on top of bearer auth; decision endpoints
//! require bearer auth with the `admin` or `agent` role.
//!
//! Security posture: every body is untrusted and size-capped by axum's
//! default limits; key cleartexts are returned exactly once at issue time;
//! see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::header::COOKIE;
use axum::http::header::SET_COOKIE;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use chrono::Utc;
use rand::RngCore;
use sentinel_gate_core::ActionContext;
use sentinel_gate_core::ActionType;
use sentinel_gate_core::AgentRegistration;
use sentinel_gate_core::ApprovalState;
use sentinel_gate_core::AuditPhase;
use sentinel_gate_core::AuditRecord;
use sentinel_gate_core::CanonicalAction;
use sentinel_gate_core::CorrelationId;
use sentinel_gate_core::Destination;
use sentinel_gate_core::GatewayKind;
use sentinel_gate_core::Identity;
use sentinel_gate_core::IdentityId;
use sentinel_gate_core::KeyId;
use sentinel_gate_core::OutboundRule;
use sentinel_gate_core::OutboundRuleId;
use sentinel_gate_core::Policy;
use sentinel_gate_core::PolicyId;
use sentinel_gate_core::Protocol;
use sentinel_gate_core::ScanMode;
use sentinel_gate_core::UpstreamId;
use sentinel_gate_core::ids::AgentId;
use sentinel_gate_core::ids::ApprovalId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::server::GatewayState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// CSRF cookie name.
pub const CSRF_COOKIE: &str = "sentinel_csrf_token";
/// CSRF header name.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Admin surface errors mapped onto HTTP statuses.
enum AdminError {
    /// Missing or invalid bearer credential.
    Unauthorized,
    /// Authenticated but lacking the required role.
    Forbidden,
    /// Missing or mismatched CSRF token.
    Csrf,
    /// Request body failed validation.
    BadRequest(String),
    /// Referenced object does not exist.
    NotFound,
    /// Internal failure (sanitized).
    Internal(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid credentials".to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "insufficient role".to_string()),
            Self::Csrf => (StatusCode::FORBIDDEN, "missing or invalid csrf token".to_string()),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::Internal(detail) => {
                tracing::error!(detail = %detail, "admin internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

// ============================================================================
// SECTION: Auth Helpers
// ============================================================================

/// Resolves the bearer credential into an identity.
fn authenticate(state: &GatewayState, headers: &HeaderMap) -> Result<Identity, AdminError> {
    let key = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AdminError::Unauthorized)?;
    state.auth.verify_key(key).map_err(|_| AdminError::Unauthorized)
}

/// Requires the `admin` role.
fn require_admin(state: &GatewayState, headers: &HeaderMap) -> Result<Identity, AdminError> {
    let identity = authenticate(state, headers)?;
    if identity.has_role("admin") {
        Ok(identity)
    } else {
        Err(AdminError::Forbidden)
    }
}

/// Requires the `admin` or `agent` role (decision API callers).
fn require_decision_caller(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<Identity, AdminError> {
    let identity = authenticate(state, headers)?;
    if identity.has_role("admin") || identity.has_role("agent") {
        Ok(identity)
    } else {
        Err(AdminError::Forbidden)
    }
}

/// Verifies the CSRF cookie/header pair for state-changing calls.
fn require_csrf(state: &GatewayState, headers: &HeaderMap) -> Result<(), AdminError> {
    let header_token = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AdminError::Csrf)?;
    let cookie_token = headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').map(str::trim).find_map(|cookie| {
                cookie.strip_prefix(CSRF_COOKIE).and_then(|rest| rest.strip_prefix('='))
            })
        })
        .ok_or(AdminError::Csrf)?;
    if header_token != cookie_token {
        return Err(AdminError::Csrf);
    }
    let known = state
        .csrf_tokens
        .lock()
        .map(|tokens| tokens.contains(header_token))
        .unwrap_or(false);
    if known { Ok(()) } else { Err(AdminError::Csrf) }
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the admin + decision API router.
#[must_use]
pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/admin/api/v1/csrf", get(handle_csrf))
        .route("/admin/api/v1/identities", get(list_identities).post(create_identity))
        .route("/admin/api/v1/identities/{id}", delete(delete_identity))
        .route("/admin/api/v1/keys", post(create_key))
        .route("/admin/api/v1/keys/{id}", delete(revoke_key))
        .route("/admin/api/v1/policies", get(list_policies).post(upsert_policy))
        .route("/admin/api/v1/policies/{id}", delete(delete_policy))
        .route(
            "/admin/api/v1/security/outbound",
            get(list_outbound).post(upsert_outbound),
        )
        .route("/admin/api/v1/security/outbound/{id}", delete(delete_outbound))
        .route("/admin/api/v1/security/outbound/test", post(test_outbound))
        .route("/admin/api/v1/security/scanning", post(set_scanning))
        .route("/admin/api/v1/upstreams", get(list_upstreams).post(create_upstream))
        .route("/admin/api/v1/upstreams/{id}", delete(delete_upstream))
        .route("/admin/api/v1/agents", get(list_agents).post(register_agent))
        .route("/admin/api/v1/agents/{id}", delete(unregister_agent))
        .route("/admin/api/v1/audit/records", get(list_audit_records))
        .route("/admin/api/v1/audit/events", post(push_audit_events))
        .route("/admin/api/v1/policy/evaluate", post(evaluate_policy))
        .route(
            "/admin/api/v1/policy/evaluate/{request_id}/status",
            get(approval_status),
        )
        .route(
            "/admin/api/v1/policy/evaluate/{request_id}/resolve",
            post(resolve_approval),
        )
}

// ============================================================================
// SECTION: CSRF
// ============================================================================

/// Issues a CSRF token as both cookie and body.
async fn handle_csrf(State(state): State<Arc<GatewayState>>) -> Response {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    if let Ok(mut tokens) = state.csrf_tokens.lock() {
        tokens.insert(token.clone());
    }
    let mut response = Json(json!({"token": token})).into_response();
    if let Ok(cookie) = axum::http::HeaderValue::from_str(&format!(
        "{CSRF_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict"
    )) {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}

// ============================================================================
// SECTION: Identity and Key CRUD
// ============================================================================

/// Identity creation body.
#[derive(Debug, Deserialize)]
struct CreateIdentity {
    /// Identity name.
    name: String,
    /// Granted roles.
    #[serde(default)]
    roles: Vec<String>,
}

/// Lists identities.
async fn list_identities(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Identity>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.auth.list_identities()))
}

/// Creates an identity.
async fn create_identity(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateIdentity>,
) -> Result<Json<Identity>, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if body.name.is_empty() {
        return Err(AdminError::BadRequest("identity name must not be empty".to_string()));
    }
    let identity = Identity {
        id: IdentityId::generate(),
        name: body.name,
        roles: body.roles,
    };
    state.auth.upsert_identity(identity.clone());
    state.persist();
    Ok(Json(identity))
}

/// Deletes an identity (revoking its keys).
async fn delete_identity(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.auth.remove_identity(&IdentityId::new(id)) {
        state.persist();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

/// Key creation body.
#[derive(Debug, Deserialize)]
struct CreateKey {
    /// Identity the key authenticates as.
    identity_id: String,
    /// Optional caller-supplied cleartext (supervisor per-run credentials).
    #[serde(default)]
    cleartext: Option<String>,
}

/// Key creation response; the cleartext appears exactly once.
#[derive(Debug, Serialize)]
struct CreatedKey {
    /// Key identifier.
    id: KeyId,
    /// The cleartext key. Shown only in this response.
    key: String,
}

/// Issues an API key.
async fn create_key(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKey>,
) -> Result<Json<CreatedKey>, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    let identity_id = IdentityId::new(body.identity_id);
    if state.auth.identity(&identity_id).is_none() {
        return Err(AdminError::NotFound);
    }
    let cleartext = body.cleartext.unwrap_or_else(|| {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("sg_{}", hex::encode(bytes))
    });
    let key = state
        .auth
        .issue_key(identity_id, &cleartext)
        .map_err(|err| AdminError::Internal(err.to_string()))?;
    state.persist();
    Ok(Json(CreatedKey {
        id: key.id,
        key: cleartext,
    }))
}

/// Revokes an API key.
async fn revoke_key(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.auth.revoke_key(&KeyId::new(id)) {
        state.persist();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

// ============================================================================
// SECTION: Policy CRUD
// ============================================================================

/// Lists policies.
async fn list_policies(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Policy>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.policies.list()))
}

/// Creates or replaces a policy; rule conditions compile here or the write
/// is rejected.
async fn upsert_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(policy): Json<Policy>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    state
        .policies
        .upsert_policy(policy)
        .map_err(|err| AdminError::BadRequest(err.to_string()))?;
    state.persist();
    Ok(StatusCode::NO_CONTENT)
}

/// Deletes a policy.
async fn delete_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.policies.remove_policy(&PolicyId::new(id)) {
        state.persist();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

// ============================================================================
// SECTION: Outbound CRUD and Test
// ============================================================================

/// Lists outbound rules in evaluation order.
async fn list_outbound(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<OutboundRule>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.outbound.ordered()))
}

/// Creates or replaces an outbound rule.
async fn upsert_outbound(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(rule): Json<OutboundRule>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    state.outbound.upsert(rule);
    state.persist();
    Ok(StatusCode::NO_CONTENT)
}

/// Deletes an outbound rule.
async fn delete_outbound(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.outbound.remove(&OutboundRuleId::new(id)) {
        state.persist();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

/// Outbound test body.
#[derive(Debug, Deserialize)]
struct OutboundTest {
    /// Destination domain.
    #[serde(default)]
    domain: Option<String>,
    /// Destination IP literal.
    #[serde(default)]
    ip: Option<String>,
    /// Destination port.
    #[serde(default)]
    port: Option<u16>,
}

/// Tests a destination against the outbound rules (host-hook helper).
async fn test_outbound(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<OutboundTest>,
) -> Result<Json<Value>, AdminError> {
    require_decision_caller(&state, &headers)?;
    let dest = Destination {
        domain: body.domain,
        ip: body.ip,
        port: body.port,
        ..Destination::default()
    };
    let cx = ActionContext::new(None, None);
    let block = state
        .outbound_engine
        .evaluate(&cx, &dest)
        .await
        .map_err(|err| AdminError::Internal(err.to_string()))?;
    Ok(Json(block.map_or_else(
        || json!({"blocked": false, "message": "not blocked by any rule"}),
        |block| {
            json!({
                "blocked": true,
                "rule": {"name": block.rule_name, "help_text": block.help_text},
                "message": format!("blocked: {}:{}", block.domain_or_ip, block.port),
            })
        },
    )))
}

/// Scanner mode body.
#[derive(Debug, Deserialize)]
struct ScanningBody {
    /// New scanner mode.
    mode: ScanMode,
}

/// Flips the live scanner mode; reaches every chain in the process.
async fn set_scanning(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<ScanningBody>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    state.scan.set_mode(body.mode);
    state.persist();
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// SECTION: Upstream CRUD
// ============================================================================

/// Lists upstreams with live status.
async fn list_upstreams(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::upstream::UpstreamView>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.upstreams.list()))
}

/// Creates an upstream and starts its supervisor.
async fn create_upstream(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(config): Json<sentinel_gate_config::UpstreamConfig>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if config.id.is_empty() {
        return Err(AdminError::BadRequest("upstream id must not be empty".to_string()));
    }
    state.upstreams.add(config);
    state.persist();
    Ok(StatusCode::NO_CONTENT)
}

/// Removes an upstream, shutting its client down.
async fn delete_upstream(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.upstreams.remove(&UpstreamId::new(id)) {
        state.persist();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

// ============================================================================
// SECTION: Agent Registry
// ============================================================================

/// Lists supervised agents.
async fn list_agents(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AgentRegistration>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.agents.list()))
}

/// Registers a supervised agent.
async fn register_agent(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(registration): Json<AgentRegistration>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    state.agents.register(registration);
    Ok(StatusCode::NO_CONTENT)
}

/// Unregisters a supervised agent.
async fn unregister_agent(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    if state.agents.unregister(&AgentId::new(id)).is_some() {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

// ============================================================================
// SECTION: Audit
// ============================================================================

/// Returns retained audit records.
async fn list_audit_records(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AuditRecord>>, AdminError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.audit_memory.snapshot()))
}

/// One buffered hook audit event.
#[derive(Debug, Deserialize)]
struct HookAuditEvent {
    /// Action type label.
    action_type: String,
    /// Action name.
    action_name: String,
    /// Decision the hook enforced.
    decision: String,
    /// Event timestamp (RFC 3339), hook-local.
    #[serde(default)]
    timestamp: Option<String>,
}

/// Accepts a batch of buffered hook audit events.
async fn push_audit_events(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(events): Json<Vec<HookAuditEvent>>,
) -> Result<Json<Value>, AdminError> {
    let identity = require_decision_caller(&state, &headers)?;
    let accepted = events.len();
    for event in events {
        state
            .audit
            .record(AuditRecord {
                correlation_id: CorrelationId::generate(),
                phase: AuditPhase::Exit,
                action_type: event.action_type,
                action_name: event.action_name,
                identity: identity.name.clone(),
                gateway: "runtime".to_string(),
                decision: Some(event.decision),
                rule_id: None,
                latency_ms: None,
                scan_findings: Vec::new(),
                request_bytes: None,
                response_bytes: None,
                detail: event.timestamp,
                timestamp: Utc::now(),
            })
            .await;
    }
    Ok(Json(json!({"accepted": accepted})))
}

// ============================================================================
// SECTION: Decision API
// ============================================================================

/// Decision request body (the hook/SDK contract).
#[derive(Debug, Deserialize)]
struct EvaluateBody {
    /// Action type label.
    action_type: ActionType,
    /// Action name.
    action_name: String,
    /// Origin protocol label.
    #[serde(default)]
    protocol: Option<Protocol>,
    /// Detected framework label.
    #[serde(default)]
    framework: Option<String>,
    /// Action arguments.
    #[serde(default)]
    arguments: Option<Value>,
    /// Identity name the hook runs as.
    identity_name: String,
    /// Identity roles.
    #[serde(default)]
    identity_roles: Vec<String>,
    /// Destination when known.
    #[serde(default)]
    destination: Option<Destination>,
}

/// Evaluates one action for a runtime hook.
async fn evaluate_policy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<EvaluateBody>,
) -> Result<Json<Value>, AdminError> {
    let caller = require_decision_caller(&state, &headers)?;
    let started = std::time::Instant::now();

    let mut action = CanonicalAction::new(
        body.action_type,
        body.action_name,
        body.protocol.unwrap_or(Protocol::Runtime),
        GatewayKind::Runtime,
    );
    action.framework = body.framework;
    action.identity = Identity {
        id: caller.id.clone(),
        name: body.identity_name,
        roles: body.identity_roles,
    };
    if let Some(Value::Object(arguments)) = body.arguments {
        action.arguments = arguments;
    }
    action.destination = body.destination;

    let cx = ActionContext::new(None, None);
    let request_id = ApprovalId::generate();
    let correlation = CorrelationId::generate();
    action.correlation_id = Some(correlation.clone());

    let decision = state
        .evaluator
        .evaluate(&action, None, cx.received_at)
        .await
        .map_err(|err| AdminError::Internal(err.to_string()))?;

    // Outbound rules run for destination-bearing allowed actions.
    let outbound_block = if decision.allowed {
        match sentinel_gate_core::outbound::destination_for(&action) {
            Some(dest) => state
                .outbound_engine
                .evaluate(&cx, &dest)
                .await
                .map_err(|err| AdminError::Internal(err.to_string()))?,
            None => None,
        }
    } else {
        None
    };

    let (verdict, reason, rule_id, rule_name, help_text) = if let Some(block) = outbound_block {
        (
            "deny",
            format!("outbound blocked: {}:{}", block.domain_or_ip, block.port),
            Some(block.rule_id.to_string()),
            Some(block.rule_name),
            block.help_text,
        )
    } else if decision.requires_approval {
        let (approval_id, _rx) = state
            .approvals
            .submit(
                action.clone(),
                Duration::from_secs(decision.approval_timeout_secs.max(1)),
            )
            .map_err(|err| AdminError::Internal(err.to_string()))?;
        let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        record_decision(&state, &correlation, &action, "approval_required").await;
        return Ok(Json(json!({
            "decision": "approval_required",
            "rule_id": decision.rule_id,
            "rule_name": decision.rule_name,
            "reason": decision.reason,
            "help_text": decision.help_text,
            "request_id": approval_id,
            "latency_ms": latency,
        })));
    } else if decision.allowed {
        (
            "allow",
            decision.reason.clone(),
            decision.rule_id.as_ref().map(ToString::to_string),
            decision.rule_name.clone(),
            decision.help_text.clone(),
        )
    } else {
        (
            "deny",
            decision.reason.clone(),
            decision.rule_id.as_ref().map(ToString::to_string),
            decision.rule_name.clone(),
            decision.help_text.clone(),
        )
    };

    record_decision(&state, &correlation, &action, verdict).await;
    let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(Json(json!({
        "decision": verdict,
        "rule_id": rule_id,
        "rule_name": rule_name,
        "reason": reason,
        "help_text": help_text,
        "request_id": request_id,
        "latency_ms": latency,
    })))
}

/// Emits one decision audit record for the decision API path.
async fn record_decision(
    state: &GatewayState,
    correlation: &CorrelationId,
    action: &CanonicalAction,
    decision: &str,
) {
    state
        .audit
        .record(AuditRecord {
            correlation_id: correlation.clone(),
            phase: AuditPhase::Decision,
            action_type: action.action_type.as_str().to_string(),
            action_name: action.name.clone(),
            identity: action.identity.name.clone(),
            gateway: action.gateway.as_str().to_string(),
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
}

/// Reports the current state of an approval request for polling callers.
async fn approval_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    require_decision_caller(&state, &headers)?;
    let request = state
        .approvals
        .status(&ApprovalId::new(request_id.clone()))
        .ok_or(AdminError::NotFound)?;
    let decision = match request.state {
        ApprovalState::Pending => "approval_required",
        ApprovalState::Approved => "allow",
        // Polling callers deny on timeout regardless of the blocking path's
        // timeout action.
        ApprovalState::Denied | ApprovalState::TimedOut => "deny",
    };
    Ok(Json(json!({
        "request_id": request_id,
        "status": request.state.as_str(),
        "decision": decision,
        "reason": request.reason,
        "updated_at": Utc::now().to_rfc3339(),
    })))
}

/// Administrator resolution body.
#[derive(Debug, Deserialize)]
struct ResolveBody {
    /// True to approve, false to deny.
    approve: bool,
}

/// Applies an administrator decision to a pending approval.
async fn resolve_approval(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Value>, AdminError> {
    require_admin(&state, &headers)?;
    require_csrf(&state, &headers)?;
    let state_after = state
        .approvals
        .resolve(&ApprovalId::new(request_id.clone()), body.approve)
        .map_err(|err| AdminError::BadRequest(err.to_string()))?;
    Ok(Json(json!({"request_id": request_id, "status": state_after.as_str()})))
}
