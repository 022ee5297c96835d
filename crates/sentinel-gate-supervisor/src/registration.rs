// crates/sentinel-gate-supervisor/src/registration.rs
// ============================================================================
// Module: Gateway Registration Client
// Description: Admin-API client issuing per-run identities and keys.
// Purpose: Register the supervised agent so its hook traffic authenticates.
// Dependencies: reqwest, serde_json, uuid
// ============================================================================

//! ## Overview
//! Registration drives the admin API with the CSRF cookie/header dance:
//! fetch a token, create an identity `runtime-<uuid>` with role `agent`,
//! bind an API key to it (supplying the locally generated cleartext so the
//! hooks already hold it), and register the agent record. When any step
//! fails the supervisor proceeds with the local key; authentication will
//! fail at the gateway, but the child still runs.
//!
//! Security posture: the admin credential comes from the operator's local
//! key file and never enters the child environment; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use sentinel_gate_core::ids::AgentId;
use sentinel_gate_core::ids::IdentityId;
use sentinel_gate_core::ids::KeyId;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Registration outcome handed to teardown.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Agent identifier.
    pub agent_id: AgentId,
    /// Identity the gateway issued, when registration succeeded.
    pub identity_id: Option<IdentityId>,
    /// Key record identifier, when registration succeeded.
    pub key_id: Option<KeyId>,
    /// Cleartext the hooks authenticate with (always the local credential).
    pub api_key: String,
    /// True when the gateway accepted the registration.
    pub registered: bool,
}

/// Registration errors (internal; callers fall back to the local key).
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// HTTP transport failed.
    #[error("registration transport error: {0}")]
    Transport(String),
    /// The gateway rejected a step.
    #[error("registration rejected: {0}")]
    Rejected(String),
}

// ============================================================================
// SECTION: Credential
// ============================================================================

/// Generates the per-run credential: `sg_runtime_` + 16 random bytes hex.
#[must_use]
pub fn generate_runtime_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sg_runtime_{}", hex::encode(bytes))
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// Admin-API client with the CSRF cookie jar.
pub struct AdminClient {
    /// Base URL of the gateway admin surface.
    base: String,
    /// Operator admin key.
    admin_key: String,
    /// HTTP client with a cookie store for the CSRF cookie.
    client: reqwest::Client,
}

impl AdminClient {
    /// Builds a client for the gateway at `server_addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Transport`] when the client cannot build.
    pub fn new(server_addr: &str, admin_key: String) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .cookie_store(true)
            .build()
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;
        Ok(Self {
            base: format!("http://{server_addr}"),
            admin_key,
            client,
        })
    }

    /// Fetches a CSRF token (the cookie lands in the jar).
    async fn csrf_token(&self) -> Result<String, RegistrationError> {
        let response = self
            .client
            .get(format!("{}/admin/api/v1/csrf", self.base))
            .bearer_auth(&self.admin_key)
            .send()
            .await
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;
        body.get("token")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| RegistrationError::Rejected("csrf token missing".to_string()))
    }

    /// Posts a JSON body with bearer auth and the CSRF header.
    async fn post(
        &self,
        path: &str,
        token: &str,
        body: Value,
    ) -> Result<Value, RegistrationError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.admin_key)
            .header("X-CSRF-Token", token)
            .json(&body)
            .send()
            .await
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok(body)
        } else {
            Err(RegistrationError::Rejected(format!("status {status}")))
        }
    }

    /// Issues a DELETE with bearer auth and the CSRF header.
    async fn delete(&self, path: &str, token: &str) -> Result<(), RegistrationError> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base))
            .bearer_auth(&self.admin_key)
            .header("X-CSRF-Token", token)
            .send()
            .await
            .map_err(|err| RegistrationError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistrationError::Rejected(format!("status {}", response.status())))
        }
    }

    /// Registers the agent: identity, key, agent record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] when any step fails; the caller falls
    /// back to the local credential.
    pub async fn register(
        &self,
        agent_id: &AgentId,
        command: &str,
        args: &[String],
        framework: Option<&str>,
        fail_mode: &str,
        local_key: &str,
    ) -> Result<Registration, RegistrationError> {
        let token = self.csrf_token().await?;

        let identity: Value = self
            .post(
                "/admin/api/v1/identities",
                &token,
                json!({
                    "name": format!("runtime-{}", Uuid::new_v4()),
                    "roles": ["agent"],
                }),
            )
            .await?;
        let identity_id = identity
            .get("id")
            .and_then(Value::as_str)
            .map(IdentityId::new)
            .ok_or_else(|| RegistrationError::Rejected("identity id missing".to_string()))?;

        let key: Value = self
            .post(
                "/admin/api/v1/keys",
                &token,
                json!({
                    "identity_id": identity_id.as_str(),
                    "cleartext": local_key,
                }),
            )
            .await?;
        let key_id = key
            .get("id")
            .and_then(Value::as_str)
            .map(KeyId::new)
            .ok_or_else(|| RegistrationError::Rejected("key id missing".to_string()))?;

        self.post(
            "/admin/api/v1/agents",
            &token,
            json!({
                "id": agent_id.as_str(),
                "command": command,
                "args": args,
                "framework": framework,
                "fail_mode": fail_mode,
                "pid": Value::Null,
                "identity_id": identity_id.as_str(),
            }),
        )
        .await?;

        Ok(Registration {
            agent_id: agent_id.clone(),
            identity_id: Some(identity_id),
            key_id: Some(key_id),
            api_key: local_key.to_string(),
            registered: true,
        })
    }

    /// Unregisters the agent and revokes its identity; best effort.
    pub async fn unregister(&self, registration: &Registration) {
        let Ok(token) = self.csrf_token().await else {
            tracing::warn!("unregister skipped: csrf token unavailable");
            return;
        };
        let _ = self
            .delete(
                &format!("/admin/api/v1/agents/{}", registration.agent_id.as_str()),
                &token,
            )
            .await;
        if let Some(key_id) = &registration.key_id {
            let _ =
                self.delete(&format!("/admin/api/v1/keys/{}", key_id.as_str()), &token).await;
        }
        if let Some(identity_id) = &registration.identity_id {
            let _ = self
                .delete(
                    &format!("/admin/api/v1/identities/{}", identity_id.as_str()),
                    &token,
                )
                .await;
        }
    }
}
