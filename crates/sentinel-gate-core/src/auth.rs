// crates/sentinel-gate-core/src/auth.rs
// ============================================================================
// Module: Authentication Stores
// Description: Identities, API keys, and sessions with sweepers.
// Purpose: Resolve presented credentials into identities without oracles.
// Dependencies: argon2, chrono, hex, rand, sha2, subtle
// ============================================================================

//! ## Overview
//! API keys are stored as Argon2 password hashes; verification walks every
//! non-revoked key and checks the presented cleartext against each hash. A
//! separate SHA-256 digest index serves keys pinned in configuration files
//! (the legacy path) with constant-time digest comparison. Sessions are
//! created on first authenticated use and reaped by an idle-timeout sweeper.
//!
//! Security posture: authentication failures use one uniform message so a
//! caller cannot distinguish unknown keys from revoked ones; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use argon2::Argon2;
use argon2::PasswordHash;
use argon2::PasswordHasher;
use argon2::PasswordVerifier;
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::action::Identity;
use crate::ids::AgentId;
use crate::ids::IdentityId;
use crate::ids::KeyId;
use crate::ids::SessionId;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Stored API key record.
///
/// # Invariants
/// - `hash` is an Argon2 PHC string, never the cleartext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Key identifier.
    pub id: KeyId,
    /// Identity the key authenticates as.
    pub identity_id: IdentityId,
    /// Argon2 password hash of the cleartext.
    pub hash: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// True when the key has been revoked.
    pub revoked: bool,
}

/// Authenticated session.
///
/// # Invariants
/// - `expires_at` is advanced on every touch; the sweeper removes entries
///   whose expiry has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Identity bound to the session.
    pub identity: Identity,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-seen timestamp.
    pub last_seen: DateTime<Utc>,
    /// Idle expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

/// Registration record for a supervised agent.
///
/// # Invariants
/// - Lifetime equals the lifetime of the supervised child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Agent identifier.
    pub id: AgentId,
    /// Supervised command.
    pub command: String,
    /// Supervised command arguments.
    pub args: Vec<String>,
    /// Detected framework label, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Hook fail mode (`open` or `closed`).
    pub fail_mode: String,
    /// Child process id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Identity issued for the run.
    pub identity_id: IdentityId,
}

/// Authentication errors.
///
/// # Invariants
/// - `InvalidCredentials` is the only client-visible variant and its message
///   is identical for every failure cause.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential did not resolve to an identity.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Key hashing failed.
    #[error("key hashing failed: {0}")]
    Hashing(String),
    /// Store lock was poisoned.
    #[error("auth store lock poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Key Hashing
// ============================================================================

/// Computes the legacy configuration-file digest for a cleartext key.
///
/// The format is `sha256:<hex>` and is only used for keys pinned in config
/// files; issued keys always take the password-hash path.
#[must_use]
pub fn hash_key_sha256(cleartext: &str) -> String {
    let digest = Sha256::digest(cleartext.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Derives the Argon2 password hash for a cleartext key.
///
/// # Errors
///
/// Returns [`AuthError::Hashing`] when hashing fails.
pub fn hash_key_argon2(cleartext: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(cleartext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hashing(err.to_string()))
}

/// Verifies a cleartext against one stored Argon2 hash.
fn verify_argon2(cleartext: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| Argon2::default().verify_password(cleartext.as_bytes(), &parsed).is_ok())
        .unwrap_or(false)
}

// ============================================================================
// SECTION: Auth Store
// ============================================================================

/// In-memory identity and API-key store.
///
/// # Invariants
/// - The legacy digest index maps `sha256:<hex>` strings to identity ids and
///   is consulted before the password-hash path.
pub struct AuthStore {
    /// Identities keyed by id.
    identities: RwLock<HashMap<IdentityId, Identity>>,
    /// Stored API keys.
    keys: RwLock<Vec<ApiKey>>,
    /// Legacy digest index for configuration-file keys.
    legacy_index: RwLock<HashMap<String, IdentityId>>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            keys: RwLock::new(Vec::new()),
            legacy_index: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces an identity.
    pub fn upsert_identity(&self, identity: Identity) {
        if let Ok(mut slot) = self.identities.write() {
            slot.insert(identity.id.clone(), identity);
        }
    }

    /// Removes an identity and revokes its keys. Returns true when found.
    pub fn remove_identity(&self, id: &IdentityId) -> bool {
        let removed = self
            .identities
            .write()
            .map(|mut slot| slot.remove(id).is_some())
            .unwrap_or(false);
        if removed && let Ok(mut keys) = self.keys.write() {
            for key in keys.iter_mut().filter(|key| key.identity_id == *id) {
                key.revoked = true;
            }
        }
        removed
    }

    /// Returns an identity by id.
    #[must_use]
    pub fn identity(&self, id: &IdentityId) -> Option<Identity> {
        self.identities.read().ok().and_then(|slot| slot.get(id).cloned())
    }

    /// Returns every identity.
    #[must_use]
    pub fn list_identities(&self) -> Vec<Identity> {
        self.identities
            .read()
            .map(|slot| slot.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Issues a new API key for an identity, returning the record.
    ///
    /// The caller supplies the cleartext (the server never stores it).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Hashing`] when hashing the cleartext fails.
    pub fn issue_key(
        &self,
        identity_id: IdentityId,
        cleartext: &str,
    ) -> Result<ApiKey, AuthError> {
        let key = ApiKey {
            id: KeyId::generate(),
            identity_id,
            hash: hash_key_argon2(cleartext)?,
            created_at: Utc::now(),
            revoked: false,
        };
        let mut keys = self.keys.write().map_err(|_| AuthError::Poisoned)?;
        keys.push(key.clone());
        Ok(key)
    }

    /// Restores a previously issued key record verbatim (state reload path).
    pub fn restore_key(&self, key: ApiKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.retain(|existing| existing.id != key.id);
            keys.push(key);
        }
    }

    /// Revokes a key by id. Returns true when found.
    pub fn revoke_key(&self, id: &KeyId) -> bool {
        self.keys
            .write()
            .map(|mut keys| {
                keys.iter_mut().find(|key| key.id == *id).is_some_and(|key| {
                    key.revoked = true;
                    true
                })
            })
            .unwrap_or(false)
    }

    /// Returns every stored key record.
    #[must_use]
    pub fn list_keys(&self) -> Vec<ApiKey> {
        self.keys.read().map(|keys| keys.clone()).unwrap_or_default()
    }

    /// Registers a configuration-file key digest for an identity.
    pub fn register_legacy_digest(&self, digest: impl Into<String>, identity_id: IdentityId) {
        if let Ok(mut index) = self.legacy_index.write() {
            index.insert(digest.into(), identity_id);
        }
    }

    /// Resolves a presented cleartext key into an identity.
    ///
    /// The legacy digest index is checked first with constant-time digest
    /// comparison, then every non-revoked Argon2 hash is tried.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for every failure cause.
    pub fn verify_key(&self, cleartext: &str) -> Result<Identity, AuthError> {
        let digest = hash_key_sha256(cleartext);
        if let Ok(index) = self.legacy_index.read() {
            for (candidate, identity_id) in index.iter() {
                if bool::from(candidate.as_bytes().ct_eq(digest.as_bytes()))
                    && let Some(identity) = self.identity(identity_id)
                {
                    return Ok(identity);
                }
            }
        }
        let matched: Option<IdentityId> = {
            let keys = self.keys.read().map_err(|_| AuthError::Poisoned)?;
            keys.iter()
                .filter(|key| !key.revoked)
                .find(|key| verify_argon2(cleartext, &key.hash))
                .map(|key| key.identity_id.clone())
        };
        matched
            .and_then(|identity_id| self.identity(&identity_id))
            .ok_or(AuthError::InvalidCredentials)
    }
}

// ============================================================================
// SECTION: Session Store
// ============================================================================

/// Default session idle timeout.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// In-memory session store with idle expiry.
pub struct SessionStore {
    /// Sessions keyed by id.
    sessions: RwLock<HashMap<SessionId, Session>>,
    /// Sessions keyed by identity id for reuse.
    by_identity: RwLock<HashMap<IdentityId, SessionId>>,
    /// Idle timeout applied on every touch.
    idle_timeout: chrono::Duration,
}

impl SessionStore {
    /// Creates a store with the given idle timeout.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_identity: RwLock::new(HashMap::new()),
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800)),
        }
    }

    /// Returns the live session for an identity, creating one when absent.
    ///
    /// Touching an existing session advances `last_seen` and `expires_at`.
    #[must_use]
    pub fn attach(&self, identity: &Identity) -> Session {
        let now = Utc::now();
        // Read the index in its own scope; taking the session lock while the
        // index lock is held would invert the sweeper's lock order.
        let existing_id = self
            .by_identity
            .read()
            .ok()
            .and_then(|index| index.get(&identity.id).cloned());
        if let Some(session_id) = existing_id
            && let Ok(mut sessions) = self.sessions.write()
            && let Some(session) = sessions.get_mut(&session_id)
            && session.expires_at > now
        {
            session.last_seen = now;
            session.expires_at = now + self.idle_timeout;
            return session.clone();
        }
        let session = Session {
            id: SessionId::generate(),
            identity: identity.clone(),
            created_at: now,
            last_seen: now,
            expires_at: now + self.idle_timeout,
        };
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id.clone(), session.clone());
        }
        if let Ok(mut index) = self.by_identity.write() {
            index.insert(identity.id.clone(), session.id.clone());
        }
        session
    }

    /// Removes expired sessions. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        if let Ok(mut sessions) = self.sessions.write() {
            let before = sessions.len();
            sessions.retain(|_, session| session.expires_at > now);
            removed = before - sessions.len();
            if let Ok(mut index) = self.by_identity.write() {
                index.retain(|_, session_id| sessions.contains_key(session_id));
            }
        }
        removed
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Returns true when no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "session sweeper removed expired sessions");
                }
            }
        })
    }
}

// ============================================================================
// SECTION: Agent Registry
// ============================================================================

/// Registry of currently supervised agents.
#[derive(Default)]
pub struct AgentRegistry {
    /// Registrations keyed by agent id.
    agents: RwLock<HashMap<AgentId, AgentRegistration>>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent, replacing any previous registration with the id.
    pub fn register(&self, registration: AgentRegistration) {
        if let Ok(mut slot) = self.agents.write() {
            slot.insert(registration.id.clone(), registration);
        }
    }

    /// Removes a registration. Returns it when found.
    pub fn unregister(&self, id: &AgentId) -> Option<AgentRegistration> {
        self.agents.write().ok().and_then(|mut slot| slot.remove(id))
    }

    /// Returns every live registration.
    #[must_use]
    pub fn list(&self) -> Vec<AgentRegistration> {
        self.agents.read().map(|slot| slot.values().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    //! Authentication store unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    /// Builds a test identity with one role.
    fn identity(id: &str, role: &str) -> Identity {
        Identity {
            id: IdentityId::new(id),
            name: id.to_string(),
            roles: vec![role.to_string()],
        }
    }

    #[test]
    fn verify_key_resolves_issued_keys() {
        let store = AuthStore::new();
        store.upsert_identity(identity("alice", "admin"));
        store.issue_key(IdentityId::new("alice"), "sg_test_key").unwrap();
        let resolved = store.verify_key("sg_test_key").unwrap();
        assert_eq!(resolved.id, IdentityId::new("alice"));
    }

    #[test]
    fn verify_key_failure_message_is_uniform() {
        let store = AuthStore::new();
        store.upsert_identity(identity("alice", "admin"));
        store.issue_key(IdentityId::new("alice"), "sg_real").unwrap();
        let unknown = store.verify_key("sg_wrong").unwrap_err();
        let empty = store.verify_key("").unwrap_err();
        assert_eq!(unknown.to_string(), empty.to_string());
    }

    #[test]
    fn revoked_keys_no_longer_authenticate() {
        let store = AuthStore::new();
        store.upsert_identity(identity("bob", "agent"));
        let key = store.issue_key(IdentityId::new("bob"), "sg_bob").unwrap();
        assert!(store.verify_key("sg_bob").is_ok());
        assert!(store.revoke_key(&key.id));
        assert!(store.verify_key("sg_bob").is_err());
    }

    #[test]
    fn legacy_digest_index_resolves_config_keys() {
        let store = AuthStore::new();
        store.upsert_identity(identity("cfg", "admin"));
        store.register_legacy_digest(hash_key_sha256("configured-key"), IdentityId::new("cfg"));
        let resolved = store.verify_key("configured-key").unwrap();
        assert_eq!(resolved.id, IdentityId::new("cfg"));
    }

    #[test]
    fn sha256_hash_has_stable_format() {
        let digest = hash_key_sha256("abc");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
    }

    #[test]
    fn sessions_are_reused_until_idle_expiry() {
        let store = SessionStore::new(Duration::from_secs(60));
        let alice = identity("alice", "admin");
        let first = store.attach(&alice);
        let second = store.attach(&alice);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_removes_expired_sessions() {
        let store = SessionStore::new(Duration::from_secs(0));
        let alice = identity("alice", "admin");
        let _session = store.attach(&alice);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }
}
