// crates/sentinel-gate-gateway/src/tlsca.rs
// ============================================================================
// Module: TLS Inspection Authority
// Description: Per-host leaf certificate minting from a persistent local CA.
// Purpose: Terminate CONNECT streams with short-lived, host-specific leaves.
// Dependencies: rcgen, rustls, rustls-pki-types, time
// ============================================================================

//! ## Overview
//! The local root CA lives on disk (PEM cert + key). For every inspected
//! host the authority mints a short-lived leaf certificate signed by that
//! root and caches the resulting rustls server config until the leaf nears
//! expiry. Root construction and OS trust-store installation happen outside
//! this module.
//!
//! Security posture: hostnames come from untrusted CONNECT requests and are
//! used only as SAN values; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rcgen::CertificateParams;
use rcgen::Issuer;
use rcgen::KeyPair;
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::pem::PemObject;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// TLS authority errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum TlsCaError {
    /// CA material could not be read.
    #[error("ca read failed: {0}")]
    Read(String),
    /// CA material could not be parsed.
    #[error("ca parse failed: {0}")]
    Parse(String),
    /// Leaf issuance failed.
    #[error("leaf issuance failed for {host}: {reason}")]
    Issue {
        /// Host the leaf was minted for.
        host: String,
        /// Failure detail.
        reason: String,
    },
}

// ============================================================================
// SECTION: Authority
// ============================================================================

/// One cached leaf.
struct CachedLeaf {
    /// Ready-to-serve rustls config.
    config: Arc<ServerConfig>,
    /// Instant after which the leaf is re-minted.
    refresh_after: Instant,
}

/// Leaf-minting authority over a persistent local root.
pub struct TlsAuthority {
    /// Root certificate PEM (kept for issuing).
    issuer: Issuer<'static, KeyPair>,
    /// Leaf lifetime.
    leaf_ttl: Duration,
    /// Minted leaves keyed by host.
    cache: Mutex<HashMap<String, CachedLeaf>>,
}

impl TlsAuthority {
    /// Loads the root CA from PEM files on disk.
    ///
    /// # Errors
    ///
    /// Returns [`TlsCaError`] when the material is unreadable or invalid.
    pub fn load(cert_path: &Path, key_path: &Path, leaf_ttl: Duration) -> Result<Self, TlsCaError> {
        let cert_pem =
            std::fs::read_to_string(cert_path).map_err(|err| TlsCaError::Read(err.to_string()))?;
        let key_pem =
            std::fs::read_to_string(key_path).map_err(|err| TlsCaError::Read(err.to_string()))?;
        let key = KeyPair::from_pem(&key_pem).map_err(|err| TlsCaError::Parse(err.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
            .map_err(|err| TlsCaError::Parse(err.to_string()))?;
        Ok(Self {
            issuer,
            leaf_ttl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a server config with a leaf for the host, minting when absent
    /// or near expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TlsCaError::Issue`] when minting fails.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, TlsCaError> {
        if let Ok(cache) = self.cache.lock()
            && let Some(leaf) = cache.get(host)
            && leaf.refresh_after > Instant::now()
        {
            return Ok(Arc::clone(&leaf.config));
        }
        let config = self.mint(host)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                host.to_string(),
                CachedLeaf {
                    config: Arc::clone(&config),
                    // Re-mint at 80% of the lifetime so a cached leaf never
                    // reaches a client close to expiry.
                    refresh_after: Instant::now() + self.leaf_ttl.mul_f32(0.8),
                },
            );
        }
        Ok(config)
    }

    /// Mints a fresh leaf and wraps it in a rustls server config.
    fn mint(&self, host: &str) -> Result<Arc<ServerConfig>, TlsCaError> {
        let issue = |reason: String| TlsCaError::Issue {
            host: host.to_string(),
            reason,
        };
        let leaf_key = KeyPair::generate().map_err(|err| issue(err.to_string()))?;
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|err| issue(err.to_string()))?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now
            + time::Duration::seconds(i64::try_from(self.leaf_ttl.as_secs()).unwrap_or(86_400));
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|err| issue(err.to_string()))?;

        let cert_der = CertificateDer::from_pem_slice(cert.pem().as_bytes())
            .map_err(|err| issue(err.to_string()))?;
        let key_der = PrivateKeyDer::from_pem_slice(leaf_key.serialize_pem().as_bytes())
            .map_err(|err| issue(err.to_string()))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|err| issue(err.to_string()))?;
        Ok(Arc::new(config))
    }
}
