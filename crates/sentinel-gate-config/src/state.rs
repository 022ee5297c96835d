// crates/sentinel-gate-config/src/state.rs
// ============================================================================
// Module: Persisted State Document
// Description: Atomic-rename JSON persistence with a .bak sibling.
// Purpose: Survive crashes with either the new snapshot or the previous one.
// Dependencies: sentinel-gate-core, serde_json, tempfile
// ============================================================================

//! ## Overview
//! The gateway persists identities, API keys, policies, upstreams, outbound
//! rules, reverse-proxy targets, TLS-inspection config, and scanner config as
//! one JSON document. Writes go to a temporary file in the same directory and
//! are renamed into place; the previous document becomes the `.bak` sibling
//! first. A read returns a consistent snapshot or an IO error; when the
//! primary is corrupt the `.bak` snapshot is tried before giving up.
//!
//! Security posture: state files are untrusted on load (another process may
//! have written them); see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use sentinel_gate_core::ApiKey;
use sentinel_gate_core::Identity;
use sentinel_gate_core::OutboundRule;
use sentinel_gate_core::Policy;
use sentinel_gate_core::ScanMode;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::TlsInspectionConfig;
use crate::config::UpstreamConfig;

// ============================================================================
// SECTION: Document
// ============================================================================

/// Reverse-proxy mapping from a path prefix to an upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseProxyTarget {
    /// Path prefix the target owns.
    pub path_prefix: String,
    /// Upstream base URL requests are rewritten to.
    pub upstream: String,
}

/// The persisted state document.
///
/// # Invariants
/// - `version` gates future migrations; unknown versions fail the load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    /// Document version.
    #[serde(default)]
    pub version: u32,
    /// Stored identities.
    #[serde(default)]
    pub identities: Vec<Identity>,
    /// Stored API keys (hashes only).
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    /// Stored policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Stored upstreams.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// Stored outbound rules.
    #[serde(default)]
    pub outbound_rules: Vec<OutboundRule>,
    /// Reverse-proxy targets for the HTTP gateway.
    #[serde(default)]
    pub http_targets: Vec<ReverseProxyTarget>,
    /// TLS inspection configuration.
    #[serde(default)]
    pub tls_inspection: TlsInspectionConfig,
    /// Response scanner mode.
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
}

/// Default persisted scanner mode.
const fn default_scan_mode() -> ScanMode {
    ScanMode::Disabled
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// State persistence errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum StateError {
    /// Read or write IO failed.
    #[error("state io error for {path}: {reason}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// IO error text.
        reason: String,
    },
    /// Both the primary and backup documents failed to parse.
    #[error("state corrupt at {path}: {reason}")]
    Corrupt {
        /// Offending path.
        path: PathBuf,
        /// Parse error text.
        reason: String,
    },
    /// Document version is newer than this binary understands.
    #[error("state version {found} is unsupported (max {max})")]
    Version {
        /// Version found in the document.
        found: u32,
        /// Maximum supported version.
        max: u32,
    },
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Current document version.
const STATE_VERSION: u32 = 1;

/// Atomic-rename state store.
pub struct StateStore {
    /// Primary document path.
    path: PathBuf,
}

impl StateStore {
    /// Creates a store over the given document path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
        }
    }

    /// Returns the primary document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the `.bak` sibling path.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Loads the document, trying the backup when the primary is corrupt.
    ///
    /// A missing file yields the default (empty) document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when IO fails or both snapshots are corrupt.
    pub fn load(&self) -> Result<StateDocument, StateError> {
        match self.read_one(&self.path) {
            Ok(Some(document)) => Ok(document),
            Ok(None) => Ok(StateDocument {
                version: STATE_VERSION,
                ..StateDocument::default()
            }),
            Err(primary_err) => match self.read_one(&self.backup_path()) {
                Ok(Some(document)) => Ok(document),
                _ => Err(primary_err),
            },
        }
    }

    /// Reads and parses one snapshot; `Ok(None)` means the file is absent.
    fn read_one(&self, path: &Path) -> Result<Option<StateDocument>, StateError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        };
        let document: StateDocument =
            serde_json::from_slice(&bytes).map_err(|err| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        if document.version > STATE_VERSION {
            return Err(StateError::Version {
                found: document.version,
                max: STATE_VERSION,
            });
        }
        Ok(Some(document))
    }

    /// Persists the document: snapshot the previous file to `.bak`, write a
    /// temporary file in the same directory, then rename it into place.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] when any step fails; the previous snapshot
    /// stays intact on failure.
    pub fn save(&self, document: &StateDocument) -> Result<(), StateError> {
        let mut document = document.clone();
        document.version = STATE_VERSION;
        let serialized =
            serde_json::to_vec_pretty(&document).map_err(|err| StateError::Io {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| StateError::Io {
            path: parent.to_path_buf(),
            reason: err.to_string(),
        })?;
        if self.path.exists() {
            fs::copy(&self.path, self.backup_path()).map_err(|err| StateError::Io {
                path: self.backup_path(),
                reason: err.to_string(),
            })?;
        }
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|err| StateError::Io {
            path: parent.to_path_buf(),
            reason: err.to_string(),
        })?;
        temp.write_all(&serialized).map_err(|err| StateError::Io {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        temp.flush().map_err(|err| StateError::Io {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        temp.persist(&self.path).map_err(|err| StateError::Io {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! State persistence unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    #[test]
    fn missing_file_loads_the_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let document = store.load().unwrap();
        assert!(document.identities.is_empty());
        assert_eq!(document.version, STATE_VERSION);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut document = StateDocument::default();
        document.http_targets.push(ReverseProxyTarget {
            path_prefix: "/api".to_string(),
            upstream: "http://127.0.0.1:9000".to_string(),
        });
        store.save(&document).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.http_targets, document.http_targets);
    }

    #[test]
    fn corrupt_primary_falls_back_to_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut document = StateDocument::default();
        document.http_targets.push(ReverseProxyTarget {
            path_prefix: "/v1".to_string(),
            upstream: "http://127.0.0.1:9001".to_string(),
        });
        store.save(&document).unwrap();
        // A second save creates the .bak snapshot of the first document.
        store.save(&document).unwrap();
        fs::write(store.path(), b"{not json").unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.http_targets, document.http_targets);
    }

    #[test]
    fn newer_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, format!("{{\"version\": {}}}", STATE_VERSION + 1)).unwrap();
        let store = StateStore::new(path);
        assert!(matches!(store.load(), Err(StateError::Version { .. })));
    }
}
