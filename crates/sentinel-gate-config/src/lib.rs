// crates/sentinel-gate-config/src/lib.rs
// ============================================================================
// Module: SentinelGate Config Library
// Description: Configuration loading/validation and the persisted state doc.
// Purpose: Fail-closed configuration for the gateway runtime.
// Dependencies: sentinel-gate-core, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits and
//! field-level validation; the persisted state document is a JSON file
//! written with atomic renames and a `.bak` sibling snapshot.
//!
//! Security posture: config and state inputs are untrusted on load; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod state;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::ApprovalConfig;
pub use config::AuditConfig;
pub use config::AuthConfig;
pub use config::ConfigApiKey;
pub use config::ConfigError;
pub use config::PolicyLimitsConfig;
pub use config::RateLimitSection;
pub use config::ScannerConfig;
pub use config::SentinelConfig;
pub use config::ServerConfig;
pub use config::TlsInspectionConfig;
pub use config::UpstreamConfig;
pub use config::UpstreamTransport;
pub use state::ReverseProxyTarget;
pub use state::StateDocument;
pub use state::StateError;
pub use state::StateStore;
