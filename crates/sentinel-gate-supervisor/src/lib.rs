// crates/sentinel-gate-supervisor/src/lib.rs
// ============================================================================
// Module: SentinelGate Supervisor Library
// Description: The `run` subsystem: hooks, environment, host tools, daemon.
// Purpose: Govern untrusted agent processes without modifying them.
// Dependencies: see Cargo.toml
// ============================================================================

//! ## Overview
//! The supervisor wraps an untrusted child (Python, Node, Claude, Gemini):
//! it guarantees a gateway exists, issues a per-run credential, stages
//! interception hooks, builds the child environment so its subprocess, file,
//! and HTTP activity flows through the gateway's decision API, and restores
//! every touched resource on exit.
//!
//! Security posture: the supervised child is assumed hostile; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod bootstrap;
pub mod claudehook;
pub mod daemon;
pub mod framework;
pub mod hooks;
pub mod hosttools;
pub mod registration;
pub mod supervisor;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use bootstrap::Bootstrap;
pub use bootstrap::EnvSpec;
pub use bootstrap::build_child_env;
pub use daemon::ensure_gateway;
pub use daemon::home_dir;
pub use daemon::stop_by_pid_file;
pub use framework::Framework;
pub use framework::Runtime;
pub use framework::detect_framework;
pub use framework::detect_runtime;
pub use hosttools::HostTool;
pub use registration::AdminClient;
pub use registration::Registration;
pub use registration::generate_runtime_key;
pub use supervisor::RunOptions;
pub use supervisor::SupervisorError;
pub use supervisor::run;
