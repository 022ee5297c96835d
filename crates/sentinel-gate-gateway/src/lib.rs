// crates/sentinel-gate-gateway/src/lib.rs
// ============================================================================
// Module: SentinelGate Gateway Library
// Description: Gateway runtime: ingresses, admin surface, upstream manager.
// Purpose: Serve the decision pipeline over MCP and HTTP surfaces.
// Dependencies: see Cargo.toml
// ============================================================================

//! ## Overview
//! The gateway crate assembles the core pipeline into a running service: the
//! MCP JSON-RPC ingress (streamable HTTP + stdio), the HTTP forward/reverse
//! proxy with CONNECT and TLS inspection, the admin + decision API, the
//! upstream manager with reconnecting stdio/http clients, and process
//! lifecycle (PID file, signals, graceful shutdown).
//!
//! Security posture: both ingresses admit hostile traffic; every request is
//! translated into a canonical action exactly once on entry; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod admin;
pub mod httpgw;
pub mod mcp;
pub mod server;
pub mod tlsca;
pub mod upstream;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use admin::CSRF_COOKIE;
pub use admin::CSRF_HEADER;
pub use mcp::CORRELATION_HEADER;
pub use mcp::run_stdio;
pub use server::GatewayState;
pub use server::ServeError;
pub use server::build_state;
pub use server::home_dir;
pub use server::pid_file;
pub use server::remove_pid_file;
pub use server::run;
pub use server::write_pid_file;
pub use tlsca::TlsAuthority;
pub use upstream::UpstreamManager;
pub use upstream::UpstreamStatus;
