// crates/sentinel-gate-supervisor/src/supervisor.rs
// ============================================================================
// Module: Agent Supervisor
// Description: Orchestrates the supervised child from startup to teardown.
// Purpose: Govern an untrusted agent process without modifying it.
// Dependencies: tokio, crate modules
// ============================================================================

//! ## Overview
//! The `run` flow: validate and classify the command, ensure a gateway is
//! reachable (forking a background daemon when not), generate the per-run
//! credential, register with the gateway (falling back to the local key),
//! stage the bootstrap hooks, build the child environment, install host-tool
//! hooks for Claude/Gemini, spawn the child with inherited stdio, and wait.
//! The parent ignores SIGINT/SIGTERM; the terminal delivers them to the
//! child directly. Teardown runs in a fixed order on every exit path:
//! unregister, remove bootstrap, restore host-tool settings, stop an owned
//! daemon.
//!
//! Security posture: the child is assumed compromised; nothing it writes is
//! trusted, and its credential is revoked on exit; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::process::Stdio;

use sentinel_gate_core::ids::AgentId;
use thiserror::Error;

use crate::bootstrap::Bootstrap;
use crate::bootstrap::EnvSpec;
use crate::bootstrap::build_child_env;
use crate::daemon;
use crate::framework::Runtime;
use crate::framework::detect_framework;
use crate::framework::detect_runtime;
use crate::hosttools;
use crate::hosttools::HostTool;
use crate::registration::AdminClient;
use crate::registration::Registration;
use crate::registration::generate_runtime_key;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Options for one supervised run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Command to supervise.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Gateway address (`host:port`).
    pub server_addr: String,
    /// Allow-cache TTL for the hooks, in seconds.
    pub cache_ttl_secs: u64,
    /// Hook fail mode (`open` or `closed`).
    pub fail_mode: String,
}

/// Supervisor errors.
///
/// # Invariants
/// - Variants are stable for CLI error mapping.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Options failed validation.
    #[error("invalid run options: {0}")]
    Invalid(String),
    /// The gateway could not be made reachable.
    #[error(transparent)]
    Daemon(#[from] daemon::DaemonError),
    /// Bootstrap staging failed.
    #[error(transparent)]
    Bootstrap(#[from] crate::bootstrap::BootstrapError),
    /// Host-tool hook installation failed.
    #[error(transparent)]
    HostTool(#[from] hosttools::HostToolError),
    /// Spawning the child failed.
    #[error("child spawn failed: {0}")]
    Spawn(String),
}

// ============================================================================
// SECTION: Run
// ============================================================================

/// Supervises the child and returns its exit code.
///
/// # Errors
///
/// Returns [`SupervisorError`] for failures before the child starts; once
/// the child runs, its exit code is propagated (non-zero included).
pub async fn run(options: RunOptions) -> Result<i32, SupervisorError> {
    if options.command.is_empty() {
        return Err(SupervisorError::Invalid("command must not be empty".to_string()));
    }
    if !matches!(options.fail_mode.as_str(), "open" | "closed") {
        return Err(SupervisorError::Invalid(format!(
            "fail mode must be open or closed, got {}",
            options.fail_mode
        )));
    }

    let parent_env: Vec<(String, String)> = std::env::vars().collect();
    let framework = detect_framework(
        &std::iter::once(options.command.clone())
            .chain(options.args.iter().cloned())
            .collect::<Vec<_>>(),
        &parent_env,
    );
    let runtime = detect_runtime(&options.command);

    // Gateway first: the hooks are useless without one.
    let owned_daemon = daemon::ensure_gateway(&options.server_addr).await?;

    let agent_id = AgentId::generate();
    let local_key = generate_runtime_key();
    let admin_client = read_admin_key()
        .and_then(|admin_key| AdminClient::new(&options.server_addr, admin_key).ok());
    let registration = match &admin_client {
        Some(client) => match client
            .register(
                &agent_id,
                &options.command,
                &options.args,
                framework.map(|f| f.as_str()),
                &options.fail_mode,
                &local_key,
            )
            .await
        {
            Ok(registration) => registration,
            Err(err) => {
                tracing::warn!(error = %err, "gateway registration failed; using local key");
                unregistered(&agent_id, &local_key)
            }
        },
        None => {
            tracing::warn!("no admin credential available; using local key");
            unregistered(&agent_id, &local_key)
        }
    };

    let home = daemon::home_dir();
    let bootstrap = Bootstrap::create(&home)?;

    let ca_bundle = home.join("ca").join("sentinelgate-ca.pem");
    let env = build_child_env(
        &parent_env,
        &bootstrap,
        &EnvSpec {
            server_addr: &options.server_addr,
            api_key: &registration.api_key,
            agent_id: agent_id.as_str(),
            cache_ttl_secs: options.cache_ttl_secs,
            fail_mode: &options.fail_mode,
            framework: framework.map(|f| f.as_str()),
            runtime,
            ca_bundle: Some(&ca_bundle),
        },
    );

    let host_tool = match runtime {
        Runtime::Claude => Some(HostTool::Claude),
        Runtime::Gemini => Some(HostTool::Gemini),
        _ => None,
    };
    let user_home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let mut host_tool_installed = false;
    if let Some(tool) = host_tool {
        match hosttools::setup(tool, &user_home) {
            Ok(()) => host_tool_installed = true,
            Err(err) => {
                // Without the host hook the run is unsupervised; stop here,
                // but still tear down what we built.
                teardown(
                    &admin_client,
                    &registration,
                    &bootstrap,
                    None,
                    false,
                    &user_home,
                    owned_daemon,
                )
                .await;
                return Err(err.into());
            }
        }
    }

    let exit_code = spawn_and_wait(&options, env).await;

    teardown(
        &admin_client,
        &registration,
        &bootstrap,
        host_tool,
        host_tool_installed,
        &user_home,
        owned_daemon,
    )
    .await;

    exit_code
}

/// Builds the fallback registration when the gateway is not cooperating.
fn unregistered(agent_id: &AgentId, local_key: &str) -> Registration {
    Registration {
        agent_id: agent_id.clone(),
        identity_id: None,
        key_id: None,
        api_key: local_key.to_string(),
        registered: false,
    }
}

/// Reads the operator admin credential written by the gateway on first boot.
fn read_admin_key() -> Option<String> {
    let path = daemon::home_dir().join("admin.key");
    std::fs::read_to_string(path).ok().map(|key| key.trim().to_string())
}

/// Spawns the child with inherited stdio and waits, ignoring terminal
/// signals in the parent.
async fn spawn_and_wait(
    options: &RunOptions,
    env: Vec<(String, String)>,
) -> Result<i32, SupervisorError> {
    let mut command = tokio::process::Command::new(&options.command);
    command
        .args(&options.args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = command.spawn().map_err(|err| SupervisorError::Spawn(err.to_string()))?;

    // The terminal delivers SIGINT/SIGTERM to the child's process group;
    // installing no-op handlers keeps the parent alive for teardown.
    #[cfg(unix)]
    let _signal_guards = {
        let int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        let term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        (int, term)
    };

    let status =
        child.wait().await.map_err(|err| SupervisorError::Spawn(err.to_string()))?;
    Ok(status.code().unwrap_or(1))
}

/// Ordered teardown, run on every exit path: unregister, remove bootstrap,
/// restore host-tool settings, stop an owned daemon.
async fn teardown(
    admin_client: &Option<AdminClient>,
    registration: &Registration,
    bootstrap: &Bootstrap,
    host_tool: Option<HostTool>,
    host_tool_installed: bool,
    user_home: &std::path::Path,
    owned_daemon: Option<u32>,
) {
    if registration.registered
        && let Some(client) = admin_client
    {
        client.unregister(registration).await;
    }
    bootstrap.remove();
    if host_tool_installed
        && let Some(tool) = host_tool
        && let Err(err) = hosttools::cleanup(tool, user_home)
    {
        tracing::warn!(error = %err, "host tool cleanup failed");
    }
    if let Some(pid) = owned_daemon {
        daemon::stop_pid(pid).await;
    }
}
