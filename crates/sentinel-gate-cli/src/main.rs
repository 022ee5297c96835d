// crates/sentinel-gate-cli/src/main.rs
// ============================================================================
// Module: SentinelGate CLI Entry Point
// Description: Command dispatcher for gateway and supervisor workflows.
// Purpose: Provide the `sentinel-gate` binary surface.
// Dependencies: clap, sentinel-gate-gateway, sentinel-gate-supervisor, tokio
// ============================================================================

//! ## Overview
//! Commands: `start` (serve the gateway, optionally with a single stdio
//! upstream after `--`, or as a stdio MCP adapter with `--stdio`), `run`
//! (supervise a child per the agent supervisor), `stop` (PID-file stop),
//! `reset` (remove persisted state), `hash-key` (config digest helper),
//! `trust-ca` (OS trust-store install), `version`, and the hidden
//! `claude-hook` entry used by Claude PreToolUse hooks.
//! Security posture: inputs are untrusted and must be validated; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use rand::RngCore;
use sentinel_gate_config::SentinelConfig;
use sentinel_gate_config::UpstreamConfig;
use sentinel_gate_config::UpstreamTransport;
use sentinel_gate_config::config::CONFIG_ENV_VAR;
use sentinel_gate_config::config::STATE_PATH_ENV_VAR;
use sentinel_gate_core::Identity;
use sentinel_gate_core::IdentityId;
use sentinel_gate_core::hash_key_sha256;
use sentinel_gate_supervisor::RunOptions;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// SentinelGate: a security proxy between AI agents and their tools.
#[derive(Parser, Debug)]
#[command(name = "sentinel-gate", version, about)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway. With `--` a single stdio upstream is launched from
    /// the given command.
    Start {
        /// Serve MCP on stdio instead of HTTP (host-tool integration).
        #[arg(long)]
        stdio: bool,
        /// Optional config file path.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Command (after `--`) launched as a stdio upstream.
        #[arg(last = true)]
        upstream_command: Vec<String>,
    },
    /// Supervise a child process behind the gateway.
    Run {
        /// Gateway address.
        #[arg(long, default_value = "127.0.0.1:8400")]
        server_addr: String,
        /// Hook allow-cache TTL in seconds.
        #[arg(long, default_value_t = 5)]
        cache_ttl: u64,
        /// Hook fail mode.
        #[arg(long, default_value = "open", value_parser = ["open", "closed"])]
        fail_mode: String,
        /// Command (after `--`) to supervise.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Stop a running gateway via its PID file.
    Stop,
    /// Remove persisted state.
    Reset {
        /// Also remove the audit/server log.
        #[arg(long)]
        include_audit: bool,
        /// Also remove TLS-inspection CA material.
        #[arg(long)]
        include_certs: bool,
        /// Skip the confirmation requirement.
        #[arg(long)]
        force: bool,
    },
    /// Emit `sha256:<hex>` for a cleartext key (config files).
    HashKey {
        /// Cleartext key to digest.
        key: String,
    },
    /// Install or remove the local CA in the OS trust store.
    TrustCa {
        /// CA certificate path (defaults to the managed CA).
        #[arg(long)]
        cert: Option<PathBuf>,
        /// Remove instead of install.
        #[arg(long)]
        uninstall: bool,
    },
    /// Print version and build information.
    Version,
    /// Claude PreToolUse hook entry (reads a JSON event on stdin).
    #[command(hide = true)]
    ClaudeHook,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI errors surfaced to the operator.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration failed to load or validate.
    #[error("{0}")]
    Config(String),
    /// Gateway bootstrap or serve failed.
    #[error("{0}")]
    Serve(String),
    /// Supervisor run failed.
    #[error("{0}")]
    Supervisor(String),
    /// Generic command failure.
    #[error("{0}")]
    Command(String),
}

/// CLI result alias.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes one line to stdout.
fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.write_all(b"\n")
}

/// Writes one line to stderr.
fn write_stderr_line(line: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr().lock();
    stderr.write_all(line.as_bytes())?;
    stderr.write_all(b"\n")
}

/// Reports an error and returns the failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(&format!("sentinel-gate: {message}"));
    ExitCode::FAILURE
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            stdio,
            config,
            upstream_command,
        } => command_start(stdio, config, upstream_command).await,
        Commands::Run {
            server_addr,
            cache_ttl,
            fail_mode,
            command,
        } => command_run(server_addr, cache_ttl, fail_mode, command).await,
        Commands::Stop => command_stop().await,
        Commands::Reset {
            include_audit,
            include_certs,
            force,
        } => command_reset(include_audit, include_certs, force),
        Commands::HashKey {
            key,
        } => command_hash_key(&key),
        Commands::TrustCa {
            cert,
            uninstall,
        } => command_trust_ca(cert, uninstall),
        Commands::Version => command_version(),
        Commands::ClaudeHook => command_claude_hook().await,
    }
}

// ============================================================================
// SECTION: Start Command
// ============================================================================

/// Resolves the config path: flag, env, then the default location.
fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| sentinel_gate_gateway::home_dir().join("sentinel-gate.toml"))
}

/// Loads configuration, tolerating a missing default file.
fn load_config(flag: Option<PathBuf>) -> CliResult<SentinelConfig> {
    let path = config_path(flag);
    let mut config = if path.exists() {
        SentinelConfig::load(&path).map_err(|err| CliError::Config(err.to_string()))?
    } else {
        SentinelConfig::default()
    };
    if config.state_path.is_none() {
        config.state_path = std::env::var(STATE_PATH_ENV_VAR).ok().map(PathBuf::from).or_else(
            || Some(sentinel_gate_gateway::home_dir().join("state.json")),
        );
    }
    Ok(config)
}

/// Seeds the operator admin identity and key on first boot, writing the
/// cleartext to `~/.sentinelgate/admin.key` (mode 0600) for local tools.
fn seed_admin_credential(state: &sentinel_gate_gateway::GatewayState) -> CliResult<()> {
    let has_admin =
        state.auth.list_identities().iter().any(|identity| identity.has_role("admin"));
    if has_admin {
        return Ok(());
    }
    let identity = Identity {
        id: IdentityId::new("admin"),
        name: "admin".to_string(),
        roles: vec!["admin".to_string()],
    };
    state.auth.upsert_identity(identity);
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let cleartext = format!("sg_admin_{}", hex::encode(bytes));
    state
        .auth
        .issue_key(IdentityId::new("admin"), &cleartext)
        .map_err(|err| CliError::Serve(err.to_string()))?;
    let home = sentinel_gate_gateway::home_dir();
    std::fs::create_dir_all(&home).map_err(|err| CliError::Serve(err.to_string()))?;
    let key_path = home.join("admin.key");
    std::fs::write(&key_path, &cleartext).map_err(|err| CliError::Serve(err.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }
    state.persist();
    tracing::info!(path = %key_path.display(), "admin credential issued");
    Ok(())
}

/// Executes the `start` command.
async fn command_start(
    stdio: bool,
    config: Option<PathBuf>,
    upstream_command: Vec<String>,
) -> CliResult<ExitCode> {
    let mut config = load_config(config)?;
    if let Some((command, args)) = upstream_command.split_first() {
        config.upstreams.push(UpstreamConfig {
            id: "cli-upstream".to_string(),
            name: command.clone(),
            transport: UpstreamTransport::Stdio,
            endpoint: None,
            command: Some(command.clone()),
            args: args.to_vec(),
            backoff_ceiling_secs: 60,
        });
    }
    let state =
        sentinel_gate_gateway::build_state(config).map_err(|err| CliError::Serve(err.to_string()))?;
    seed_admin_credential(&state)?;
    if stdio {
        sentinel_gate_gateway::run_stdio(state).await.map_err(CliError::Serve)?;
        return Ok(ExitCode::SUCCESS);
    }
    sentinel_gate_gateway::run(state).await.map_err(|err| CliError::Serve(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Run Command
// ============================================================================

/// Executes the `run` command (agent supervisor).
async fn command_run(
    server_addr: String,
    cache_ttl: u64,
    fail_mode: String,
    command: Vec<String>,
) -> CliResult<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        return Err(CliError::Supervisor("run requires a command after --".to_string()));
    };
    let exit = sentinel_gate_supervisor::run(RunOptions {
        command: program.clone(),
        args: args.to_vec(),
        server_addr,
        cache_ttl_secs: cache_ttl,
        fail_mode,
    })
    .await
    .map_err(|err| CliError::Supervisor(err.to_string()))?;
    Ok(u8::try_from(exit.clamp(0, 255)).map_or(ExitCode::FAILURE, ExitCode::from))
}

// ============================================================================
// SECTION: Stop / Reset Commands
// ============================================================================

/// Executes the `stop` command.
async fn command_stop() -> CliResult<ExitCode> {
    sentinel_gate_supervisor::stop_by_pid_file()
        .await
        .map_err(|err| CliError::Command(err.to_string()))?;
    write_stdout_line("gateway stopped").map_err(|err| CliError::Command(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `reset` command.
fn command_reset(include_audit: bool, include_certs: bool, force: bool) -> CliResult<ExitCode> {
    if !force {
        return Err(CliError::Command(
            "reset removes persisted state; pass --force to confirm".to_string(),
        ));
    }
    let home = sentinel_gate_gateway::home_dir();
    let state = home.join("state.json");
    let _ = std::fs::remove_file(&state);
    let _ = std::fs::remove_file(home.join("state.json.bak"));
    if include_audit {
        let _ = std::fs::remove_file(home.join("server.log"));
    }
    if include_certs {
        let _ = std::fs::remove_dir_all(home.join("ca"));
    }
    write_stdout_line("state removed").map_err(|err| CliError::Command(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Utility Commands
// ============================================================================

/// Executes the `hash-key` command.
fn command_hash_key(key: &str) -> CliResult<ExitCode> {
    write_stdout_line(&hash_key_sha256(key)).map_err(|err| CliError::Command(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `trust-ca` command.
fn command_trust_ca(cert: Option<PathBuf>, uninstall: bool) -> CliResult<ExitCode> {
    let cert = cert
        .unwrap_or_else(|| sentinel_gate_gateway::home_dir().join("ca").join("sentinelgate-ca.pem"));
    if !uninstall && !cert.exists() {
        return Err(CliError::Command(format!("ca certificate not found at {}", cert.display())));
    }
    // Trust-store mechanics differ per OS; delegate to the platform tool.
    let (program, args): (&str, Vec<String>) = if cfg!(target_os = "macos") {
        (
            "security",
            vec![
                if uninstall { "remove-trusted-cert" } else { "add-trusted-cert" }.to_string(),
                cert.display().to_string(),
            ],
        )
    } else if cfg!(target_os = "linux") {
        // The system tool only scans its trust directory, so the cert is
        // copied there (or removed from there) first.
        let installed = PathBuf::from("/usr/local/share/ca-certificates/sentinelgate-ca.crt");
        if uninstall {
            let _ = std::fs::remove_file(&installed);
            ("update-ca-certificates", vec!["--fresh".to_string()])
        } else {
            std::fs::copy(&cert, &installed).map_err(|err| {
                CliError::Command(format!("copy to {} failed: {err}", installed.display()))
            })?;
            ("update-ca-certificates", Vec::new())
        }
    } else {
        (
            "certutil",
            vec![
                if uninstall { "-delstore" } else { "-addstore" }.to_string(),
                "Root".to_string(),
                cert.display().to_string(),
            ],
        )
    };
    let status = std::process::Command::new(program)
        .args(&args)
        .status()
        .map_err(|err| CliError::Command(format!("{program} failed to start: {err}")))?;
    if status.success() {
        write_stdout_line(if uninstall { "ca removed" } else { "ca installed" })
            .map_err(|err| CliError::Command(err.to_string()))?;
        Ok(ExitCode::SUCCESS)
    } else {
        Err(CliError::Command(format!("{program} exited with {status}")))
    }
}

/// Executes the `version` command.
fn command_version() -> CliResult<ExitCode> {
    let line = format!(
        "sentinel-gate {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("SENTINEL_GATE_COMMIT").unwrap_or("unknown"),
        option_env!("SENTINEL_GATE_BUILD_DATE").unwrap_or("unknown"),
    );
    write_stdout_line(&line).map_err(|err| CliError::Command(err.to_string()))?;
    write_stdout_line(&format!("rustc {}", option_env!("SENTINEL_GATE_RUSTC").unwrap_or("unknown")))
        .map_err(|err| CliError::Command(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the hidden `claude-hook` command.
async fn command_claude_hook() -> CliResult<ExitCode> {
    sentinel_gate_supervisor::claudehook::run()
        .await
        .map_err(|err| CliError::Command(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}
