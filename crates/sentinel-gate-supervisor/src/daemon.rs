// crates/sentinel-gate-supervisor/src/daemon.rs
// ============================================================================
// Module: Gateway Daemon Management
// Description: Reachability checks, background daemon launch, and stop.
// Purpose: Guarantee a gateway exists before the child starts.
// Dependencies: dirs, libc (unix), reqwest, tokio
// ============================================================================

//! ## Overview
//! The supervisor needs a reachable gateway. When `/health` does not answer,
//! it forks a background daemon (the current executable with `start`), logs
//! to `~/.sentinelgate/server.log`, and polls health for up to 15 seconds.
//! A daemon the supervisor started is stopped on teardown: SIGTERM first,
//! SIGKILL after 5 seconds. `stop_by_pid_file` implements the `stop` command
//! contract (200 ms liveness polls for up to 10 seconds, then SIGKILL).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Health polls during daemon boot (bounded retry).
const BOOT_POLLS: u32 = 30;
/// Interval between boot health polls.
const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace between SIGTERM and SIGKILL when stopping our own daemon.
const DAEMON_KILL_GRACE: Duration = Duration::from_secs(5);
/// Liveness poll interval for `stop`.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Total liveness wait for `stop` before SIGKILL.
const STOP_POLL_TOTAL: Duration = Duration::from_secs(10);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Daemon management errors.
///
/// # Invariants
/// - Variants are stable for CLI error mapping.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The gateway never became healthy.
    #[error("gateway did not become healthy at {addr} within {BOOT_POLLS} polls")]
    BootTimeout {
        /// Address that was polled.
        addr: String,
    },
    /// Spawning the daemon failed.
    #[error("daemon spawn failed: {0}")]
    Spawn(String),
    /// PID file handling failed.
    #[error("pid file error: {0}")]
    PidFile(String),
}

// ============================================================================
// SECTION: Paths
// ============================================================================

/// Returns the SentinelGate home directory (`~/.sentinelgate`).
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".sentinelgate")
}

/// Returns the daemon log path.
#[must_use]
pub fn server_log_path() -> PathBuf {
    home_dir().join("server.log")
}

/// Returns the daemon PID file path.
#[must_use]
pub fn server_pid_path() -> PathBuf {
    home_dir().join("server.pid")
}

// ============================================================================
// SECTION: Reachability
// ============================================================================

/// Returns true when the gateway answers its health endpoint.
pub async fn is_healthy(server_addr: &str) -> bool {
    let url = format!("http://{server_addr}/health");
    let Ok(client) = reqwest::Client::builder().timeout(Duration::from_secs(2)).build() else {
        return false;
    };
    matches!(client.get(url).send().await, Ok(response) if response.status().is_success())
}

/// Ensures a gateway is reachable, forking a background daemon when needed.
///
/// Returns the daemon PID when this call started one (the caller owns its
/// teardown), `None` when a gateway was already running.
///
/// # Errors
///
/// Returns [`DaemonError`] when the daemon cannot start or never becomes
/// healthy.
pub async fn ensure_gateway(server_addr: &str) -> Result<Option<u32>, DaemonError> {
    if is_healthy(server_addr).await {
        return Ok(None);
    }
    let home = home_dir();
    std::fs::create_dir_all(&home).map_err(|err| DaemonError::Spawn(err.to_string()))?;
    let log = std::fs::File::create(server_log_path())
        .map_err(|err| DaemonError::Spawn(err.to_string()))?;
    let log_err = log.try_clone().map_err(|err| DaemonError::Spawn(err.to_string()))?;
    let exe =
        std::env::current_exe().map_err(|err| DaemonError::Spawn(err.to_string()))?;
    let child = std::process::Command::new(exe)
        .arg("start")
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .spawn()
        .map_err(|err| DaemonError::Spawn(err.to_string()))?;
    let pid = child.id();

    for _ in 0..BOOT_POLLS {
        if is_healthy(server_addr).await {
            return Ok(Some(pid));
        }
        tokio::time::sleep(BOOT_POLL_INTERVAL).await;
    }
    stop_pid(pid).await;
    Err(DaemonError::BootTimeout {
        addr: server_addr.to_string(),
    })
}

// ============================================================================
// SECTION: Stopping
// ============================================================================

/// Returns true when a process with the PID is alive.
#[must_use]
#[allow(unsafe_code, reason = "kill(2) with signal 0 is the liveness probe.")]
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // SAFETY: kill with signal 0 performs no action beyond an existence
        // and permission check on the target PID.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Sends a termination signal.
#[allow(unsafe_code, reason = "Signal delivery requires kill(2).")]
fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(pid) {
            // SAFETY: SIGTERM delivery to a PID we own or probed; no memory
            // is touched.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Sends an immediate kill.
#[allow(unsafe_code, reason = "Signal delivery requires kill(2).")]
fn kill(pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(pid) {
            // SAFETY: SIGKILL delivery to a PID we own or probed; no memory
            // is touched.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Stops a daemon this supervisor started: SIGTERM, then SIGKILL after the
/// grace period.
pub async fn stop_pid(pid: u32) {
    terminate(pid);
    let deadline = tokio::time::Instant::now() + DAEMON_KILL_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    kill(pid);
}

/// Implements the `stop` command over the PID file: SIGTERM, poll liveness
/// at 200 ms for up to 10 s, SIGKILL on timeout, remove the PID file.
///
/// # Errors
///
/// Returns [`DaemonError::PidFile`] when the PID file is missing or invalid.
pub async fn stop_by_pid_file() -> Result<(), DaemonError> {
    let path = server_pid_path();
    let contents =
        std::fs::read_to_string(&path).map_err(|err| DaemonError::PidFile(err.to_string()))?;
    let pid: u32 = contents
        .trim()
        .parse()
        .map_err(|_| DaemonError::PidFile(format!("invalid pid in {}", path.display())))?;
    terminate(pid);
    let deadline = tokio::time::Instant::now() + STOP_POLL_TOTAL;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            let _ = std::fs::remove_file(&path);
            return Ok(());
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    kill(pid);
    let _ = std::fs::remove_file(&path);
    Ok(())
}
