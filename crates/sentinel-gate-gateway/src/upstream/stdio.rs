// crates/sentinel-gate-gateway/src/upstream/stdio.rs
// ============================================================================
// Module: Stdio Upstream Client
// Description: Subprocess transport speaking newline-delimited JSON.
// Purpose: Launch an MCP server process and exchange framed messages.
// Dependencies: tokio
// ============================================================================

//! ## Overview
//! The client launches `command + args` with piped stdin/stdout; the child's
//! stderr is forwarded to the proxy's stderr (the MCP spec permits server
//! logging there). `start` may be called once. `close` is idempotent and both
//! kills the process (when alive) and closes the pipes. A poller watches for
//! child exit so the supervisor learns about crashes without issuing a
//! request.
//!
//! Security posture: the child is untrusted; its output is size-capped per
//! message; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::watch;

use super::INITIAL_SCAN_BUFFER;
use super::MAX_SCAN_BUFFER;
use super::MessageStream;
use super::UpstreamError;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads one newline-terminated message with a hard size cap.
///
/// The buffer starts at [`INITIAL_SCAN_BUFFER`] and a message larger than
/// [`MAX_SCAN_BUFFER`] fails the scan with an explicit error.
///
/// # Errors
///
/// Returns [`UpstreamError`] on IO failure, EOF, or an oversized message.
pub async fn read_bounded_line(
    reader: &mut BufReader<ChildStdout>,
) -> Result<Vec<u8>, UpstreamError> {
    let mut buffer = Vec::with_capacity(INITIAL_SCAN_BUFFER);
    let mut byte = [0u8; 1];
    loop {
        let read = reader
            .read(&mut byte)
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        if read == 0 {
            return Err(UpstreamError::Transport("stdio stream closed".to_string()));
        }
        if byte[0] == b'\n' {
            return Ok(buffer);
        }
        if buffer.len() >= MAX_SCAN_BUFFER {
            return Err(UpstreamError::BufferExceeded {
                actual: buffer.len() + 1,
            });
        }
        buffer.push(byte[0]);
    }
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// Stdio transport client.
pub struct StdioClient {
    /// Command to launch.
    command: String,
    /// Command arguments.
    args: Vec<String>,
    /// True once `start` ran (it may run only once).
    started: AtomicBool,
    /// Child process handle.
    child: Mutex<Option<Child>>,
    /// Child stdin pipe.
    stdin: Mutex<Option<ChildStdin>>,
    /// Child stdout pipe.
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    /// Exit broadcaster (true once the child exited or the client closed).
    exited_tx: watch::Sender<bool>,
}

impl StdioClient {
    /// Creates a client for the given command line.
    #[must_use]
    pub fn new(command: String, args: Vec<String>) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            command,
            args,
            started: AtomicBool::new(false),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            exited_tx,
        }
    }

    /// Blocks until the subprocess exits.
    pub async fn wait(&self) {
        let mut rx = self.exited_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl MessageStream for StdioClient {
    async fn start(&self) -> Result<(), UpstreamError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(UpstreamError::AlreadyStarted);
        }
        if self.command.is_empty() {
            return Err(UpstreamError::Transport("empty stdio command".to_string()));
        }
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| UpstreamError::Transport(format!("spawn failed: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::Transport("missing child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Transport("missing child stdout".to_string()))?;
        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout));
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> Result<(), UpstreamError> {
        if message.len() > MAX_SCAN_BUFFER {
            return Err(UpstreamError::BufferExceeded {
                actual: message.len(),
            });
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(UpstreamError::NotConnected)?;
        stdin
            .write_all(message)
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        stdin.flush().await.map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, UpstreamError> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.as_mut().ok_or(UpstreamError::NotConnected)?;
        read_bounded_line(stdout).await
    }

    async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *self.stdin.lock().await = None;
        *self.stdout.lock().await = None;
        let _ = self.exited_tx.send(true);
    }

    async fn died(&self) {
        // Poll child liveness; resolves when the process is gone.
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => {
                        if let Ok(Some(_status)) = child.try_wait() {
                            let _ = self.exited_tx.send(true);
                            return;
                        }
                    }
                    None => return,
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}
