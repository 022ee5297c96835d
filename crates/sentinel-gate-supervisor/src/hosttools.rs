// crates/sentinel-gate-supervisor/src/hosttools.rs
// ============================================================================
// Module: Host-Tool Hook Management
// Description: Reference-counted Claude/Gemini settings rewrites.
// Purpose: Let concurrent supervisors share one instrumented settings file
//          and restore the original byte-for-byte when the last one exits.
// Dependencies: serde_json, std
// ============================================================================

//! ## Overview
//! Claude and Gemini are intercepted through their settings files rather than
//! in-process hooks. Multiple supervisors may run concurrently, so the
//! rewrite is reference counted: a `.sentinelgate-hook-refcount` file next to
//! `settings.json` holds the count and `.sentinelgate-settings-backup` holds
//! the pre-modification contents (empty marker when no file existed). Every
//! critical section runs under an advisory lock file acquired by atomic
//! create, which closes the race the bare refcount scheme would have.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Refcount file name.
const REFCOUNT_FILE: &str = ".sentinelgate-hook-refcount";
/// Backup file name.
const BACKUP_FILE: &str = ".sentinelgate-settings-backup";
/// Lock file name.
const LOCK_FILE: &str = ".sentinelgate-hook-refcount.lock";
/// Marker stored in the backup when no settings file existed.
const NO_PRIOR_MARKER: &str = "";
/// Maximum wait for the advisory lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Age after which a lock file is considered stale and stolen.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Gemini native tools excluded while SentinelGate intercepts.
///
/// Names colliding with common MCP servers (`read_file`, `write_file`,
/// `list_directory`) stay enabled so those servers keep working.
const GEMINI_EXCLUDED_TOOLS: &[&str] =
    &["edit", "replace", "run_shell_command", "grep_search", "glob"];

// ============================================================================
// SECTION: Types
// ============================================================================

/// Host tools with settings-file interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTool {
    /// Claude Code (`~/.claude/settings.json`, PreToolUse hooks).
    Claude,
    /// Gemini CLI (`~/.gemini/settings.json`, MCP-server interception).
    Gemini,
}

impl HostTool {
    /// Returns the settings path under the given home directory.
    #[must_use]
    pub fn settings_path(self, home: &Path) -> PathBuf {
        match self {
            Self::Claude => home.join(".claude").join("settings.json"),
            Self::Gemini => home.join(".gemini").join("settings.json"),
        }
    }
}

/// Host-tool hook errors.
#[derive(Debug, Error)]
pub enum HostToolError {
    /// Settings IO failed.
    #[error("host tool settings io error: {0}")]
    Io(String),
    /// The advisory lock could not be acquired.
    #[error("host tool lock timed out at {0}")]
    LockTimeout(String),
    /// Existing settings were not valid JSON.
    #[error("host tool settings parse error: {0}")]
    Parse(String),
}

// ============================================================================
// SECTION: Advisory Lock
// ============================================================================

/// Lock guard removing its file on drop.
struct LockGuard {
    /// Lock file path.
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Acquires the advisory lock by atomic create, stealing stale locks.
fn acquire_lock(dir: &Path) -> Result<LockGuard, HostToolError> {
    let path = dir.join(LOCK_FILE);
    let started = Instant::now();
    loop {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                return Ok(LockGuard {
                    path,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Ok(metadata) = std::fs::metadata(&path)
                    && let Ok(modified) = metadata.modified()
                    && modified.elapsed().map(|age| age > LOCK_STALE_AFTER).unwrap_or(false)
                {
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                if started.elapsed() > LOCK_TIMEOUT {
                    return Err(HostToolError::LockTimeout(path.display().to_string()));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(HostToolError::Io(err.to_string())),
        }
    }
}

// ============================================================================
// SECTION: Instrumentation
// ============================================================================

/// Builds the instrumented Claude settings: a PreToolUse hook invoking
/// `sentinel-gate claude-hook`, merged over any existing settings.
fn claude_instrumented(existing: Option<Value>) -> Value {
    let mut settings = existing.unwrap_or_else(|| json!({}));
    let hook = json!({
        "matcher": "*",
        "hooks": [{
            "type": "command",
            "command": "sentinel-gate claude-hook",
        }],
    });
    if let Some(map) = settings.as_object_mut() {
        let hooks = map.entry("hooks").or_insert_with(|| json!({}));
        if let Some(hooks) = hooks.as_object_mut() {
            hooks.insert("PreToolUse".to_string(), json!([hook]));
        }
    }
    settings
}

/// Builds the instrumented Gemini settings: SentinelGate as an MCP server
/// plus native-tool exclusions, merged over any existing settings.
fn gemini_instrumented(existing: Option<Value>) -> Value {
    let mut settings = existing.unwrap_or_else(|| json!({}));
    if let Some(map) = settings.as_object_mut() {
        let servers = map.entry("mcpServers").or_insert_with(|| json!({}));
        if let Some(servers) = servers.as_object_mut() {
            servers.insert(
                "sentinelgate".to_string(),
                json!({
                    "command": "sentinel-gate",
                    "args": ["start", "--stdio"],
                }),
            );
        }
        let mut excluded: Vec<Value> = map
            .get("excludeTools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tool in GEMINI_EXCLUDED_TOOLS {
            let value = Value::String((*tool).to_string());
            if !excluded.contains(&value) {
                excluded.push(value);
            }
        }
        map.insert("excludeTools".to_string(), Value::Array(excluded));
    }
    settings
}

// ============================================================================
// SECTION: Setup / Cleanup
// ============================================================================

/// Reads the current refcount (0 when absent or unparsable).
fn read_refcount(dir: &Path) -> i64 {
    std::fs::read_to_string(dir.join(REFCOUNT_FILE))
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

/// Writes the refcount.
fn write_refcount(dir: &Path, count: i64) -> Result<(), HostToolError> {
    std::fs::write(dir.join(REFCOUNT_FILE), count.to_string())
        .map_err(|err| HostToolError::Io(err.to_string()))
}

/// Installs the host-tool hook under the refcount scheme.
///
/// # Errors
///
/// Returns [`HostToolError`] on lock, IO, or parse failures.
pub fn setup(tool: HostTool, home: &Path) -> Result<(), HostToolError> {
    let settings_path = tool.settings_path(home);
    let dir = settings_path.parent().map(Path::to_path_buf).unwrap_or_else(|| home.to_path_buf());
    std::fs::create_dir_all(&dir).map_err(|err| HostToolError::Io(err.to_string()))?;
    let _lock = acquire_lock(&dir)?;

    let count = read_refcount(&dir);
    if count <= 0 {
        let prior = match std::fs::read_to_string(&settings_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                NO_PRIOR_MARKER.to_string()
            }
            Err(err) => return Err(HostToolError::Io(err.to_string())),
        };
        std::fs::write(dir.join(BACKUP_FILE), &prior)
            .map_err(|err| HostToolError::Io(err.to_string()))?;
        let existing = if prior.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&prior)
                    .map_err(|err| HostToolError::Parse(err.to_string()))?,
            )
        };
        let instrumented = match tool {
            HostTool::Claude => claude_instrumented(existing),
            HostTool::Gemini => gemini_instrumented(existing),
        };
        let serialized = serde_json::to_string_pretty(&instrumented)
            .map_err(|err| HostToolError::Io(err.to_string()))?;
        std::fs::write(&settings_path, serialized)
            .map_err(|err| HostToolError::Io(err.to_string()))?;
    }
    write_refcount(&dir, count.max(0) + 1)
}

/// Removes one reference, restoring the original settings at zero.
///
/// # Errors
///
/// Returns [`HostToolError`] on lock or IO failures.
pub fn cleanup(tool: HostTool, home: &Path) -> Result<(), HostToolError> {
    let settings_path = tool.settings_path(home);
    let dir = settings_path.parent().map(Path::to_path_buf).unwrap_or_else(|| home.to_path_buf());
    let _lock = acquire_lock(&dir)?;

    let count = read_refcount(&dir) - 1;
    if count > 0 {
        return write_refcount(&dir, count);
    }
    let backup_path = dir.join(BACKUP_FILE);
    match std::fs::read_to_string(&backup_path) {
        Ok(prior) if prior.is_empty() => {
            // No file existed before the first setup; remove ours.
            let _ = std::fs::remove_file(&settings_path);
        }
        Ok(prior) => {
            std::fs::write(&settings_path, prior)
                .map_err(|err| HostToolError::Io(err.to_string()))?;
        }
        Err(_) => {
            // Backup missing: leave whatever exists in place.
        }
    }
    let _ = std::fs::remove_file(&backup_path);
    let _ = std::fs::remove_file(dir.join(REFCOUNT_FILE));
    Ok(())
}

#[cfg(test)]
mod tests {
    //! Refcount scheme unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    #[test]
    fn refcounted_setup_and_cleanup_restore_the_original_bytes() {
        let home = tempfile::tempdir().unwrap();
        let settings = HostTool::Claude.settings_path(home.path());
        std::fs::create_dir_all(settings.parent().unwrap()).unwrap();
        let original = "{\n  \"theme\": \"dark\"\n}";
        std::fs::write(&settings, original).unwrap();

        setup(HostTool::Claude, home.path()).unwrap();
        let instrumented = std::fs::read_to_string(&settings).unwrap();
        assert!(instrumented.contains("PreToolUse"));
        assert!(instrumented.contains("claude-hook"));
        assert!(instrumented.contains("dark"), "existing settings survive");

        // Second supervisor: no rewrite, just a reference.
        setup(HostTool::Claude, home.path()).unwrap();
        assert_eq!(read_refcount(settings.parent().unwrap()), 2);

        // Second exits first: still instrumented.
        cleanup(HostTool::Claude, home.path()).unwrap();
        assert!(std::fs::read_to_string(&settings).unwrap().contains("PreToolUse"));

        // Last exit restores the original byte-for-byte.
        cleanup(HostTool::Claude, home.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&settings).unwrap(), original);
        assert!(!settings.parent().unwrap().join(BACKUP_FILE).exists());
        assert!(!settings.parent().unwrap().join(REFCOUNT_FILE).exists());
    }

    #[test]
    fn cleanup_removes_settings_created_by_setup() {
        let home = tempfile::tempdir().unwrap();
        let settings = HostTool::Claude.settings_path(home.path());
        setup(HostTool::Claude, home.path()).unwrap();
        assert!(settings.exists());
        cleanup(HostTool::Claude, home.path()).unwrap();
        assert!(!settings.exists(), "no prior file means removal on cleanup");
    }

    #[test]
    fn gemini_exclusions_spare_mcp_collision_names() {
        let instrumented = gemini_instrumented(None);
        let excluded: Vec<String> = instrumented["excludeTools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap().to_string())
            .collect();
        assert!(excluded.contains(&"run_shell_command".to_string()));
        assert!(excluded.contains(&"glob".to_string()));
        for spared in ["read_file", "write_file", "list_directory"] {
            assert!(!excluded.contains(&spared.to_string()));
        }
        assert!(instrumented["mcpServers"]["sentinelgate"].is_object());
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let home = tempfile::tempdir().unwrap();
        let dir = home.path().join(".claude");
        std::fs::create_dir_all(&dir).unwrap();
        let guard = acquire_lock(&dir).unwrap();
        assert!(dir.join(LOCK_FILE).exists());
        drop(guard);
        assert!(!dir.join(LOCK_FILE).exists());
        // The lock is re-acquirable immediately after release.
        let again = acquire_lock(&dir).unwrap();
        drop(again);
    }
}
