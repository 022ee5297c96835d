// crates/sentinel-gate-supervisor/src/framework.rs
// ============================================================================
// Module: Framework Detection
// Description: Heuristics over argv and environment for agent frameworks.
// Purpose: Pick the interception strategy before the child starts.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Two classifications happen before spawn: the agent *framework*
//! (`langchain`, `crewai`, `autogen`, `openai-agents-sdk`) from argv and
//! environment, and the *runtime* (Claude, Gemini, Python, Node) from the
//! command base name. Claude binaries are additionally confirmed by scanning
//! the executable for the Bun runtime signature, since Claude ships as a
//! Bun-compiled binary under arbitrary names.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Known agent frameworks.
///
/// # Invariants
/// - Labels are stable for the `SENTINELGATE_FRAMEWORK` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    /// LangChain.
    Langchain,
    /// CrewAI.
    Crewai,
    /// AutoGen.
    Autogen,
    /// OpenAI Agents SDK.
    OpenaiAgentsSdk,
}

impl Framework {
    /// Returns the stable label for the framework.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Langchain => "langchain",
            Self::Crewai => "crewai",
            Self::Autogen => "autogen",
            Self::OpenaiAgentsSdk => "openai-agents-sdk",
        }
    }
}

/// Child runtime classification.
///
/// # Invariants
/// - Drives hook selection: Claude uses PreToolUse hooks, Gemini MCP-level
///   interception, Python/Node the in-process hook scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    /// Claude Code (Bun-compiled binary).
    Claude,
    /// Gemini CLI.
    Gemini,
    /// CPython.
    Python,
    /// Node.js.
    Node,
    /// Anything else; both hook paths are prepared.
    Unknown,
}

// ============================================================================
// SECTION: Detection
// ============================================================================

/// Signature bytes present in Bun-compiled executables.
const BUN_SIGNATURE: &[u8] = b"Bun.lockb";
/// Bytes scanned from the head of a candidate Claude binary.
const BUN_SCAN_BYTES: usize = 4 * 1024 * 1024;

/// Detects the framework from argv and environment.
#[must_use]
pub fn detect_framework(args: &[String], env: &[(String, String)]) -> Option<Framework> {
    let haystack = args.join(" ").to_ascii_lowercase();
    if haystack.contains("crewai") {
        return Some(Framework::Crewai);
    }
    if haystack.contains("autogen") {
        return Some(Framework::Autogen);
    }
    if haystack.contains("langchain") {
        return Some(Framework::Langchain);
    }
    if haystack.contains("openai-agents") || haystack.contains("openai_agents") {
        return Some(Framework::OpenaiAgentsSdk);
    }
    env.iter().find_map(|(key, value)| {
        if key == "SENTINELGATE_FRAMEWORK" {
            match value.as_str() {
                "langchain" => Some(Framework::Langchain),
                "crewai" => Some(Framework::Crewai),
                "autogen" => Some(Framework::Autogen),
                "openai-agents-sdk" => Some(Framework::OpenaiAgentsSdk),
                _ => None,
            }
        } else {
            None
        }
    })
}

/// Detects the child runtime from the command path.
#[must_use]
pub fn detect_runtime(command: &str) -> Runtime {
    let base = Path::new(command)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(command)
        .to_ascii_lowercase();
    match base.as_str() {
        "claude" => Runtime::Claude,
        "gemini" => Runtime::Gemini,
        name if name.starts_with("python") => Runtime::Python,
        "node" | "nodejs" => Runtime::Node,
        _ => {
            if scan_for_bun_signature(command) {
                Runtime::Claude
            } else {
                Runtime::Unknown
            }
        }
    }
}

/// Scans the head of a binary for the Bun runtime signature.
fn scan_for_bun_signature(command: &str) -> bool {
    let Ok(file) = std::fs::File::open(command) else {
        return false;
    };
    let mut buffer = Vec::with_capacity(BUN_SCAN_BYTES.min(1024 * 1024));
    let mut handle = file.take(BUN_SCAN_BYTES as u64);
    if handle.read_to_end(&mut buffer).is_err() {
        return false;
    }
    buffer.windows(BUN_SIGNATURE.len()).any(|window| window == BUN_SIGNATURE)
}

#[cfg(test)]
mod tests {
    //! Framework detection unit tests.

    use super::*;

    #[test]
    fn framework_detection_prefers_argv() {
        let args = vec!["python".to_string(), "run_crewai_team.py".to_string()];
        assert_eq!(detect_framework(&args, &[]), Some(Framework::Crewai));
    }

    #[test]
    fn framework_detection_falls_back_to_env() {
        let env = vec![("SENTINELGATE_FRAMEWORK".to_string(), "langchain".to_string())];
        assert_eq!(
            detect_framework(&["python".to_string()], &env),
            Some(Framework::Langchain)
        );
        assert_eq!(detect_framework(&["python".to_string()], &[]), None);
    }

    #[test]
    fn runtime_detection_uses_the_base_name() {
        assert_eq!(detect_runtime("/usr/bin/python3"), Runtime::Python);
        assert_eq!(detect_runtime("node"), Runtime::Node);
        assert_eq!(detect_runtime("/opt/bin/claude"), Runtime::Claude);
        assert_eq!(detect_runtime("gemini"), Runtime::Gemini);
        assert_eq!(detect_runtime("/bin/definitely-not-real"), Runtime::Unknown);
    }
}
