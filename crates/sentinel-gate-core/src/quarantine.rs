// crates/sentinel-gate-core/src/quarantine.rs
// ============================================================================
// Module: Tool Quarantine Registry
// Description: Flags tools the security service has pulled from circulation.
// Purpose: Deny calls to quarantined tools before policy evaluation runs.
// Dependencies: none beyond std
// ============================================================================

//! ## Overview
//! The tool-security service flags suspicious tools (for example after a
//! description change on a connected upstream). The chain consults this
//! registry before policy evaluation and denies flagged tools outright.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::RwLock;

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Registry of quarantined tool names.
#[derive(Default)]
pub struct QuarantineRegistry {
    /// Quarantined tool names.
    tools: RwLock<BTreeSet<String>>,
}

impl QuarantineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantines a tool. Returns true when it was not already flagged.
    pub fn quarantine(&self, tool: impl Into<String>) -> bool {
        self.tools.write().map(|mut tools| tools.insert(tool.into())).unwrap_or(false)
    }

    /// Releases a tool from quarantine. Returns true when it was flagged.
    pub fn release(&self, tool: &str) -> bool {
        self.tools.write().map(|mut tools| tools.remove(tool)).unwrap_or(false)
    }

    /// Returns true when the tool is quarantined.
    #[must_use]
    pub fn is_quarantined(&self, tool: &str) -> bool {
        self.tools.read().map(|tools| tools.contains(tool)).unwrap_or(false)
    }

    /// Returns the quarantined tool names.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tools.read().map(|tools| tools.iter().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    //! Quarantine registry unit tests.

    use super::*;

    #[test]
    fn quarantine_round_trip() {
        let registry = QuarantineRegistry::new();
        assert!(!registry.is_quarantined("fetch"));
        assert!(registry.quarantine("fetch"));
        assert!(registry.is_quarantined("fetch"));
        assert!(registry.release("fetch"));
        assert!(!registry.is_quarantined("fetch"));
    }
}
