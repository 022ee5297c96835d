// crates/sentinel-gate-core/tests/proptest_matchers.rs
// ============================================================================
// Module: Matcher Property-Based Tests
// Description: Property tests for domain matching and nesting analysis.
// Purpose: Detect panics and invariants across wide input ranges.
// ============================================================================

//! Property-based tests for matcher invariants.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::*;
use sentinel_gate_core::EvalLimits;
use sentinel_gate_core::policy::cel::compile_rule;
use sentinel_gate_core::policy::cel::domain_matches;

proptest! {
    /// Domain matching never panics and exact matches are reflexive modulo
    /// case and trailing dots.
    #[test]
    fn domain_matching_is_total_and_reflexive(domain in "[a-zA-Z0-9.-]{1,64}") {
        let _ = domain_matches(&domain, "*.example.com");
        let trimmed = domain.trim_end_matches('.');
        if !trimmed.is_empty() {
            prop_assert!(domain_matches(&domain, &domain.to_ascii_uppercase()));
        }
    }

    /// A wildcard pattern never matches its own bare suffix (the suffix is
    /// not a subdomain of itself).
    #[test]
    fn wildcard_requires_a_subdomain(suffix in "[a-z0-9]{1,16}\\.[a-z]{2,6}") {
        let pattern = format!("*.{suffix}");
        prop_assert!(!domain_matches(&suffix, &pattern));
        let candidate = format!("api.{}", suffix);
        prop_assert!(domain_matches(&candidate, &pattern));
    }

    /// Compilation respects the source length limit exactly.
    #[test]
    fn compile_rejects_only_over_limit_sources(pad in 0usize..8) {
        let limits = EvalLimits {
            max_source_len: 32,
            ..EvalLimits::default()
        };
        // "true" plus a comment pad; stays valid CEL at every length.
        let source = format!("true //{}", "x".repeat(pad + 20));
        let result = compile_rule(&source, "*", &limits);
        if source.chars().count() > limits.max_source_len {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
        }
    }
}
