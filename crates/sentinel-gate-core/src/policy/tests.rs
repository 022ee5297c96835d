// crates/sentinel-gate-core/src/policy/tests.rs
// ============================================================================
// Module: Policy Unit Tests
// Description: Priority ordering, default deny, CEL limits, determinism.
// Purpose: Validate the evaluator against the documented properties.
// Dependencies: sentinel-gate-core
// ============================================================================

//! Exercises policy evaluation with in-memory stores.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::Policy;
use super::PolicyError;
use super::PolicyEvaluator;
use super::PolicyStore;
use super::Rule;
use super::RuleAction;
use super::TimeoutAction;
use super::cel::EvalLimits;
use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::action::GatewayKind;
use crate::action::Protocol;
use crate::ids::PolicyId;
use crate::ids::RuleId;

/// Builds a rule with defaults suitable for tests.
fn rule(id: &str, priority: i64, condition: &str, action: RuleAction) -> Rule {
    Rule {
        id: RuleId::new(id),
        name: id.to_string(),
        priority,
        tool_match: "*".to_string(),
        condition: condition.to_string(),
        action,
        approval_timeout_secs: None,
        timeout_action: TimeoutAction::Deny,
        help_text: None,
    }
}

/// Builds an enabled policy holding the given rules.
fn policy(id: &str, priority: i64, rules: Vec<Rule>) -> Policy {
    Policy {
        id: PolicyId::new(id),
        name: id.to_string(),
        enabled: true,
        priority,
        rules,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Builds a tool-call action with roles.
fn action_with_roles(name: &str, roles: &[&str]) -> CanonicalAction {
    let mut action =
        CanonicalAction::new(ActionType::ToolCall, name, Protocol::Mcp, GatewayKind::McpGateway);
    action.identity.roles = roles.iter().map(ToString::to_string).collect();
    action
}

#[tokio::test]
async fn zero_policies_default_to_deny() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    let evaluator = PolicyEvaluator::new(Arc::clone(&store));
    let action = action_with_roles("anything", &[]);
    let decision = evaluator.evaluate(&action, None, Utc::now()).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "no matching rule");
}

#[tokio::test]
async fn lower_priority_rule_wins_regardless_of_creation_order() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    // The later-created rule has the lower priority number and must win.
    store
        .replace_all(vec![policy(
            "p1",
            0,
            vec![
                rule("deny-late", 20, "true", RuleAction::Deny),
                rule("allow-early", 10, "true", RuleAction::Allow),
            ],
        )])
        .unwrap();
    let evaluator = PolicyEvaluator::new(store);
    let action = action_with_roles("read_file", &["user"]);
    let decision = evaluator.evaluate(&action, None, Utc::now()).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.rule_name.as_deref(), Some("allow-early"));
}

#[tokio::test]
async fn tool_match_glob_gates_rule_evaluation() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    let mut write_rule = rule("no-writes", 0, "true", RuleAction::Deny);
    write_rule.tool_match = "write_*".to_string();
    write_rule.help_text = Some("writes disabled in this env".to_string());
    store.replace_all(vec![policy("p1", 0, vec![write_rule])]).unwrap();
    let evaluator = PolicyEvaluator::new(store);

    let denied = evaluator
        .evaluate(&action_with_roles("write_file", &["user"]), None, Utc::now())
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.help_text.as_deref(), Some("writes disabled in this env"));

    let unmatched = evaluator
        .evaluate(&action_with_roles("read_file", &["user"]), None, Utc::now())
        .await
        .unwrap();
    assert!(!unmatched.allowed);
    assert_eq!(unmatched.reason, "no matching rule");
}

#[tokio::test]
async fn role_condition_allows_admins() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    store
        .replace_all(vec![policy(
            "p1",
            0,
            vec![rule(
                "admins",
                0,
                "user_roles.exists(r, r == \"admin\")",
                RuleAction::Allow,
            )],
        )])
        .unwrap();
    let evaluator = PolicyEvaluator::new(store);
    let allowed = evaluator
        .evaluate(&action_with_roles("deploy", &["admin", "dev"]), None, Utc::now())
        .await
        .unwrap();
    assert!(allowed.allowed);
    let denied = evaluator
        .evaluate(&action_with_roles("deploy", &["dev"]), None, Utc::now())
        .await
        .unwrap();
    assert!(!denied.allowed);
}

#[tokio::test]
async fn repeated_evaluation_is_deterministic() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    store
        .replace_all(vec![policy(
            "p1",
            0,
            vec![rule(
                "arg-check",
                0,
                "action_arg_contains(tool_args, \"secret\")",
                RuleAction::Deny,
            )],
        )])
        .unwrap();
    let evaluator = PolicyEvaluator::new(store);
    let mut action = action_with_roles("read_file", &["user"]);
    action
        .arguments
        .insert("path".to_string(), json!("/etc/secret.conf"));
    let fixed_time = Utc::now();
    let first = evaluator.evaluate(&action, None, fixed_time).await.unwrap();
    for _ in 0..5 {
        let again = evaluator.evaluate(&action, None, fixed_time).await.unwrap();
        assert_eq!(again.allowed, first.allowed);
        assert_eq!(again.rule_id, first.rule_id);
    }
}

#[test]
fn oversized_source_is_rejected_at_registration() {
    let store = PolicyStore::new(EvalLimits::default());
    let long = format!("\"{}\" == \"x\"", "a".repeat(1025));
    let result = store.replace_all(vec![policy(
        "p1",
        0,
        vec![rule("too-long", 0, &long, RuleAction::Allow)],
    )]);
    assert!(matches!(result, Err(PolicyError::Compile { .. })));
    // The previous (empty) set must remain in effect.
    assert!(store.list().is_empty());
}

#[test]
fn deep_nesting_is_rejected_at_registration() {
    let store = PolicyStore::new(EvalLimits::default());
    let nested = format!("{}true{}", "(".repeat(51), ")".repeat(51));
    let result = store.replace_all(vec![policy(
        "p1",
        0,
        vec![rule("too-deep", 0, &nested, RuleAction::Allow)],
    )]);
    assert!(matches!(result, Err(PolicyError::Compile { .. })));
}

#[tokio::test]
async fn comprehension_over_large_list_exceeds_cost_budget() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    store
        .replace_all(vec![policy(
            "p1",
            0,
            vec![rule(
                "expensive",
                0,
                "tool_args.items.map(x, x * 2).size() > 0",
                RuleAction::Allow,
            )],
        )])
        .unwrap();
    let evaluator = PolicyEvaluator::new(store);
    let mut action = action_with_roles("crunch", &[]);
    let big: Vec<i64> = (0..50_000).collect();
    action.arguments.insert("items".to_string(), json!(big));
    let result = evaluator.evaluate(&action, None, Utc::now()).await;
    assert!(matches!(result, Err(PolicyError::Eval { .. })));
}

#[tokio::test]
async fn execution_failure_degrades_to_deny_for_the_rule() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    // Comparing a string to an int fails at execution time.
    store
        .replace_all(vec![policy(
            "p1",
            0,
            vec![rule("broken", 0, "tool_name + 1 == 2", RuleAction::Allow)],
        )])
        .unwrap();
    let evaluator = PolicyEvaluator::new(store);
    let decision = evaluator
        .evaluate(&action_with_roles("read_file", &[]), None, Utc::now())
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.rule_name.as_deref(), Some("broken"));
}

#[tokio::test]
async fn rule_update_invalidates_the_compiled_cache() {
    let store = Arc::new(PolicyStore::new(EvalLimits::default()));
    store
        .replace_all(vec![policy("p1", 0, vec![rule("r1", 0, "false", RuleAction::Allow)])])
        .unwrap();
    let evaluator = PolicyEvaluator::new(Arc::clone(&store));
    let action = action_with_roles("read_file", &[]);
    let before = evaluator.evaluate(&action, None, Utc::now()).await.unwrap();
    assert!(!before.allowed);
    store
        .upsert_policy(policy("p1", 0, vec![rule("r1", 0, "true", RuleAction::Allow)]))
        .unwrap();
    let after = evaluator.evaluate(&action, None, Utc::now()).await.unwrap();
    assert!(after.allowed);
}
