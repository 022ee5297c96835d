// crates/sentinel-gate-core/src/policy/mod.rs
// ============================================================================
// Module: Policy Evaluator
// Description: Policies, rules, priority evaluation, and decisions.
// Purpose: Produce a decision for every canonical action, default deny.
// Dependencies: chrono, globset (via cel), serde, thiserror, tokio
// ============================================================================

//! ## Overview
//! Policies hold ordered rules. Evaluation walks enabled policies by priority
//! (stable tie on policy id) and rules by priority (stable tie on list
//! order), matches the tool glob first, then runs the compiled CEL condition.
//! The first matching rule with a true condition wins. No match anywhere is a
//! deny with reason `no matching rule`.
//!
//! Security posture: the evaluator fails closed: compile failures reject the
//! rule at registration, runtime execution failures deny the action; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod cel;

#[cfg(test)]
mod tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::action::CanonicalAction;
use crate::auth::Session;
use crate::ids::PolicyId;
use crate::ids::RuleId;
use crate::policy::cel::Activation;
use crate::policy::cel::CompileError;
use crate::policy::cel::CompiledRule;
use crate::policy::cel::EvalError;
use crate::policy::cel::EvalLimits;
use crate::policy::cel::compile_rule;
use crate::policy::cel::evaluate_rule;

// ============================================================================
// SECTION: Rule Types
// ============================================================================

/// Outcome a rule prescribes when it matches.
///
/// # Invariants
/// - Variants are stable for serialization and contract matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Allow the action.
    Allow,
    /// Deny the action.
    Deny,
    /// Require human approval before the action proceeds.
    ApprovalRequired,
}

/// Terminal action when an approval request times out.
///
/// # Invariants
/// - Variants are stable for serialization and contract matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Allow the action after timeout.
    Allow,
    /// Deny the action after timeout.
    Deny,
}

impl Default for TimeoutAction {
    fn default() -> Self {
        Self::Deny
    }
}

/// Default tool-match glob matching every tool.
fn default_tool_match() -> String {
    "*".to_string()
}

/// One policy rule.
///
/// # Invariants
/// - Lower `priority` evaluates first.
/// - `condition` is compiled at registration; the compiled program is cached
///   by rule id and invalidated atomically with rule updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Rule identifier.
    pub id: RuleId,
    /// Rule display name.
    pub name: String,
    /// Evaluation priority; lower evaluates first.
    pub priority: i64,
    /// Tool-name glob; defaults to `*`.
    #[serde(default = "default_tool_match")]
    pub tool_match: String,
    /// CEL condition source.
    pub condition: String,
    /// Outcome when the rule matches.
    pub action: RuleAction,
    /// Approval timeout in seconds when `action` is `approval_required`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
    /// Terminal action on approval timeout.
    #[serde(default)]
    pub timeout_action: TimeoutAction,
    /// Operator help text surfaced with denials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

/// A policy grouping ordered rules.
///
/// # Invariants
/// - Rules are evaluated in priority order with a stable tie-break by list
///   position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub id: PolicyId,
    /// Policy display name.
    pub name: String,
    /// Whether the policy participates in evaluation.
    pub enabled: bool,
    /// Evaluation priority; lower evaluates first.
    pub priority: i64,
    /// Ordered rule list.
    pub rules: Vec<Rule>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// SECTION: Decision
// ============================================================================

/// Default approval timeout applied when a rule does not set one.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Decision produced by policy evaluation.
///
/// # Invariants
/// - `requires_approval` implies `allowed` is false until approval resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// True when the action may proceed without further gates.
    pub allowed: bool,
    /// Identifier of the deciding rule, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    /// Name of the deciding rule, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// True when the rule demands human approval.
    pub requires_approval: bool,
    /// Approval timeout in seconds.
    pub approval_timeout_secs: u64,
    /// Terminal action when the approval times out.
    pub timeout_action: TimeoutAction,
    /// Operator help text, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

impl Decision {
    /// Returns the default deny used when no rule matched.
    #[must_use]
    pub fn no_matching_rule() -> Self {
        Self {
            allowed: false,
            rule_id: None,
            rule_name: None,
            reason: "no matching rule".to_string(),
            requires_approval: false,
            approval_timeout_secs: 0,
            timeout_action: TimeoutAction::Deny,
            help_text: None,
        }
    }

    /// Builds the decision a matching rule prescribes.
    fn from_rule(rule: &Rule) -> Self {
        let approval_timeout_secs = rule
            .approval_timeout_secs
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT.as_secs());
        match rule.action {
            RuleAction::Allow => Self {
                allowed: true,
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                reason: format!("allowed by rule {}", rule.name),
                requires_approval: false,
                approval_timeout_secs: 0,
                timeout_action: TimeoutAction::Deny,
                help_text: rule.help_text.clone(),
            },
            RuleAction::Deny => Self {
                allowed: false,
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                reason: format!("denied by rule {}", rule.name),
                requires_approval: false,
                approval_timeout_secs: 0,
                timeout_action: TimeoutAction::Deny,
                help_text: rule.help_text.clone(),
            },
            RuleAction::ApprovalRequired => Self {
                allowed: false,
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                reason: format!("approval required by rule {}", rule.name),
                requires_approval: true,
                approval_timeout_secs,
                timeout_action: rule.timeout_action,
                help_text: rule.help_text.clone(),
            },
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Policy store and evaluation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule failed compile-time validation.
    #[error("rule {rule_id} rejected: {source}")]
    Compile {
        /// Identifier of the offending rule.
        rule_id: RuleId,
        /// Underlying compile failure.
        source: CompileError,
    },
    /// The referenced policy does not exist.
    #[error("unknown policy: {0}")]
    UnknownPolicy(PolicyId),
    /// Evaluation exceeded its cost budget or timeout.
    #[error("rule {rule_id} evaluation aborted: {source}")]
    Eval {
        /// Identifier of the offending rule.
        rule_id: RuleId,
        /// Underlying evaluation failure.
        source: EvalError,
    },
    /// Store lock was poisoned.
    #[error("policy store lock poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Policy Store
// ============================================================================

/// In-memory policy store with a compiled-rule cache.
///
/// # Invariants
/// - Every stored rule has a cache entry; cache updates happen under the same
///   write lock as rule updates.
/// - Readers receive snapshots; writers never block evaluation mid-rule.
pub struct PolicyStore {
    /// Stored policies.
    policies: RwLock<Vec<Policy>>,
    /// Compiled artifacts keyed by rule id.
    cache: RwLock<HashMap<RuleId, Arc<CompiledRule>>>,
    /// Limits applied at registration time.
    limits: EvalLimits,
}

impl PolicyStore {
    /// Creates an empty store with the given limits.
    #[must_use]
    pub fn new(limits: EvalLimits) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// Returns the registration limits.
    #[must_use]
    pub const fn limits(&self) -> &EvalLimits {
        &self.limits
    }

    /// Replaces the full policy set, compiling every rule first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Compile`] for the first rejected rule; the
    /// previous policy set stays in place on failure.
    pub fn replace_all(&self, policies: Vec<Policy>) -> Result<(), PolicyError> {
        let mut compiled = HashMap::new();
        for policy in &policies {
            for rule in &policy.rules {
                let entry = compile_rule(&rule.condition, &rule.tool_match, &self.limits)
                    .map_err(|source| PolicyError::Compile {
                        rule_id: rule.id.clone(),
                        source,
                    })?;
                compiled.insert(rule.id.clone(), Arc::new(entry));
            }
        }
        let mut slot = self.policies.write().map_err(|_| PolicyError::Poisoned)?;
        let mut cache = self.cache.write().map_err(|_| PolicyError::Poisoned)?;
        *slot = policies;
        *cache = compiled;
        Ok(())
    }

    /// Inserts or replaces one policy, compiling its rules first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Compile`] for the first rejected rule; the
    /// store is unchanged on failure.
    pub fn upsert_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        let mut compiled = Vec::new();
        for rule in &policy.rules {
            let entry = compile_rule(&rule.condition, &rule.tool_match, &self.limits).map_err(
                |source| PolicyError::Compile {
                    rule_id: rule.id.clone(),
                    source,
                },
            )?;
            compiled.push((rule.id.clone(), Arc::new(entry)));
        }
        let mut slot = self.policies.write().map_err(|_| PolicyError::Poisoned)?;
        let mut cache = self.cache.write().map_err(|_| PolicyError::Poisoned)?;
        if let Some(existing) = slot.iter_mut().find(|candidate| candidate.id == policy.id) {
            for rule in &existing.rules {
                cache.remove(&rule.id);
            }
            *existing = policy;
        } else {
            slot.push(policy);
        }
        for (rule_id, entry) in compiled {
            cache.insert(rule_id, entry);
        }
        Ok(())
    }

    /// Removes a policy and its cached rules. Returns true when found.
    pub fn remove_policy(&self, id: &PolicyId) -> bool {
        let Ok(mut slot) = self.policies.write() else {
            return false;
        };
        let Ok(mut cache) = self.cache.write() else {
            return false;
        };
        let before = slot.len();
        slot.retain(|policy| {
            if policy.id == *id {
                for rule in &policy.rules {
                    cache.remove(&rule.id);
                }
                false
            } else {
                true
            }
        });
        slot.len() != before
    }

    /// Returns every stored policy.
    #[must_use]
    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().map(|slot| slot.clone()).unwrap_or_default()
    }

    /// Returns enabled policies sorted by priority with a stable id tie-break.
    #[must_use]
    pub fn snapshot_enabled(&self) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self
            .policies
            .read()
            .map(|slot| slot.iter().filter(|policy| policy.enabled).cloned().collect())
            .unwrap_or_default();
        policies.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    /// Returns the compiled artifacts for a rule, compiling on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Compile`] when the on-demand compile fails.
    fn compiled(&self, rule: &Rule) -> Result<Arc<CompiledRule>, PolicyError> {
        if let Ok(cache) = self.cache.read()
            && let Some(entry) = cache.get(&rule.id)
        {
            return Ok(Arc::clone(entry));
        }
        let entry = compile_rule(&rule.condition, &rule.tool_match, &self.limits).map_err(
            |source| PolicyError::Compile {
                rule_id: rule.id.clone(),
                source,
            },
        )?;
        let entry = Arc::new(entry);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(rule.id.clone(), Arc::clone(&entry));
        }
        Ok(entry)
    }
}

// ============================================================================
// SECTION: Evaluator
// ============================================================================

/// Policy evaluator over a shared store.
pub struct PolicyEvaluator {
    /// Shared policy store.
    store: Arc<PolicyStore>,
}

impl PolicyEvaluator {
    /// Creates an evaluator over the given store.
    #[must_use]
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
        }
    }

    /// Evaluates an action against all enabled policies.
    ///
    /// Rule execution failures deny the action via the affected rule (fail
    /// closed) and are logged; cost-budget and timeout violations abort the
    /// whole evaluation as internal errors.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Eval`] when a rule exceeds its cost budget or
    /// wall-clock timeout.
    pub async fn evaluate(
        &self,
        action: &CanonicalAction,
        session: Option<&Session>,
        request_time: DateTime<Utc>,
    ) -> Result<Decision, PolicyError> {
        let activation = build_activation(action, session, request_time);
        let limits = *self.store.limits();
        for policy in self.store.snapshot_enabled() {
            let mut rules: Vec<(usize, &Rule)> = policy.rules.iter().enumerate().collect();
            rules.sort_by(|(ai, a), (bi, b)| a.priority.cmp(&b.priority).then(ai.cmp(bi)));
            for (_, rule) in rules {
                let compiled = self.store.compiled(rule)?;
                if !compiled.matches_tool(&action.name) {
                    continue;
                }
                match evaluate_rule(&compiled, &activation, &limits).await {
                    Ok(true) => return Ok(Decision::from_rule(rule)),
                    Ok(false) => {}
                    Err(err @ (EvalError::CostBudget { .. } | EvalError::Timeout)) => {
                        return Err(PolicyError::Eval {
                            rule_id: rule.id.clone(),
                            source: err,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            rule = %rule.id,
                            error = %err,
                            "rule evaluation failed; denying action"
                        );
                        let mut decision = Decision::from_rule(rule);
                        decision.allowed = false;
                        decision.requires_approval = false;
                        decision.reason = format!("rule {} failed to evaluate", rule.name);
                        return Ok(decision);
                    }
                }
            }
        }
        Ok(Decision::no_matching_rule())
    }
}

// ============================================================================
// SECTION: Activation Construction
// ============================================================================

/// Builds the CEL activation for an action and optional session.
///
/// `request_time` is the admission time of the action so repeated evaluation
/// against the same action stays deterministic.
#[must_use]
pub fn build_activation(
    action: &CanonicalAction,
    session: Option<&Session>,
    request_time: DateTime<Utc>,
) -> Activation {
    let dest = action.destination.clone().unwrap_or_default();
    Activation {
        tool_name: action.name.clone(),
        tool_args: Value::Object(action.arguments.clone()),
        user_roles: action.identity.roles.clone(),
        session_id: session.map(|s| s.id.to_string()).unwrap_or_default(),
        identity_id: action.identity.id.to_string(),
        identity_name: action.identity.name.clone(),
        request_time,
        action_type: action.action_type.as_str().to_string(),
        protocol: action.protocol.as_str().to_string(),
        framework: action.framework.clone().unwrap_or_default(),
        gateway: action.gateway.as_str().to_string(),
        dest_url: dest.url.clone().unwrap_or_default(),
        dest_domain: dest.domain.clone().unwrap_or_default(),
        dest_ip: dest.ip.clone().unwrap_or_default(),
        dest_port: dest.port.map(|port| port.to_string()).unwrap_or_default(),
        dest_scheme: dest.scheme.clone().unwrap_or_default(),
        dest_path: dest.path.clone().unwrap_or_default(),
        dest_command: dest.command.unwrap_or_default(),
    }
}
