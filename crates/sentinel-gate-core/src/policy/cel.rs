// crates/sentinel-gate-core/src/policy/cel.rs
// ============================================================================
// Module: CEL Compilation and Evaluation
// Description: Bounded CEL program handling for policy rule conditions.
// Purpose: Compile rule conditions under safety limits and evaluate them
//          against a canonical-action activation.
// Dependencies: cel-interpreter, chrono, globset, ipnet, serde_json, tokio
// ============================================================================

//! ## Overview
//! Rule conditions are CEL expressions. Compilation enforces source-length and
//! nesting limits so a hostile rule body is rejected at registration time.
//! Evaluation enforces a cost budget (estimated from the expression size and
//! the largest list reachable from the activation) before execution, and a
//! wall-clock timeout around execution on a blocking thread.
//!
//! Security posture: rule sources are operator input but still bounded, and
//! activations carry attacker-controlled argument values; see
//! `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cel_interpreter::Context;
use cel_interpreter::Program;
use cel_interpreter::Value as CelValue;
use cel_interpreter::objects::Key;
use cel_interpreter::objects::Map as CelMap;
use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Utc;
use globset::Glob;
use globset::GlobMatcher;
use ipnet::IpNet;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Safety limits for rule compilation and evaluation.
///
/// # Invariants
/// - Compile-time limits are enforced at registration, never at evaluation.
/// - Both the cost budget and the wall-clock timeout are enforced at
///   evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalLimits {
    /// Maximum condition source length in characters.
    pub max_source_len: usize,
    /// Maximum parenthesis/bracket/brace nesting depth.
    pub max_nesting: usize,
    /// Evaluation cost budget in abstract units.
    pub cost_budget: u64,
    /// Wall-clock evaluation timeout.
    pub timeout: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_source_len: 1024,
            max_nesting: 50,
            cost_budget: 100_000,
            timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Compile-time rejection of a rule condition or tool-match glob.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Condition source exceeds the length limit.
    #[error("condition too long: {len} chars (max {max})")]
    TooLong {
        /// Actual source length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
    /// Condition source exceeds the nesting limit.
    #[error("condition nesting too deep: {depth} (max {max})")]
    TooDeep {
        /// Observed nesting depth.
        depth: usize,
        /// Maximum allowed depth.
        max: usize,
    },
    /// Condition failed to parse; the message carries position information.
    #[error("condition parse error: {0}")]
    Parse(String),
    /// Tool-match glob failed to compile.
    #[error("invalid tool_match glob: {0}")]
    InvalidGlob(String),
}

/// Evaluation-time failure of a compiled condition.
///
/// # Invariants
/// - `CostBudget` and `Timeout` abort the whole action as internal errors.
/// - `Execution` degrades to a deny for the affected rule.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Estimated evaluation cost exceeds the configured budget.
    #[error("evaluation cost {estimated} exceeds budget {budget}")]
    CostBudget {
        /// Estimated cost in abstract units.
        estimated: u64,
        /// Configured budget.
        budget: u64,
    },
    /// Evaluation exceeded the wall-clock timeout.
    #[error("evaluation timed out")]
    Timeout,
    /// The expression failed during execution.
    #[error("evaluation failed: {0}")]
    Execution(String),
    /// The evaluation task could not run.
    #[error("evaluation task error: {0}")]
    Task(String),
}

// ============================================================================
// SECTION: Compiled Rule
// ============================================================================

/// Compiled artifacts for one rule, cached by rule id.
///
/// # Invariants
/// - Never shared across rules; invalidated atomically with rule updates.
pub struct CompiledRule {
    /// Compiled CEL program for the rule condition.
    program: Program,
    /// Compiled tool-match glob.
    matcher: GlobMatcher,
    /// Source length, used for cost estimation.
    source_len: usize,
}

impl CompiledRule {
    /// Returns true when the rule's tool-match glob matches the action name.
    #[must_use]
    pub fn matches_tool(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }
}

/// Compiles a rule condition and tool-match glob under the given limits.
///
/// # Errors
///
/// Returns [`CompileError`] when the source exceeds limits or fails to parse.
pub fn compile_rule(
    condition: &str,
    tool_match: &str,
    limits: &EvalLimits,
) -> Result<CompiledRule, CompileError> {
    let len = condition.chars().count();
    if len > limits.max_source_len {
        return Err(CompileError::TooLong {
            len,
            max: limits.max_source_len,
        });
    }
    let depth = max_nesting_depth(condition);
    if depth > limits.max_nesting {
        return Err(CompileError::TooDeep {
            depth,
            max: limits.max_nesting,
        });
    }
    let program =
        Program::compile(condition).map_err(|err| CompileError::Parse(err.to_string()))?;
    let pattern = if tool_match.is_empty() { "*" } else { tool_match };
    let matcher = Glob::new(pattern)
        .map_err(|err| CompileError::InvalidGlob(err.to_string()))?
        .compile_matcher();
    Ok(CompiledRule {
        program,
        matcher,
        source_len: len,
    })
}

/// Computes the maximum bracket nesting depth of an expression source.
fn max_nesting_depth(source: &str) -> usize {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in source.chars() {
        match ch {
            '(' | '[' | '{' => {
                depth = depth.saturating_add(1);
                max_depth = max_depth.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max_depth
}

// ============================================================================
// SECTION: Activation
// ============================================================================

/// Flattened activation values for one evaluation.
///
/// # Invariants
/// - Unset fields are empty strings (or empty maps), never absent, so
///   expressions need no presence tests.
/// - `tool_name`/`tool_args`/`user_roles` are populated together with their
///   `action_name`/`arguments`/`identity_roles` aliases.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Tool or action name.
    pub tool_name: String,
    /// Action arguments as a JSON object.
    pub tool_args: Value,
    /// Identity roles.
    pub user_roles: Vec<String>,
    /// Session identifier, empty when anonymous.
    pub session_id: String,
    /// Identity identifier.
    pub identity_id: String,
    /// Identity display name.
    pub identity_name: String,
    /// Time the action was admitted.
    pub request_time: DateTime<Utc>,
    /// Action type label.
    pub action_type: String,
    /// Protocol label.
    pub protocol: String,
    /// Framework label, empty when undetected.
    pub framework: String,
    /// Ingress label.
    pub gateway: String,
    /// Destination URL, empty when absent.
    pub dest_url: String,
    /// Destination domain, empty when absent.
    pub dest_domain: String,
    /// Destination IP, empty when absent.
    pub dest_ip: String,
    /// Destination port rendered as a string, empty when absent.
    pub dest_port: String,
    /// Destination scheme, empty when absent.
    pub dest_scheme: String,
    /// Destination path, empty when absent.
    pub dest_path: String,
    /// Destination command, empty when absent.
    pub dest_command: String,
}

impl Activation {
    /// Returns the length of the largest list reachable from the activation.
    ///
    /// Used by the cost estimator: a comprehension over a large argument list
    /// multiplies work by that list's length.
    #[must_use]
    pub fn largest_list_len(&self) -> u64 {
        let mut largest = self.user_roles.len() as u64;
        largest_list_in(&self.tool_args, &mut largest);
        largest
    }
}

/// Recursively records the largest JSON array length into `largest`.
fn largest_list_in(value: &Value, largest: &mut u64) {
    match value {
        Value::Array(items) => {
            *largest = (*largest).max(items.len() as u64);
            for item in items {
                largest_list_in(item, largest);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                largest_list_in(item, largest);
            }
        }
        _ => {}
    }
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Estimates the evaluation cost for a compiled rule against an activation.
///
/// The estimate scales the expression size by the largest list bound so that
/// comprehensions over large argument lists exceed the budget before any work
/// happens.
#[must_use]
pub fn estimate_cost(rule: &CompiledRule, activation: &Activation) -> u64 {
    let nodes = (rule.source_len as u64 / 2).max(1);
    nodes.saturating_mul(1 + activation.largest_list_len())
}

/// Evaluates a compiled rule condition against an activation.
///
/// Runs on a blocking thread under the configured wall-clock timeout. The
/// cost budget is checked first; exceeding either limit fails the evaluation.
///
/// # Errors
///
/// Returns [`EvalError`] when the budget, timeout, or execution fails.
pub async fn evaluate_rule(
    rule: &Arc<CompiledRule>,
    activation: &Activation,
    limits: &EvalLimits,
) -> Result<bool, EvalError> {
    let estimated = estimate_cost(rule, activation);
    if estimated > limits.cost_budget {
        return Err(EvalError::CostBudget {
            estimated,
            budget: limits.cost_budget,
        });
    }
    let rule = Arc::clone(rule);
    let activation = activation.clone();
    let handle = tokio::task::spawn_blocking(move || execute(&rule.program, &activation));
    match tokio::time::timeout(limits.timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(EvalError::Task(join.to_string())),
        Err(_) => Err(EvalError::Timeout),
    }
}

/// Executes a compiled program with a fully built context.
fn execute(program: &Program, activation: &Activation) -> Result<bool, EvalError> {
    let mut ctx = Context::default();
    register_functions(&mut ctx);
    bind_activation(&mut ctx, activation);
    match program.execute(&ctx) {
        Ok(CelValue::Bool(value)) => Ok(value),
        Ok(other) => Err(EvalError::Execution(format!(
            "condition returned non-boolean value of type {}",
            other.type_of()
        ))),
        Err(err) => Err(EvalError::Execution(err.to_string())),
    }
}

/// Binds every activation field, including the backward-compatible aliases.
fn bind_activation(ctx: &mut Context, activation: &Activation) {
    let args = json_to_cel(&activation.tool_args);
    let roles = CelValue::List(Arc::new(
        activation
            .user_roles
            .iter()
            .map(|role| CelValue::String(Arc::new(role.clone())))
            .collect(),
    ));
    let request_time: DateTime<FixedOffset> = activation.request_time.fixed_offset();

    ctx.add_variable_from_value("tool_name", string_value(&activation.tool_name));
    ctx.add_variable_from_value("tool_args", args.clone());
    ctx.add_variable_from_value("user_roles", roles.clone());
    ctx.add_variable_from_value("session_id", string_value(&activation.session_id));
    ctx.add_variable_from_value("identity_id", string_value(&activation.identity_id));
    ctx.add_variable_from_value("identity_name", string_value(&activation.identity_name));
    ctx.add_variable_from_value("request_time", CelValue::Timestamp(request_time));
    ctx.add_variable_from_value("action_type", string_value(&activation.action_type));
    ctx.add_variable_from_value("action_name", string_value(&activation.tool_name));
    ctx.add_variable_from_value("protocol", string_value(&activation.protocol));
    ctx.add_variable_from_value("framework", string_value(&activation.framework));
    ctx.add_variable_from_value("gateway", string_value(&activation.gateway));
    ctx.add_variable_from_value("arguments", args);
    ctx.add_variable_from_value("identity_roles", roles);
    ctx.add_variable_from_value("dest_url", string_value(&activation.dest_url));
    ctx.add_variable_from_value("dest_domain", string_value(&activation.dest_domain));
    ctx.add_variable_from_value("dest_ip", string_value(&activation.dest_ip));
    ctx.add_variable_from_value("dest_port", string_value(&activation.dest_port));
    ctx.add_variable_from_value("dest_scheme", string_value(&activation.dest_scheme));
    ctx.add_variable_from_value("dest_path", string_value(&activation.dest_path));
    ctx.add_variable_from_value("dest_command", string_value(&activation.dest_command));
}

/// Registers the SentinelGate custom function set.
fn register_functions(ctx: &mut Context) {
    ctx.add_function("glob", |pattern: Arc<String>, name: Arc<String>| -> bool {
        Glob::new(pattern.as_str())
            .map(|glob| glob.compile_matcher().is_match(name.as_str()))
            .unwrap_or(false)
    });
    ctx.add_function("dest_ip_in_cidr", |ip: Arc<String>, cidr: Arc<String>| -> bool {
        ip_in_cidr(ip.as_str(), cidr.as_str())
    });
    ctx.add_function(
        "dest_domain_matches",
        |domain: Arc<String>, pattern: Arc<String>| -> bool {
            domain_matches(domain.as_str(), pattern.as_str())
        },
    );
    ctx.add_function(
        "action_arg",
        |args: CelValue, key: Arc<String>| -> Result<CelValue, cel_interpreter::ExecutionError> {
            Ok(action_arg(&args, key.as_str()))
        },
    );
    ctx.add_function("action_arg_contains", |args: CelValue, needle: Arc<String>| -> bool {
        value_contains(&args, needle.as_str())
    });
}

/// Returns true when an IP literal falls inside a CIDR block.
fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    let Ok(net) = cidr.parse::<IpNet>() else {
        return false;
    };
    net.contains(&ip)
}

/// Returns true when a domain matches an exact or `*.suffix` pattern.
#[must_use]
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if suffix.is_empty() || domain.len() <= suffix.len() || !domain.ends_with(suffix) {
            return false;
        }
        let boundary = domain.len() - suffix.len() - 1;
        return domain.as_bytes().get(boundary) == Some(&b'.');
    }
    domain == pattern
}

/// Extracts a keyed value out of a CEL map, `null` when absent.
fn action_arg(args: &CelValue, key: &str) -> CelValue {
    let CelValue::Map(map) = args else {
        return CelValue::Null;
    };
    map.map.get(&Key::String(Arc::new(key.to_string()))).cloned().unwrap_or(CelValue::Null)
}

/// Returns true when any string inside the value contains the needle.
fn value_contains(value: &CelValue, needle: &str) -> bool {
    match value {
        CelValue::String(text) => text.contains(needle),
        CelValue::List(items) => items.iter().any(|item| value_contains(item, needle)),
        CelValue::Map(map) => map.map.values().any(|item| value_contains(item, needle)),
        _ => false,
    }
}

// ============================================================================
// SECTION: JSON Conversion
// ============================================================================

/// Wraps a string slice into a CEL string value.
fn string_value(text: &str) -> CelValue {
    CelValue::String(Arc::new(text.to_string()))
}

/// Converts a JSON value into the equivalent CEL value.
#[must_use]
pub fn json_to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(flag) => CelValue::Bool(*flag),
        Value::Number(num) => num.as_i64().map_or_else(
            || {
                num.as_u64().map_or_else(
                    || CelValue::Float(num.as_f64().unwrap_or(0.0)),
                    CelValue::UInt,
                )
            },
            CelValue::Int,
        ),
        Value::String(text) => CelValue::String(Arc::new(text.clone())),
        Value::Array(items) => CelValue::List(Arc::new(items.iter().map(json_to_cel).collect())),
        Value::Object(map) => {
            let entries: HashMap<Key, CelValue> = map
                .iter()
                .map(|(key, item)| (Key::String(Arc::new(key.clone())), json_to_cel(item)))
                .collect();
            CelValue::Map(CelMap {
                map: Arc::new(entries),
            })
        }
    }
}
