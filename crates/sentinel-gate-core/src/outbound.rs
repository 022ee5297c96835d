// crates/sentinel-gate-core/src/outbound.rs
// ============================================================================
// Module: Outbound Rule Engine
// Description: CIDR/domain/port/scheme matching with pinned DNS resolution.
// Purpose: Block agent egress to disallowed destinations, immune to DNS
//          rebinding within one action.
// Dependencies: async-trait, globset, ipnet, serde, tokio, url
// ============================================================================

//! ## Overview
//! The engine is consulted for every action that carries a destination or a
//! URL-bearing argument. Domains are resolved at most once per action; the
//! answer is pinned in the action context and reused by every CIDR check and
//! by the eventual outbound request. Rules are ordered by priority and deny
//! beats allow at equal priority. When nothing matches, the engine reports
//! "not blocked"; it never allows on its own authority.
//!
//! Security posture: hostnames and URLs are attacker-controlled; resolution
//! happens once so a rebinding resolver cannot change the answer between the
//! policy check and execution; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::action::Destination;
use crate::chain::ActionContext;
use crate::ids::OutboundRuleId;
use crate::policy::cel::domain_matches;

// ============================================================================
// SECTION: Rule Types
// ============================================================================

/// Rule verdict.
///
/// # Invariants
/// - Variants are stable for serialization and contract matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundAction {
    /// Allow the destination.
    Allow,
    /// Block the destination.
    Deny,
}

/// Selector a rule matches destinations with.
///
/// # Invariants
/// - Exactly one selector per rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMatch {
    /// Domain pattern (exact or `*.suffix`).
    Domain {
        /// Pattern to match the destination domain against.
        pattern: String,
    },
    /// CIDR block list matched against resolved or literal IPs.
    Cidr {
        /// CIDR blocks.
        networks: Vec<IpNet>,
    },
    /// Destination port set.
    Port {
        /// Ports to match.
        ports: BTreeSet<u16>,
    },
    /// Destination scheme set.
    Scheme {
        /// Schemes to match (lowercase).
        schemes: BTreeSet<String>,
    },
}

/// One outbound rule.
///
/// # Invariants
/// - Lower `priority` evaluates first; deny wins over allow at equal
///   priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRule {
    /// Rule identifier.
    pub id: OutboundRuleId,
    /// Rule display name.
    pub name: String,
    /// Match selector.
    #[serde(rename = "match")]
    pub matcher: OutboundMatch,
    /// Verdict when the selector matches.
    pub action: OutboundAction,
    /// Operator help text surfaced with blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    /// Evaluation priority; lower evaluates first.
    pub priority: i64,
}

/// Structured block surfaced to the caller.
///
/// # Invariants
/// - `domain_or_ip` names what was actually matched for operator clarity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundBlock {
    /// Identifier of the blocking rule.
    pub rule_id: OutboundRuleId,
    /// Name of the blocking rule.
    pub rule_name: String,
    /// Destination domain or IP that matched.
    pub domain_or_ip: String,
    /// Destination port.
    pub port: u16,
    /// Operator help text, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

/// Outbound engine errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// DNS resolution failed for a destination domain.
    #[error("destination resolution failed: {0}")]
    Resolution(String),
}

// ============================================================================
// SECTION: DNS Resolver
// ============================================================================

/// Resolver seam so tests can script DNS answers.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolves a domain to its A/AAAA addresses.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Resolution`] when lookup fails.
    async fn resolve(&self, domain: &str, port: u16) -> Result<Vec<IpAddr>, OutboundError>;
}

/// System resolver backed by `tokio::net::lookup_host`.
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn resolve(&self, domain: &str, port: u16) -> Result<Vec<IpAddr>, OutboundError> {
        let addrs = tokio::net::lookup_host((domain, port))
            .await
            .map_err(|err| OutboundError::Resolution(err.to_string()))?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory outbound rule store.
pub struct OutboundStore {
    /// Stored rules.
    rules: RwLock<Vec<OutboundRule>>,
}

impl Default for OutboundStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Replaces the full rule set.
    pub fn replace_all(&self, rules: Vec<OutboundRule>) {
        if let Ok(mut slot) = self.rules.write() {
            *slot = rules;
        }
    }

    /// Inserts or replaces one rule.
    pub fn upsert(&self, rule: OutboundRule) {
        if let Ok(mut slot) = self.rules.write() {
            if let Some(existing) = slot.iter_mut().find(|candidate| candidate.id == rule.id) {
                *existing = rule;
            } else {
                slot.push(rule);
            }
        }
    }

    /// Removes a rule by id. Returns true when found.
    pub fn remove(&self, id: &OutboundRuleId) -> bool {
        self.rules
            .write()
            .map(|mut slot| {
                let before = slot.len();
                slot.retain(|rule| rule.id != *id);
                slot.len() != before
            })
            .unwrap_or(false)
    }

    /// Returns true when the store holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().map(|slot| slot.is_empty()).unwrap_or(true)
    }

    /// Returns rules ordered for evaluation: priority ascending, deny before
    /// allow at equal priority, stable beyond that.
    #[must_use]
    pub fn ordered(&self) -> Vec<OutboundRule> {
        let mut rules = self.rules.read().map(|slot| slot.clone()).unwrap_or_default();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| deny_rank(a.action).cmp(&deny_rank(b.action)))
        });
        rules
    }
}

/// Orders deny rules ahead of allow rules at equal priority.
const fn deny_rank(action: OutboundAction) -> u8 {
    match action {
        OutboundAction::Deny => 0,
        OutboundAction::Allow => 1,
    }
}

// ============================================================================
// SECTION: URL Extraction
// ============================================================================

/// Derives a destination for an action, when one exists.
///
/// `http_request` actions usually carry an explicit destination; hook-sourced
/// ones may carry the URL as an argument instead. Tool calls that carry a
/// `url` argument (fetch-like tools) have one extracted the same way: an IP
/// literal host populates `ip`, anything else populates `domain`.
#[must_use]
pub fn destination_for(action: &CanonicalAction) -> Option<Destination> {
    if let Some(dest) = &action.destination {
        return Some(dest.clone());
    }
    if !matches!(action.action_type, ActionType::ToolCall | ActionType::HttpRequest) {
        return None;
    }
    let url = action.argument("url")?.as_str()?;
    destination_from_url(url)
}

/// Parses a URL string into a destination.
#[must_use]
pub fn destination_from_url(raw: &str) -> Option<Destination> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_string();
    let mut dest = Destination {
        url: Some(raw.to_string()),
        scheme: Some(url.scheme().to_string()),
        path: Some(url.path().to_string()),
        port: url.port(),
        ..Destination::default()
    };
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if trimmed.parse::<IpAddr>().is_ok() {
        dest.ip = Some(trimmed.to_string());
    } else {
        dest.domain = Some(host.to_ascii_lowercase());
    }
    Some(dest)
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Outbound rule engine with pinned DNS resolution.
pub struct OutboundEngine {
    /// Shared rule store.
    store: Arc<OutboundStore>,
    /// Resolver used for CIDR checks against domains.
    resolver: Arc<dyn DnsResolver>,
}

impl OutboundEngine {
    /// Creates an engine over the given store and resolver.
    #[must_use]
    pub fn new(store: Arc<OutboundStore>, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            store,
            resolver,
        }
    }

    /// Evaluates a destination, returning a block when a deny rule matched.
    ///
    /// `None` means "not blocked by any rule"; the engine never allows on
    /// its own authority. DNS answers are pinned in the context: the first
    /// resolution for a domain is reused for every later check within this
    /// action.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Resolution`] when a CIDR rule needs the
    /// destination address and resolution fails.
    pub async fn evaluate(
        &self,
        cx: &ActionContext,
        dest: &Destination,
    ) -> Result<Option<OutboundBlock>, OutboundError> {
        let port = dest.effective_port();
        let mut resolved: Option<Vec<IpAddr>> = dest
            .ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| vec![ip]);
        for rule in self.store.ordered() {
            let matched = match &rule.matcher {
                OutboundMatch::Domain {
                    pattern,
                } => dest
                    .domain
                    .as_deref()
                    .is_some_and(|domain| domain_matches(domain, pattern)),
                OutboundMatch::Cidr {
                    networks,
                } => {
                    let ips = self.pinned_ips(cx, dest, port, &mut resolved).await?;
                    ips.iter().any(|ip| networks.iter().any(|net| net.contains(ip)))
                }
                OutboundMatch::Port {
                    ports,
                } => ports.contains(&port),
                OutboundMatch::Scheme {
                    schemes,
                } => dest
                    .scheme
                    .as_deref()
                    .is_some_and(|scheme| schemes.contains(&scheme.to_ascii_lowercase())),
            };
            if !matched {
                continue;
            }
            return Ok(match rule.action {
                OutboundAction::Allow => None,
                OutboundAction::Deny => Some(OutboundBlock {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    domain_or_ip: block_label(dest, resolved.as_deref()),
                    port,
                    help_text: rule.help_text.clone(),
                }),
            });
        }
        Ok(None)
    }

    /// Returns the pinned address set for the destination, resolving at most
    /// once per action.
    async fn pinned_ips(
        &self,
        cx: &ActionContext,
        dest: &Destination,
        port: u16,
        resolved: &mut Option<Vec<IpAddr>>,
    ) -> Result<Vec<IpAddr>, OutboundError> {
        if let Some(ips) = resolved {
            return Ok(ips.clone());
        }
        let Some(domain) = dest.domain.as_deref() else {
            return Ok(Vec::new());
        };
        if let Some(pinned) = cx.pinned_ips(domain) {
            *resolved = Some(pinned.clone());
            return Ok(pinned);
        }
        let ips = self.resolver.resolve(domain, port).await?;
        cx.pin_ips(domain, ips.clone());
        // Read the pin back: a concurrent first-writer wins.
        let pinned = cx.pinned_ips(domain).unwrap_or(ips);
        *resolved = Some(pinned.clone());
        Ok(pinned)
    }
}

/// Chooses the label reported on a block: domain with its pinned IP when
/// known, otherwise whichever of the two exists.
fn block_label(dest: &Destination, resolved: Option<&[IpAddr]>) -> String {
    match (dest.domain.as_deref(), resolved.and_then(<[IpAddr]>::first)) {
        (Some(domain), Some(ip)) if dest.ip.is_none() => format!("{domain} ({ip})"),
        (Some(domain), _) => domain.to_string(),
        (None, Some(ip)) => ip.to_string(),
        (None, None) => dest.ip.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
#[path = "outbound/tests.rs"]
mod tests;
