// crates/sentinel-gate-core/src/outbound/tests.rs
// ============================================================================
// Module: Outbound Engine Unit Tests
// Description: Matching, ordering, URL extraction, and DNS pinning tests.
// Purpose: Validate the engine against the documented properties.
// Dependencies: sentinel-gate-core
// ============================================================================

//! Exercises the outbound engine with a scripted resolver.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Test-only assertions."
)]

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use super::DnsResolver;
use super::OutboundAction;
use super::OutboundEngine;
use super::OutboundError;
use super::OutboundMatch;
use super::OutboundRule;
use super::OutboundStore;
use super::destination_for;
use super::destination_from_url;
use crate::action::ActionType;
use crate::action::CanonicalAction;
use crate::action::GatewayKind;
use crate::action::Protocol;
use crate::chain::ActionContext;
use crate::ids::OutboundRuleId;

/// Resolver returning scripted answers and counting lookups.
struct ScriptedResolver {
    /// Answers returned in order, then the last repeats.
    answers: Mutex<Vec<Vec<IpAddr>>>,
    /// Lookup counter.
    lookups: Mutex<usize>,
}

impl ScriptedResolver {
    /// Creates a resolver with the given answer script.
    fn new(answers: Vec<Vec<IpAddr>>) -> Self {
        Self {
            answers: Mutex::new(answers),
            lookups: Mutex::new(0),
        }
    }

    /// Returns the number of lookups performed.
    fn lookup_count(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl DnsResolver for ScriptedResolver {
    async fn resolve(&self, _domain: &str, _port: u16) -> Result<Vec<IpAddr>, OutboundError> {
        *self.lookups.lock().unwrap() += 1;
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            Ok(answers.remove(0))
        } else {
            Ok(answers.first().cloned().unwrap_or_default())
        }
    }
}

/// Builds a CIDR deny rule.
fn cidr_deny(id: &str, cidr: &str, priority: i64) -> OutboundRule {
    OutboundRule {
        id: OutboundRuleId::new(id),
        name: id.to_string(),
        matcher: OutboundMatch::Cidr {
            networks: vec![cidr.parse().unwrap()],
        },
        action: OutboundAction::Deny,
        help_text: Some(format!("{cidr} is blocked")),
        priority,
    }
}

#[tokio::test]
async fn cidr_deny_holds_across_dns_rebinding() {
    // First resolution lands in the denied block; a later rebinding answer
    // must not change the in-flight action's verdict.
    let resolver = Arc::new(ScriptedResolver::new(vec![
        vec!["10.1.2.3".parse().unwrap()],
        vec!["8.8.8.8".parse().unwrap()],
    ]));
    let store = Arc::new(OutboundStore::new());
    store.upsert(cidr_deny("block-10", "10.0.0.0/8", 0));
    let engine = OutboundEngine::new(store, Arc::clone(&resolver) as Arc<dyn DnsResolver>);

    let cx = ActionContext::new(None, None);
    let dest = destination_from_url("http://internal.example/path").unwrap();
    let first = engine.evaluate(&cx, &dest).await.unwrap();
    assert!(first.is_some(), "first evaluation must block");

    // Second evaluation within the same action reuses the pinned answer.
    let second = engine.evaluate(&cx, &dest).await.unwrap();
    assert!(second.is_some(), "pinned answer must keep blocking");
    assert_eq!(resolver.lookup_count(), 1, "domain must resolve exactly once per action");
}

#[tokio::test]
async fn deny_beats_allow_at_equal_priority() {
    let resolver = Arc::new(ScriptedResolver::new(vec![vec!["1.2.3.4".parse().unwrap()]]));
    let store = Arc::new(OutboundStore::new());
    store.upsert(OutboundRule {
        id: OutboundRuleId::new("allow-all"),
        name: "allow-all".to_string(),
        matcher: OutboundMatch::Domain {
            pattern: "*.example.com".to_string(),
        },
        action: OutboundAction::Allow,
        help_text: None,
        priority: 5,
    });
    store.upsert(OutboundRule {
        id: OutboundRuleId::new("deny-api"),
        name: "deny-api".to_string(),
        matcher: OutboundMatch::Domain {
            pattern: "api.example.com".to_string(),
        },
        action: OutboundAction::Deny,
        help_text: None,
        priority: 5,
    });
    let engine = OutboundEngine::new(store, resolver);
    let cx = ActionContext::new(None, None);
    let dest = destination_from_url("https://api.example.com/v1").unwrap();
    let block = engine.evaluate(&cx, &dest).await.unwrap();
    assert_eq!(block.unwrap().rule_name, "deny-api");
}

#[tokio::test]
async fn no_matching_rule_means_not_blocked() {
    let resolver = Arc::new(ScriptedResolver::new(vec![vec!["1.2.3.4".parse().unwrap()]]));
    let store = Arc::new(OutboundStore::new());
    store.upsert(cidr_deny("block-10", "10.0.0.0/8", 0));
    let engine = OutboundEngine::new(store, resolver);
    let cx = ActionContext::new(None, None);
    let dest = destination_from_url("https://example.org/").unwrap();
    assert!(engine.evaluate(&cx, &dest).await.unwrap().is_none());
}

#[tokio::test]
async fn port_and_scheme_selectors_match() {
    let resolver = Arc::new(ScriptedResolver::new(vec![Vec::new()]));
    let store = Arc::new(OutboundStore::new());
    store.upsert(OutboundRule {
        id: OutboundRuleId::new("no-ssh"),
        name: "no-ssh".to_string(),
        matcher: OutboundMatch::Port {
            ports: BTreeSet::from([22]),
        },
        action: OutboundAction::Deny,
        help_text: None,
        priority: 0,
    });
    store.upsert(OutboundRule {
        id: OutboundRuleId::new("no-ftp"),
        name: "no-ftp".to_string(),
        matcher: OutboundMatch::Scheme {
            schemes: BTreeSet::from(["ftp".to_string()]),
        },
        action: OutboundAction::Deny,
        help_text: None,
        priority: 1,
    });
    let engine = OutboundEngine::new(store, resolver);
    let cx = ActionContext::new(None, None);

    let ssh = destination_from_url("http://host.example:22/").unwrap();
    assert_eq!(engine.evaluate(&cx, &ssh).await.unwrap().unwrap().rule_name, "no-ssh");

    let ftp = destination_from_url("ftp://host.example/file").unwrap();
    assert_eq!(engine.evaluate(&cx, &ftp).await.unwrap().unwrap().rule_name, "no-ftp");
}

#[test]
fn url_extraction_distinguishes_ip_literals_from_domains() {
    let domain = destination_from_url("https://metadata.local/latest").unwrap();
    assert_eq!(domain.domain.as_deref(), Some("metadata.local"));
    assert!(domain.ip.is_none());
    assert_eq!(domain.effective_port(), 443);

    let literal = destination_from_url("http://169.254.169.254/latest").unwrap();
    assert_eq!(literal.ip.as_deref(), Some("169.254.169.254"));
    assert!(literal.domain.is_none());
    assert_eq!(literal.effective_port(), 80);
}

#[test]
fn tool_calls_with_url_arguments_gain_destinations() {
    let mut action = CanonicalAction::new(
        ActionType::ToolCall,
        "fetch",
        Protocol::Mcp,
        GatewayKind::McpGateway,
    );
    action
        .arguments
        .insert("url".to_string(), json!("https://example.com/data"));
    let dest = destination_for(&action).unwrap();
    assert_eq!(dest.domain.as_deref(), Some("example.com"));

    let plain = CanonicalAction::new(
        ActionType::ToolCall,
        "read_file",
        Protocol::Mcp,
        GatewayKind::McpGateway,
    );
    assert!(destination_for(&plain).is_none());
}
