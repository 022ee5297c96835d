// crates/sentinel-gate-core/src/ratelimit.rs
// ============================================================================
// Module: Rate Limiter
// Description: GCRA rate limiting with per-IP and per-identity buckets.
// Purpose: Bound request rates per key with atomic allow decisions.
// Dependencies: governor, serde
// ============================================================================

//! ## Overview
//! Two keyed GCRA limiters back the pipeline: one for client IPs, one for
//! authenticated identities. Keys have the form `ratelimit:{type}:{value}`.
//! Decisions are atomic per key and never block. Idle buckets are evicted by
//! a periodic sweeper. Disabled limiters short-circuit to always-allow.
//!
//! Security posture: keys derive from untrusted peer addresses and identity
//! names; the limiter must not allocate unboundedly per hostile key (the
//! sweeper bounds idle retention); see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::Quota;
use governor::RateLimiter;
use governor::clock::Clock;
use governor::clock::DefaultClock;
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DashMapStateStore;
use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for one limiter class.
///
/// # Invariants
/// - `per_second` and `burst` are clamped to at least 1 when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether this limiter class is active.
    pub enabled: bool,
    /// Sustained rate in requests per second.
    pub per_second: u32,
    /// Burst capacity.
    pub burst: u32,
}

impl RateLimitConfig {
    /// Returns a disabled configuration.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            per_second: 0,
            burst: 0,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: 50,
            burst: 100,
        }
    }
}

/// Limiter key class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// Per-client-IP bucket.
    Ip,
    /// Per-identity bucket.
    Identity,
}

impl RateLimitKind {
    /// Returns the key-segment label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Identity => "user",
        }
    }
}

/// Outcome of one allow check.
///
/// # Invariants
/// - `retry_after` is set exactly when `allowed` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// True when the request may proceed.
    pub allowed: bool,
    /// Remaining burst capacity after this decision.
    pub remaining: u32,
    /// Time until a retry can succeed, when denied.
    pub retry_after: Option<Duration>,
    /// Time until the bucket fully resets.
    pub reset_after: Duration,
}

impl RateDecision {
    /// Returns the always-allow decision used when a limiter is disabled.
    #[must_use]
    pub const fn always_allow() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            retry_after: None,
            reset_after: Duration::ZERO,
        }
    }
}

// ============================================================================
// SECTION: Limiter
// ============================================================================

/// Keyed GCRA limiter type.
type KeyedLimiter =
    RateLimiter<String, DashMapStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// One limiter class with its configuration.
struct Limiter {
    /// Underlying keyed GCRA limiter.
    inner: KeyedLimiter,
    /// Configuration the limiter was built from.
    config: RateLimitConfig,
    /// Clock shared with the limiter for retry-after math.
    clock: DefaultClock,
}

impl Limiter {
    /// Builds a limiter from an enabled configuration.
    fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let inner = RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();
        Self {
            inner,
            config,
            clock: DefaultClock::default(),
        }
    }

    /// Runs one atomic allow check for a key.
    fn allow(&self, key: String) -> RateDecision {
        let burst = self.config.burst.max(1);
        let period = Duration::from_secs(1) / self.config.per_second.max(1);
        match self.inner.check_key(&key) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                RateDecision {
                    allowed: true,
                    remaining,
                    retry_after: None,
                    reset_after: period.saturating_mul(burst.saturating_sub(remaining)),
                }
            }
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(self.clock.now());
                RateDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after: Some(retry_after),
                    reset_after: period.saturating_mul(burst),
                }
            }
        }
    }
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Rate-limit service holding both limiter classes.
pub struct RateLimitService {
    /// Per-IP limiter, absent when disabled.
    ip: Option<Limiter>,
    /// Per-identity limiter, absent when disabled.
    identity: Option<Limiter>,
}

impl RateLimitService {
    /// Builds the service from both limiter configurations.
    #[must_use]
    pub fn new(ip: RateLimitConfig, identity: RateLimitConfig) -> Self {
        Self {
            ip: ip.enabled.then(|| Limiter::new(ip)),
            identity: identity.enabled.then(|| Limiter::new(identity)),
        }
    }

    /// Runs one allow check. Disabled classes always allow.
    #[must_use]
    pub fn allow(&self, kind: RateLimitKind, value: &str) -> RateDecision {
        let limiter = match kind {
            RateLimitKind::Ip => self.ip.as_ref(),
            RateLimitKind::Identity => self.identity.as_ref(),
        };
        limiter.map_or_else(RateDecision::always_allow, |limiter| {
            limiter.allow(format!("ratelimit:{}:{value}", kind.as_str()))
        })
    }

    /// Evicts idle buckets from both limiter classes.
    pub fn sweep(&self) {
        if let Some(limiter) = &self.ip {
            limiter.inner.retain_recent();
            limiter.inner.shrink_to_fit();
        }
        if let Some(limiter) = &self.identity {
            limiter.inner.retain_recent();
            limiter.inner.shrink_to_fit();
        }
    }

    /// Spawns the periodic sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                service.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    //! Rate limiter unit tests.

    use super::*;

    #[test]
    fn disabled_class_always_allows() {
        let service =
            RateLimitService::new(RateLimitConfig::disabled(), RateLimitConfig::disabled());
        for _ in 0..1000 {
            assert!(service.allow(RateLimitKind::Ip, "10.0.0.1").allowed);
        }
    }

    #[test]
    fn burst_is_bounded_per_key() {
        let config = RateLimitConfig {
            enabled: true,
            per_second: 1,
            burst: 5,
        };
        let service = RateLimitService::new(config, RateLimitConfig::disabled());
        let mut allowed = 0;
        for _ in 0..50 {
            if service.allow(RateLimitKind::Ip, "10.0.0.1").allowed {
                allowed += 1;
            }
        }
        // In a tight window the sum of allowed requests cannot exceed
        // burst + rate * elapsed; elapsed is well under a second here.
        assert!(allowed <= 6, "allowed {allowed} exceeded burst bound");
        let denied = service.allow(RateLimitKind::Ip, "10.0.0.1");
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
    }

    #[test]
    fn keys_are_independent() {
        let config = RateLimitConfig {
            enabled: true,
            per_second: 1,
            burst: 1,
        };
        let service = RateLimitService::new(config, config);
        assert!(service.allow(RateLimitKind::Ip, "10.0.0.1").allowed);
        assert!(service.allow(RateLimitKind::Ip, "10.0.0.2").allowed);
        assert!(service.allow(RateLimitKind::Identity, "alice").allowed);
    }
}
