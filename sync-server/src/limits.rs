//! Rate limiting for the sync endpoints.
//!
//! Two layers:
//! - A sliding window per principal (or source address when anonymous),
//!   stored as a sorted set of request timestamps in the ephemeral store so
//!   every instance sharing that store sees the same window.
//! - An optional process-local global cap built on governor, which protects a
//!   single instance from aggregate overload.
//!
//! The window is approximate: trimming, recording and counting are separate
//! store calls. If the store errors or is slower than
//! `limits.backend_timeout_ms`, the request is allowed.

use crate::clock::Clock;
use crate::config::{ConfigHandle, LimitsConfig};
use crate::ephemeral::EphemeralStore;
use crate::error::EphemeralResult;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSubject {
    /// Authenticated principal, if any.
    pub principal: Option<String>,
    /// Role of the principal, if known.
    pub role: Option<String>,
    /// Source address of the connection.
    pub address: IpAddr,
}

impl RateLimitSubject {
    /// An unauthenticated caller.
    pub fn anonymous(address: IpAddr) -> Self {
        Self {
            principal: None,
            role: None,
            address,
        }
    }

    /// The window key: the principal when authenticated, else the address.
    ///
    /// Principals and addresses live in separate namespaces.
    pub fn window_key(&self) -> String {
        match &self.principal {
            Some(principal) => format!("ratelimit:principal:{principal}"),
            None => format!("ratelimit:addr:{}", self.address),
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured requests per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Seconds to wait before retrying, set on rejection.
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    fn allow(limit: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: None,
        }
    }

    fn reject(limit: u32, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after: Some(retry_after),
        }
    }
}

/// Sliding-window limiter over an [`EphemeralStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
    /// Global rate limiter across all clients, `None` when disabled.
    global_limiter: Option<Arc<DirectLimiter>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field(
                "global_limiter",
                &self.global_limiter.as_ref().map(|_| "DirectLimiter"),
            )
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter. The global cap is sized from the config at this point
    /// and does not follow later reloads.
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>, config: ConfigHandle) -> Self {
        let global_limiter = NonZeroU32::new(config.load().limits.global_requests_per_second)
            .map(|rps| Arc::new(governor::RateLimiter::direct(Quota::per_second(rps))));
        Self {
            store,
            clock,
            config,
            global_limiter,
        }
    }

    /// Decide whether `subject` may make another request now.
    ///
    /// Never fails: a broken or slow backend yields an allow.
    pub async fn check(&self, subject: &RateLimitSubject) -> RateLimitDecision {
        let config = self.config.load();
        let limits = &config.limits;
        let threshold = limits.threshold;

        if !limits.enabled || is_exempt(subject, limits) {
            return RateLimitDecision::allow(threshold, threshold);
        }

        if let Some(global) = &self.global_limiter {
            if global.check().is_err() {
                tracing::debug!("Global rate limit exceeded");
                return RateLimitDecision::reject(threshold, 1);
            }
        }

        let key = subject.window_key();
        let budget = Duration::from_millis(limits.backend_timeout_ms);
        let count = match tokio::time::timeout(budget, self.record(&key, limits.window_secs)).await
        {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                tracing::warn!("Rate limit backend error for {}, allowing: {}", key, e);
                return RateLimitDecision::allow(threshold, threshold);
            }
            Err(_) => {
                tracing::warn!(
                    "Rate limit backend exceeded {}ms for {}, allowing",
                    limits.backend_timeout_ms,
                    key
                );
                return RateLimitDecision::allow(threshold, threshold);
            }
        };

        if count > u64::from(threshold) {
            tracing::debug!("Rate limited {} ({} in window)", key, count);
            RateLimitDecision::reject(threshold, limits.window_secs)
        } else {
            // count <= threshold here, so the difference fits
            RateLimitDecision::allow(threshold, threshold - count as u32)
        }
    }

    /// Trim, record and count one request in the window at `key`.
    async fn record(&self, key: &str, window_secs: u64) -> EphemeralResult<u64> {
        let now = self.clock.now_millis();
        let window_ms = i64::try_from(window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(window_ms);

        self.store.sorted_remove_below(key, cutoff).await?;
        let member = format!("{now}-{}", uuid::Uuid::new_v4().simple());
        self.store.sorted_add(key, now, &member).await?;
        self.store
            .expire(key, Duration::from_secs(window_secs))
            .await?;
        self.store.sorted_len(key).await
    }
}

fn is_exempt(subject: &RateLimitSubject, limits: &LimitsConfig) -> bool {
    if let Some(principal) = &subject.principal {
        if limits.exempt_principals.iter().any(|p| p == principal) {
            return true;
        }
    }
    if let Some(role) = &subject.role {
        if limits.exempt_roles.iter().any(|r| r == role) {
            return true;
        }
    }
    // Validated on load, so a parse failure here only drops the exemption.
    limits
        .trusted_networks()
        .map(|nets| nets.iter().any(|net| net.contains(&subject.address)))
        .unwrap_or(false)
}
