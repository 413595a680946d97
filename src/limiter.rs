//! Fixed-window rate limiter over one bucket dimension.

use std::{sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use tracing::warn;

use crate::{
    error::AppError,
    keys::{KeyStrategy, RequestContext, bucket_key},
    store::{CounterStore, now_ms},
};

/// Immutable per-route, per-dimension limiter settings.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub scope: &'static str,
    pub window: Duration,
    pub max: u64,
    pub strategy: KeyStrategy,
}

/// Outcome of one admission check. Built fresh per request, never stored.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub retry_after_secs: Option<u64>,
    pub dimension: &'static str,
}

pub struct RateLimiter {
    config: LimiterConfig,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn CounterStore {
        self.store.as_ref()
    }

    /// Derive the caller's bucket key for diagnostics. Fails the same way
    /// `check` does when the dimension's input is missing.
    pub fn key_for(&self, ctx: &RequestContext) -> Result<String, crate::keys::KeyError> {
        let value = self.config.strategy.derive(ctx)?;
        Ok(bucket_key(
            self.config.scope,
            self.config.strategy.dimension(),
            &value,
        ))
    }

    /// Admit or reject one request. Every call consumes one hit, admitted or
    /// not; there is no peek mode.
    pub async fn check(&self, ctx: &RequestContext) -> Result<AdmissionDecision, AppError> {
        let key = self.key_for(ctx)?;
        let count = self.store.increment(&key, self.config.window).await?;

        let admitted = count.count <= self.config.max;
        let remaining = self.config.max.saturating_sub(count.count);

        if admitted {
            return Ok(AdmissionDecision {
                admitted: true,
                limit: self.config.max,
                remaining,
                reset_at_ms: count.reset_at_ms,
                retry_after_secs: None,
                dimension: self.config.strategy.dimension(),
            });
        }

        let retry_after = retry_after_secs(count.reset_at_ms);
        warn!(
            scope = self.config.scope,
            dimension = self.config.strategy.dimension(),
            addr = %ctx.addr,
            path = %ctx.path,
            limit = self.config.max,
            remaining = 0u64,
            "rate limit exceeded"
        );

        Ok(AdmissionDecision {
            admitted: false,
            limit: self.config.max,
            remaining: 0,
            reset_at_ms: count.reset_at_ms,
            retry_after_secs: Some(retry_after),
            dimension: self.config.strategy.dimension(),
        })
    }
}

/// Seconds until the window resets, rounded up and clamped to at least 1 so
/// a client never sees "retry in 0 seconds" while still rejected.
fn retry_after_secs(reset_at_ms: u64) -> u64 {
    let remaining_ms = reset_at_ms.saturating_sub(now_ms());
    remaining_ms.div_ceil(1000).max(1)
}

/// Standard rate-limit headers, attached to every response from a guarded
/// route.
pub fn apply_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, reset_at_ms: u64) {
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&(reset_at_ms / 1000).to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }
}

/// `Retry-After` for rejections, in whole seconds.
pub fn apply_retry_after(headers: &mut HeaderMap, retry_after_secs: u64) {
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert(header::RETRY_AFTER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderMap as RequestHeaders;
    use std::net::SocketAddr;

    fn ctx() -> RequestContext {
        let peer: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        RequestContext::from_request(
            &RequestHeaders::new(),
            peer,
            "/api/signup",
            Some("user@example.com".to_string()),
            false,
        )
    }

    fn limiter(max: u64, strategy: KeyStrategy) -> RateLimiter {
        RateLimiter::new(
            LimiterConfig {
                scope: "signup",
                window: Duration::from_secs(60),
                max,
                strategy,
            },
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn admits_up_to_max_then_rejects_with_no_remaining() {
        let limiter = limiter(3, KeyStrategy::CallerAddress);
        let ctx = ctx();

        let mut admitted = 0;
        for _ in 0..5 {
            let decision = limiter.check(&ctx).await.unwrap();
            if decision.admitted {
                admitted += 1;
            } else {
                assert_eq!(decision.remaining, 0);
                assert!(decision.retry_after_secs.unwrap() >= 1);
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn remaining_counts_down_per_admission() {
        let limiter = limiter(3, KeyStrategy::CallerAddress);
        let ctx = ctx();

        let first = limiter.check(&ctx).await.unwrap();
        assert_eq!(first.remaining, 2);
        let second = limiter.check(&ctx).await.unwrap();
        assert_eq!(second.remaining, 1);
    }

    #[tokio::test]
    async fn rejection_consumes_the_hit() {
        let limiter = limiter(1, KeyStrategy::CallerAddress);
        let ctx = ctx();

        assert!(limiter.check(&ctx).await.unwrap().admitted);
        assert!(!limiter.check(&ctx).await.unwrap().admitted);
        assert!(!limiter.check(&ctx).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn a_lapsed_window_admits_again() {
        let limiter = RateLimiter::new(
            LimiterConfig {
                scope: "signup",
                window: Duration::from_millis(40),
                max: 1,
                strategy: KeyStrategy::CallerAddress,
            },
            Arc::new(MemoryStore::new()),
        );
        let ctx = ctx();

        assert!(limiter.check(&ctx).await.unwrap().admitted);
        assert!(!limiter.check(&ctx).await.unwrap().admitted);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check(&ctx).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn email_dimension_requires_an_email() {
        let limiter = limiter(3, KeyStrategy::Email);
        let mut ctx = ctx();
        ctx.email = None;

        assert!(limiter.check(&ctx).await.is_err());
    }

    #[test]
    fn retry_after_is_clamped_to_at_least_one_second() {
        assert_eq!(retry_after_secs(0), 1);
        let soon = now_ms() + 300;
        assert_eq!(retry_after_secs(soon), 1);
        let later = now_ms() + 4200;
        assert!(retry_after_secs(later) >= 4);
    }
}
