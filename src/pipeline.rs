//! Ordered admission guards for a route.
//!
//! The guard order is an explicit list, not a side effect of registration
//! order: the slowdown stage runs first, then each limiter in sequence. The
//! first rejection stops the walk, so a request turned away on one dimension
//! never consumes quota on the dimensions behind it.

use serde::Serialize;

use crate::{
    error::AppError,
    keys::{KeyError, RequestContext},
    limiter::{AdmissionDecision, RateLimiter},
    slowdown::SlowDown,
    store::now_ms,
};

/// Metadata of a fully admitted request: the binding (lowest remaining)
/// limiter's quota, surfaced as response headers.
#[derive(Debug, Clone)]
pub struct Admission {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub bypassed: bool,
}

impl Admission {
    fn bypassed() -> Self {
        Self {
            limit: 0,
            remaining: 0,
            reset_at_ms: 0,
            bypassed: true,
        }
    }

    /// The stricter of two admissions, for routes guarded by more than one
    /// pipeline.
    pub fn tighter(self, other: Admission) -> Admission {
        match (self.bypassed, other.bypassed) {
            (true, _) => other,
            (_, true) => self,
            _ if other.remaining < self.remaining => other,
            _ => self,
        }
    }
}

/// Caller-visible counter state for one guard, reported by the diagnostic
/// endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatus {
    pub scope: &'static str,
    pub dimension: &'static str,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

pub struct AdmissionPipeline {
    slowdown: Option<SlowDown>,
    limiters: Vec<RateLimiter>,
    exempt: Vec<&'static str>,
}

impl AdmissionPipeline {
    pub fn new(slowdown: Option<SlowDown>, limiters: Vec<RateLimiter>) -> Self {
        Self {
            slowdown,
            limiters,
            exempt: Vec::new(),
        }
    }

    /// Paths that skip the pipeline unconditionally (health, diagnostics).
    pub fn with_exempt(mut self, paths: &[&'static str]) -> Self {
        self.exempt = paths.to_vec();
        self
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|p| path.starts_with(p))
    }

    /// Walk the guards in order. Returns the binding quota on full admission;
    /// the first rejecting guard short-circuits into a rate-limit error.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Admission, AppError> {
        if self.is_exempt(&ctx.path) {
            return Ok(Admission::bypassed());
        }

        if let Some(slowdown) = &self.slowdown {
            slowdown.throttle(ctx).await?;
        }

        let mut binding: Option<AdmissionDecision> = None;
        for limiter in &self.limiters {
            let decision = limiter.check(ctx).await?;
            if !decision.admitted {
                return Err(AppError::RateLimited(decision));
            }
            let tighter = match &binding {
                Some(current) => decision.remaining < current.remaining,
                None => true,
            };
            if tighter {
                binding = Some(decision);
            }
        }

        Ok(match binding {
            Some(decision) => Admission {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_at_ms: decision.reset_at_ms,
                bypassed: false,
            },
            None => Admission::bypassed(),
        })
    }

    /// Current counters for the caller's own keys, without consuming any
    /// hits. Dimensions whose input is absent from the request are skipped.
    pub async fn snapshot(&self, ctx: &RequestContext) -> Result<Vec<LimiterStatus>, AppError> {
        let now = now_ms();
        let mut statuses = Vec::with_capacity(self.limiters.len());

        for limiter in &self.limiters {
            let key = match limiter.key_for(ctx) {
                Ok(key) => key,
                Err(KeyError::MissingKeyInput) => continue,
            };
            let config = limiter.config();
            let used = limiter
                .store()
                .peek(&key)
                .await?
                .map(|w| (w.count, w.reset_at_ms.saturating_sub(now) / 1000))
                .unwrap_or((0, 0));

            statuses.push(LimiterStatus {
                scope: config.scope,
                dimension: config.strategy.dimension(),
                used: used.0,
                limit: config.max,
                remaining: config.max.saturating_sub(used.0),
                reset_in_secs: used.1,
            });
        }

        Ok(statuses)
    }
}
