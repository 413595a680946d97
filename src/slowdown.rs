//! Progressive slowdown stage.
//!
//! Counts hits in its own key scope and suspends the request for an
//! exponentially growing, capped delay once a free-hit threshold is passed.
//! Postpones, never rejects.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::AppError,
    keys::{KeyStrategy, RequestContext, bucket_key},
    store::CounterStore,
};

pub struct SlowDown {
    scope: &'static str,
    window: Duration,
    threshold: u64,
    base: Duration,
    cap: Duration,
    store: Arc<dyn CounterStore>,
}

impl SlowDown {
    pub fn new(
        scope: &'static str,
        window: Duration,
        threshold: u64,
        base: Duration,
        cap: Duration,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            scope,
            window,
            threshold,
            base,
            cap,
            store,
        }
    }

    /// Delay for the nth hit in the current window. Zero up to and including
    /// the threshold, then doubling per hit up to the cap.
    pub fn delay_for(&self, hits: u64) -> Duration {
        if hits <= self.threshold {
            return Duration::ZERO;
        }
        let doublings = (hits - self.threshold - 1).min(31) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.cap)
    }

    /// Record one hit for the caller and suspend for the computed delay.
    pub async fn throttle(&self, ctx: &RequestContext) -> Result<Duration, AppError> {
        let value = KeyStrategy::CallerAddress.derive(ctx)?;
        let key = bucket_key(self.scope, KeyStrategy::CallerAddress.dimension(), &value);

        let count = self.store.increment(&key, self.window).await?;
        let delay = self.delay_for(count.count);

        if !delay.is_zero() {
            debug!(
                scope = self.scope,
                addr = %ctx.addr,
                hits = count.count,
                delay_ms = delay.as_millis() as u64,
                "slowing down request"
            );
            tokio::time::sleep(delay).await;
        }

        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderMap;
    use std::net::SocketAddr;

    fn slowdown(threshold: u64) -> SlowDown {
        SlowDown::new(
            "slow",
            Duration::from_secs(60),
            threshold,
            Duration::from_millis(1000),
            Duration::from_millis(30000),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn free_hits_up_to_the_threshold() {
        let s = slowdown(2);
        assert_eq!(s.delay_for(1), Duration::ZERO);
        assert_eq!(s.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn delay_doubles_then_caps() {
        let s = slowdown(2);
        assert_eq!(s.delay_for(3), Duration::from_millis(1000));
        assert_eq!(s.delay_for(4), Duration::from_millis(2000));
        assert_eq!(s.delay_for(5), Duration::from_millis(4000));
        assert_eq!(s.delay_for(10), Duration::from_millis(30000));
    }

    #[test]
    fn delay_is_monotonically_non_decreasing() {
        let s = slowdown(2);
        let mut previous = Duration::ZERO;
        for hits in 1..=200 {
            let delay = s.delay_for(hits);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(30000));
            previous = delay;
        }
    }

    #[tokio::test]
    async fn throttle_counts_in_its_own_scope() {
        let store = Arc::new(MemoryStore::new());
        let s = SlowDown::new(
            "slow",
            Duration::from_secs(60),
            100,
            Duration::from_millis(1),
            Duration::from_millis(2),
            store.clone(),
        );

        let peer: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let ctx = RequestContext::from_request(&HeaderMap::new(), peer, "/api/signup", None, false);

        s.throttle(&ctx).await.unwrap();
        s.throttle(&ctx).await.unwrap();

        let counted = store.peek("slow:ip:203.0.113.9").await.unwrap().unwrap();
        assert_eq!(counted.count, 2);
        assert!(store.peek("signup:ip:203.0.113.9").await.unwrap().is_none());
    }
}
