//! # Counter store
//!
//! Keyed, windowed counters behind one contract.
//!
//! Core purpose is atomic increment-and-read for the admission guards. Every
//! guard shares the same store handle; the store owns the window state and
//! nothing else reads or writes it.
//!
//! ## Requirements
//!
//! - Atomic increments, concurrent callers never lose a hit
//! - Fixed window: reset to 1 when the window has lapsed, otherwise keep the
//!   existing deadline
//! - Small keyspace, entries expire with their window
//!
//! ## Implementation
//!
//! - Redis `INCR` + `PTTL` in one `MULTI`/`EXEC` pipeline, TTL installed on
//!   first hit
//! - In-process fallback: a mutex-guarded map with the same window semantics,
//!   per-instance only
//!
//! We do run into an issue of under-counting with the in-process map when
//! several instances sit behind the load balancer, since each instance only
//! sees its own slice of traffic. This is a tradeoff we are okay with as a
//! degraded mode: admission keeps working through a Redis outage instead of
//! turning away every caller.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{
    Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Counter state for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, creating or resetting the window as
    /// needed. Every call consumes one hit.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Read the current counter without consuming a hit. Diagnostic use only;
    /// the admission guards never call this.
    async fn peek(&self, key: &str) -> Result<Option<WindowCount>, StoreError>;

    /// Name of the active backend, surfaced by the health endpoint.
    fn backend(&self) -> &'static str;
}

#[derive(Debug)]
struct Window {
    count: u64,
    reset_at_ms: u64,
}

/// Process-local counters. Lost on restart and not shared across instances.
#[derive(Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose window has lapsed. Called periodically so the map
    /// does not grow with one entry per key ever seen.
    pub fn sweep(&self) {
        let now = now_ms();
        self.windows.lock().retain(|_, w| w.reset_at_ms > now);
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = now_ms();
        let window_ms = window.as_millis() as u64;
        let mut windows = self.windows.lock();

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at_ms: now + window_ms,
        });

        if now >= entry.reset_at_ms {
            entry.count = 1;
            entry.reset_at_ms = now + window_ms;
        } else {
            entry.count += 1;
        }

        Ok(WindowCount {
            count: entry.count,
            reset_at_ms: entry.reset_at_ms,
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowCount>, StoreError> {
        let now = now_ms();
        Ok(self
            .windows
            .lock()
            .get(key)
            .filter(|w| w.reset_at_ms > now)
            .map(|w| WindowCount {
                count: w.count,
                reset_at_ms: w.reset_at_ms,
            }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed counters, shared across instances and surviving restarts.
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect with bounded retries and a short timeout so startup never
    /// hangs on an unreachable store.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager_with_config(config).await?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let window_ms = window.as_millis() as u64;
        let mut connection = self.connection.clone();

        let (count, ttl_ms): (u64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        // A fresh key has no TTL yet; install one so the window expires on
        // its own. PTTL also reports -1 if a previous expiry was lost.
        let reset_at_ms = if ttl_ms < 0 {
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(window_ms)
                .query_async(&mut connection)
                .await?;
            now_ms() + window_ms
        } else {
            now_ms() + ttl_ms as u64
        };

        Ok(WindowCount { count, reset_at_ms })
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowCount>, StoreError> {
        let mut connection = self.connection.clone();

        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(count.map(|count| WindowCount {
            count,
            reset_at_ms: now_ms() + ttl_ms.max(0) as u64,
        }))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Store handle shared by every guard: Redis when configured and reachable,
/// in-process counters otherwise. A Redis failure mid-flight degrades that
/// call to the in-process map instead of failing the request.
pub struct FallbackStore {
    redis: Option<RedisStore>,
    memory: MemoryStore,
}

impl FallbackStore {
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => {
                    info!("Connected to Redis counter store");
                    Some(store)
                }
                Err(e) => {
                    warn!("Redis unreachable, falling back to in-process counters: {e}");
                    None
                }
            },
            None => {
                info!("REDIS_URL not set, using in-process counters");
                None
            }
        };

        Self {
            redis,
            memory: MemoryStore::new(),
        }
    }

    pub fn memory_only() -> Self {
        Self {
            redis: None,
            memory: MemoryStore::new(),
        }
    }

    pub fn sweep_expired(&self) {
        self.memory.sweep();
    }
}

#[async_trait]
impl CounterStore for FallbackStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        if let Some(redis) = &self.redis {
            match redis.increment(key, window).await {
                Ok(count) => return Ok(count),
                Err(e) => warn!("Redis increment failed, using in-process counter: {e}"),
            }
        }
        self.memory.increment(key, window).await
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowCount>, StoreError> {
        if let Some(redis) = &self.redis {
            match redis.peek(key).await {
                Ok(count) => return Ok(count),
                Err(e) => warn!("Redis read failed, using in-process counter: {e}"),
            }
        }
        self.memory.peek(key).await
    }

    fn backend(&self) -> &'static str {
        if self.redis.is_some() { "redis" } else { "memory" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_within_one_window() {
        let store = MemoryStore::new();
        for expected in 1..=5 {
            let count = store
                .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(count.count, expected);
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryStore::new();
        store
            .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();
        let other = store
            .increment("signup:email:a@b.c", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(other.count, 1);
    }

    #[tokio::test]
    async fn window_reset_starts_a_fresh_count() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(40);

        for _ in 0..3 {
            store.increment("slow:ip:10.0.0.1", window).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let count = store.increment("slow:ip:10.0.0.1", window).await.unwrap();
        assert_eq!(count.count, 1);
    }

    #[tokio::test]
    async fn reset_deadline_is_stable_within_a_window() {
        let store = MemoryStore::new();
        let first = store
            .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.reset_at_ms, second.reset_at_ms);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let store = MemoryStore::new();
        store
            .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();

        let peeked = store.peek("signup:ip:10.0.0.1").await.unwrap().unwrap();
        assert_eq!(peeked.count, 1);
        let peeked = store.peek("signup:ip:10.0.0.1").await.unwrap().unwrap();
        assert_eq!(peeked.count, 1);

        assert!(store.peek("signup:ip:10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_drops_lapsed_windows() {
        let store = MemoryStore::new();
        store
            .increment("slow:ip:10.0.0.1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        store.sweep();
        assert!(store.peek("slow:ip:10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fallback_store_reports_memory_backend_without_redis() {
        let store = FallbackStore::memory_only();
        assert_eq!(store.backend(), "memory");

        let count = store
            .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(count.count, 1);
    }

    #[tokio::test]
    async fn unreachable_redis_degrades_to_memory() {
        let store = FallbackStore::connect(Some("redis://127.0.0.1:1/")).await;
        assert_eq!(store.backend(), "memory");

        for expected in 1..=3 {
            let count = store
                .increment("signup:ip:10.0.0.1", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(count.count, expected);
        }
    }
}
