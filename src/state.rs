use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    account::{AccountBackend, HostedAuthClient},
    config::Config,
    keys::KeyStrategy,
    limiter::{LimiterConfig, RateLimiter},
    mail::{Mailer, RelayMailer},
    pipeline::AdmissionPipeline,
    slowdown::SlowDown,
    store::{CounterStore, FallbackStore},
};

/// Paths that skip admission unconditionally.
pub const EXEMPT_PATHS: &[&str] = &["/health", "/api/limits"];

pub struct AppState {
    pub config: Config,
    pub store: Arc<FallbackStore>,
    pub account: Arc<dyn AccountBackend>,
    pub mailer: Arc<dyn Mailer>,
    pub api_guard: AdmissionPipeline,
    pub signup_pipeline: AdmissionPipeline,
    pub started_at: Instant,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let store = Arc::new(FallbackStore::connect(config.redis_url.as_deref()).await);
        let account = Arc::new(HostedAuthClient::new(
            &config.auth_base_url,
            &config.auth_service_key,
        ));
        let mailer = Arc::new(RelayMailer::new(
            &config.mail_api_url,
            &config.mail_api_key,
            &config.mail_from,
        ));

        Self::assemble(config, store, account, mailer)
    }

    /// Wire the admission pipelines from configuration. Split out of `new` so
    /// tests can inject their own store and capability clients.
    pub fn assemble(
        config: Config,
        store: Arc<FallbackStore>,
        account: Arc<dyn AccountBackend>,
        mailer: Arc<dyn Mailer>,
    ) -> Arc<Self> {
        let counters: Arc<dyn CounterStore> = store.clone();

        // One credential-keyed guard over the whole API surface; API clients
        // get their own bucket, browsers fall back to the caller address.
        let api_guard = AdmissionPipeline::new(
            None,
            vec![RateLimiter::new(
                LimiterConfig {
                    scope: "api",
                    window: Duration::from_secs(config.api_window_secs),
                    max: config.api_max,
                    strategy: KeyStrategy::Credential,
                },
                counters.clone(),
            )],
        )
        .with_exempt(EXEMPT_PATHS);

        // Signup guards in evaluation order: slow repeat callers down first,
        // then check each dimension, cheapest rejection first.
        let signup_pipeline = AdmissionPipeline::new(
            Some(SlowDown::new(
                "slow",
                Duration::from_secs(config.slowdown_window_secs),
                config.slowdown_after,
                Duration::from_millis(config.slowdown_base_ms),
                Duration::from_millis(config.slowdown_cap_ms),
                counters.clone(),
            )),
            vec![
                RateLimiter::new(
                    LimiterConfig {
                        scope: "signup",
                        window: Duration::from_secs(config.ip_window_secs),
                        max: config.ip_max,
                        strategy: KeyStrategy::CallerAddress,
                    },
                    counters.clone(),
                ),
                RateLimiter::new(
                    LimiterConfig {
                        scope: "signup",
                        window: Duration::from_secs(config.email_window_secs),
                        max: config.email_max,
                        strategy: KeyStrategy::Email,
                    },
                    counters.clone(),
                ),
                RateLimiter::new(
                    LimiterConfig {
                        scope: "signup",
                        window: Duration::from_secs(config.device_window_secs),
                        max: config.device_max,
                        strategy: KeyStrategy::DeviceFingerprint,
                    },
                    counters,
                ),
            ],
        )
        .with_exempt(EXEMPT_PATHS);

        Arc::new(Self {
            config,
            store,
            account,
            mailer,
            api_guard,
            signup_pipeline,
            started_at: Instant::now(),
        })
    }
}
