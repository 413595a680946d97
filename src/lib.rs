//! Documentation of the Atelier storefront's signup backend.
//!
//!
//!
//! # General Infrastructure
//! - The storefront (catalog, cart, checkout, admin panel) is a SvelteKit app
//!   talking directly to the hosted database/auth service
//! - This service is the one piece that cannot live in the storefront: it
//!   holds the auth service's admin credential and the mail relay key, so it
//!   runs server-side on the VPS
//! - Its single job: admit a signup request past the abuse guards, mint the
//!   confirmation link through the auth service's admin API, and hand that
//!   link to the transactional mail relay
//! - Runs behind the reverse proxy; client addresses arrive in forwarded
//!   headers, so `TRUST_PROXY` stays on in deployment
//!
//!
//!
//! # Preventing Signup Abuse
//!
//! **Goal**: keep scripted account creation from burning mail-relay quota and
//! flooding the auth service, without turning away real customers.
//!
//! - Every signup passes an ordered set of guards before any external call
//! - First a slowdown stage: free hits, then exponentially growing delays,
//!   capped so a patient human is never stuck more than the cap
//! - Then fixed-window limiters over independent dimensions: caller address,
//!   submitted email, device fingerprint
//! - The first rejecting guard ends the walk, so a request turned away on one
//!   dimension does not eat quota on the others
//! - Health and diagnostics paths bypass the guards entirely
//!
//!
//!
//! # Notes
//!
//! ## Redis + in-process counters
//! In theory the in-process map alone would do: the counters are tiny and
//! TTL-bound. But counters kept per instance under-count true global traffic
//! the moment a second instance runs behind the load balancer, and every
//! instance restart resets the windows. Redis gives atomic increments and a
//! shared view across instances for nearly no overhead.
//!
//! We do run into an issue when Redis is away. Instead of failing closed and
//! rejecting every signup, the store falls back to the in-process map and
//! logs it: limits are then enforced per instance, which is looser but keeps
//! the storefront selling. This is a tradeoff we are okay with.
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run against local defaults (in-process counters, no Redis).
//! ```sh
//! AUTH_SERVICE_KEY=dev MAIL_API_KEY=dev cargo run
//! ```
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod account;
pub mod config;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod mail;
pub mod pipeline;
pub mod routes;
pub mod signup;
pub mod slowdown;
pub mod state;
pub mod store;

use routes::{health_handler, limits_handler, signup_handler};
use state::AppState;

/// Request bodies larger than this are rejected before any handler runs.
const MAX_BODY_BYTES: usize = 10 * 1024;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/signup", post(signup_handler))
        .route("/api/limits", get(limits_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    // Redis keys expire on their own; the in-process map needs a sweeper.
    let sweeper = state.store.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            sweeper.sweep_expired();
        }
    });

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .allowed_origin
                .parse::<HeaderValue>()
                .expect("Invalid ALLOWED_ORIGIN"),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = build_router(state.clone()).layer(cors);

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    info!("In-flight requests drained, releasing counter store");
    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
