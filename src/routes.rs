use std::{
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::{
    error::AppError,
    keys::RequestContext,
    limiter::apply_headers,
    pipeline::Admission,
    signup::{SignupRequest, process_signup},
    state::AppState,
    store::CounterStore,
};

pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    // Shape errors are boundary failures and never reach the counters.
    let payload = match serde_json::from_value::<SignupRequest>(body) {
        Ok(payload) => payload.normalized(),
        Err(_) => {
            return AppError::Validation("malformed signup payload".to_string()).into_response();
        }
    };

    let ctx = RequestContext::from_request(
        &headers,
        peer,
        "/api/signup",
        Some(payload.email.clone()),
        state.config.trust_proxy,
    );

    let admission = match admit(&state, &ctx).await {
        Ok(admission) => admission,
        Err(e) => return e.into_response(),
    };

    let mut response = match process_signup(
        state.account.as_ref(),
        state.mailer.as_ref(),
        &state.config.confirm_redirect_url,
        payload,
    )
    .await
    {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => e.into_response(),
    };

    if !admission.bypassed {
        apply_headers(
            response.headers_mut(),
            admission.limit,
            admission.remaining,
            admission.reset_at_ms,
        );
    }
    response
}

async fn admit(state: &AppState, ctx: &RequestContext) -> Result<Admission, AppError> {
    let api = state.api_guard.admit(ctx).await?;
    let route = state.signup_pipeline.admit(ctx).await?;
    Ok(api.tighter(route))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        "uptime": state.started_at.elapsed().as_secs(),
        "store": state.store.backend(),
    }))
}

/// Current counters for the caller's own keys. Read-only; consumes nothing.
pub async fn limits_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let ctx = RequestContext::from_request(
        &headers,
        peer,
        "/api/limits",
        None,
        state.config.trust_proxy,
    );

    let mut guards = state.api_guard.snapshot(&ctx).await?;
    guards.extend(state.signup_pipeline.snapshot(&ctx).await?);

    Ok(Json(json!({
        "caller": ctx.addr.to_string(),
        "guards": guards,
    })))
}
