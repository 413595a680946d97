use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    keys::KeyError,
    limiter::{AdmissionDecision, apply_headers, apply_retry_after},
    store::StoreError,
};

/// Request failures, each mapping to one client-visible response. External
/// provider detail stays in the logs; clients get a stable `error` field and
/// nothing sensitive.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("an account with this email already exists")]
    AlreadyRegistered,

    #[error("too many requests")]
    RateLimited(AdmissionDecision),

    #[error("account backend failure")]
    ExternalAuth,

    #[error("confirmation email delivery failed")]
    EmailDelivery,

    #[error("counter store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<KeyError> for AppError {
    fn from(e: KeyError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": message })),
            )
                .into_response(),

            AppError::AlreadyRegistered => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "An account with this email already exists" })),
            )
                .into_response(),

            AppError::RateLimited(decision) => {
                let retry_after = decision.retry_after_secs.unwrap_or(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "rate_limited",
                        "message": "Too many requests, please try again later.",
                        "retryAfter": retry_after,
                        "limit": decision.limit,
                        "remaining": decision.remaining,
                    })),
                )
                    .into_response();

                apply_headers(
                    response.headers_mut(),
                    decision.limit,
                    decision.remaining,
                    decision.reset_at_ms,
                );
                apply_retry_after(response.headers_mut(), retry_after);
                response
            }

            AppError::ExternalAuth => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Signup is temporarily unavailable" })),
            )
                .into_response(),

            AppError::EmailDelivery => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "We could not send the confirmation email" })),
            )
                .into_response(),

            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal error" })),
            )
                .into_response(),
        }
    }
}
