//! Hosted account backend client.
//!
//! The storefront's users live in a managed auth service; this service only
//! asks it to mint a signup confirmation link for a new account. The admin
//! endpoint both creates the pending account and returns the action link the
//! confirmation email embeds.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("email is already registered")]
    AlreadyRegistered,

    #[error("account backend error {code}: {message}")]
    Provider { code: String, message: String },
}

#[async_trait]
pub trait AccountBackend: Send + Sync {
    /// Create the pending account and return its confirmation action link.
    async fn generate_signup_link(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
        redirect_url: &str,
    ) -> Result<String, AccountError>;
}

#[derive(Serialize)]
struct GenerateLinkRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    email: &'a str,
    password: &'a str,
    data: Value,
    redirect_to: &'a str,
}

#[derive(Deserialize)]
struct GenerateLinkResponse {
    action_link: String,
}

#[derive(Deserialize, Default)]
struct ProviderErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HostedAuthClient {
    http: Client,
    base_url: String,
    service_key: String,
}

impl HostedAuthClient {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }
}

#[async_trait]
impl AccountBackend for HostedAuthClient {
    async fn generate_signup_link(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
        redirect_url: &str,
    ) -> Result<String, AccountError> {
        let url = format!("{}/admin/generate_link", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&GenerateLinkRequest {
                kind: "signup",
                email,
                password,
                data: metadata,
                redirect_to: redirect_url,
            })
            .send()
            .await
            .map_err(|e| AccountError::Provider {
                code: "network".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            let body: GenerateLinkResponse =
                response.json().await.map_err(|e| AccountError::Provider {
                    code: "malformed_response".to_string(),
                    message: e.to_string(),
                })?;
            return Ok(body.action_link);
        }

        let body: ProviderErrorBody = response.json().await.unwrap_or_default();
        let code = body
            .error_code
            .unwrap_or_else(|| status.as_u16().to_string());

        if status == StatusCode::CONFLICT || is_duplicate_code(&code) {
            return Err(AccountError::AlreadyRegistered);
        }

        Err(AccountError::Provider {
            code,
            message: body
                .msg
                .or(body.message)
                .unwrap_or_else(|| "request rejected".to_string()),
        })
    }
}

fn is_duplicate_code(code: &str) -> bool {
    matches!(code, "user_already_exists" | "email_exists")
}
