//! Transactional mail relay client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum MailError {
    #[error("mail relay rejected the message: {0}")]
    Rejected(String),

    #[error("mail relay unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    api_key: &'a str,
    sender: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html_body: &'a str,
}

/// HTTP client for the transactional relay's send endpoint.
pub struct RelayMailer {
    http: Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl RelayMailer {
    pub fn new(api_url: &str, api_key: &str, from: &str) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl Mailer for RelayMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        let response = self
            .http
            .post(&self.api_url)
            .timeout(REQUEST_TIMEOUT)
            .header("X-Api-Key", &self.api_key)
            .json(&RelayMessage {
                api_key: &self.api_key,
                sender: &self.from,
                to: vec![to],
                subject,
                html_body: html,
            })
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Rejected(format!("relay returned {status}")));
        }

        Ok(())
    }
}
