//! Signup orchestration.
//!
//! One request walks received → validated → link generated → email sent →
//! completed, stopping at the first terminal failure. The account backend
//! and the mail relay do not share a transaction: a mail failure after link
//! generation leaves the pending account in place, and the user resolves it
//! by requesting a fresh confirmation email.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::{
    account::{AccountBackend, AccountError},
    error::AppError,
    mail::Mailer,
};

const CONFIRM_SUBJECT: &str = "Confirm your Atelier account";

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[validate(email(message = "a valid email address is required"))]
    pub email: String,

    #[validate(length(min = 8, message = "password must be at least 8 characters"))]
    pub password: String,

    #[serde(default)]
    #[validate(length(max = 50, message = "first name must be 50 characters or fewer"))]
    pub first_name: Option<String>,

    #[serde(default)]
    #[validate(length(max = 50, message = "last name must be 50 characters or fewer"))]
    pub last_name: Option<String>,
}

impl SignupRequest {
    /// Canonical form used for both the rate-limit key and the account
    /// backend: lower-cased trimmed email, trimmed names with angle brackets
    /// stripped, empty names dropped.
    pub fn normalized(mut self) -> Self {
        self.email = self.email.trim().to_lowercase();
        self.first_name = self.first_name.and_then(clean_name);
        self.last_name = self.last_name.and_then(clean_name);
        self
    }
}

fn clean_name(name: String) -> Option<String> {
    let cleaned = name.replace(['<', '>'], "").trim().to_string();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Field-specific validation, reported with the offending field named.
pub fn validate_payload(payload: &SignupRequest) -> Result<(), AppError> {
    let Err(errors) = payload.validate() else {
        return Ok(());
    };

    let mut fields: Vec<(String, String)> = errors
        .field_errors()
        .iter()
        .map(|(field, errs)| {
            let message = errs
                .first()
                .and_then(|e| e.message.as_ref())
                .map(|m| m.to_string())
                .unwrap_or_else(|| "is invalid".to_string());
            (field.to_string(), message)
        })
        .collect();
    fields.sort();

    let detail = fields
        .into_iter()
        .map(|(field, message)| format!("{field}: {message}"))
        .collect::<Vec<_>>()
        .join("; ");

    Err(AppError::Validation(detail))
}

#[derive(Debug, Serialize)]
pub struct SignupReceipt {
    pub message: String,
    pub email: String,
}

pub async fn process_signup(
    account: &dyn AccountBackend,
    mailer: &dyn Mailer,
    redirect_url: &str,
    payload: SignupRequest,
) -> Result<SignupReceipt, AppError> {
    let payload = payload.normalized();
    validate_payload(&payload)?;
    debug!(email = %payload.email, stage = "validated", "signup accepted for processing");

    let metadata = json!({
        "firstName": payload.first_name,
        "lastName": payload.last_name,
    });

    let link = account
        .generate_signup_link(&payload.email, &payload.password, metadata, redirect_url)
        .await
        .map_err(|e| match e {
            AccountError::AlreadyRegistered => AppError::AlreadyRegistered,
            AccountError::Provider { code, message } => {
                error!(code = %code, message = %message, "account backend rejected link generation");
                AppError::ExternalAuth
            }
        })?;
    debug!(email = %payload.email, stage = "link_generated", "confirmation link issued");

    let html = confirmation_html(&link, payload.first_name.as_deref());
    mailer
        .send(&payload.email, CONFIRM_SUBJECT, &html)
        .await
        .map_err(|e| {
            // The pending account stays; the user recovers by requesting a
            // fresh confirmation email.
            warn!(
                email = %payload.email,
                error = %e,
                "confirmation email failed after account creation"
            );
            AppError::EmailDelivery
        })?;

    info!(email = %payload.email, stage = "completed", "signup confirmation sent");

    Ok(SignupReceipt {
        message: "Confirmation email sent".to_string(),
        email: payload.email,
    })
}

fn confirmation_html(link: &str, first_name: Option<&str>) -> String {
    let greeting = match first_name {
        Some(name) => format!("Bonjour {name},"),
        None => "Bonjour,".to_string(),
    };

    format!(
        "<p>{greeting}</p>\
         <p>Welcome to Atelier. Confirm your email address to activate your account:</p>\
         <p><a href=\"{link}\">Confirm my account</a></p>\
         <p>If you did not create this account, you can ignore this email.</p>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn payload(email: &str) -> SignupRequest {
        SignupRequest {
            email: email.to_string(),
            password: "correct horse".to_string(),
            first_name: Some("Vivienne".to_string()),
            last_name: None,
        }
    }

    #[derive(Default)]
    struct FakeAccount {
        registered: Mutex<Vec<String>>,
        fail_with: Mutex<Option<AccountError>>,
    }

    #[async_trait]
    impl AccountBackend for FakeAccount {
        async fn generate_signup_link(
            &self,
            email: &str,
            _password: &str,
            _metadata: serde_json::Value,
            redirect_url: &str,
        ) -> Result<String, AccountError> {
            if let Some(e) = self.fail_with.lock().take() {
                return Err(e);
            }
            let mut registered = self.registered.lock();
            if registered.iter().any(|r| r == email) {
                return Err(AccountError::AlreadyRegistered);
            }
            registered.push(email.to_string());
            Ok(format!("{redirect_url}?token=tok-{email}"))
        }
    }

    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<(String, String, String)>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), crate::mail::MailError> {
            if *self.failing.lock() {
                return Err(crate::mail::MailError::Transport("boom".to_string()));
            }
            self.sent
                .lock()
                .push((to.to_string(), subject.to_string(), html.to_string()));
            Ok(())
        }
    }

    #[test]
    fn normalization_lowers_email_and_strips_angle_brackets() {
        let normalized = SignupRequest {
            email: "  USER@Example.COM ".to_string(),
            password: "longenough".to_string(),
            first_name: Some(" <b>Jean</b> ".to_string()),
            last_name: Some("  <>  ".to_string()),
        }
        .normalized();

        assert_eq!(normalized.email, "user@example.com");
        assert_eq!(normalized.first_name.as_deref(), Some("bJean/b"));
        assert_eq!(normalized.last_name, None);
    }

    #[test]
    fn validation_names_the_offending_field() {
        let mut bad_email = payload("not-an-email");
        bad_email.password = "longenough".to_string();
        let err = validate_payload(&bad_email.normalized()).unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("email")));

        let mut short_password = payload("user@example.com");
        short_password.password = "short".to_string();
        let err = validate_payload(&short_password.normalized()).unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("password")));

        let mut long_name = payload("user@example.com");
        long_name.first_name = Some("x".repeat(51));
        let err = validate_payload(&long_name.normalized()).unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("first_name")));
    }

    #[tokio::test]
    async fn completed_signup_echoes_the_normalized_email() {
        let account = FakeAccount::default();
        let mailer = FakeMailer::default();

        let receipt = process_signup(
            &account,
            &mailer,
            "https://shop.example/welcome",
            payload("  VIP@Example.com "),
        )
        .await
        .unwrap();

        assert_eq!(receipt.email, "vip@example.com");
        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "vip@example.com");
        assert!(sent[0].2.contains("https://shop.example/welcome?token="));
        assert!(sent[0].2.contains("Vivienne"));
    }

    #[tokio::test]
    async fn invalid_payload_makes_no_external_calls() {
        let account = FakeAccount::default();
        let mailer = FakeMailer::default();

        let mut bad = payload("user@example.com");
        bad.password = "short".to_string();
        let err = process_signup(&account, &mailer, "https://shop.example", bad)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert!(account.registered.lock().is_empty());
        assert!(mailer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_accounts_surface_as_a_conflict() {
        let account = FakeAccount::default();
        let mailer = FakeMailer::default();

        process_signup(&account, &mailer, "https://shop.example", payload("a@b.com"))
            .await
            .unwrap();
        let err = process_signup(&account, &mailer, "https://shop.example", payload("A@b.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn provider_failures_map_to_the_generic_auth_error() {
        let account = FakeAccount::default();
        *account.fail_with.lock() = Some(AccountError::Provider {
            code: "unexpected_failure".to_string(),
            message: "backend down".to_string(),
        });
        let mailer = FakeMailer::default();

        let err = process_signup(&account, &mailer, "https://shop.example", payload("a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalAuth));
        assert!(mailer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn mail_failure_keeps_the_created_account() {
        let account = FakeAccount::default();
        let mailer = FakeMailer::default();
        *mailer.failing.lock() = true;

        let err = process_signup(&account, &mailer, "https://shop.example", payload("a@b.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::EmailDelivery));
        // No compensating deletion: the account remains pending confirmation.
        assert_eq!(account.registered.lock().len(), 1);
    }
}
