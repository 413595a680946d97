use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use tracing::{info, warn};

/// Environment-provided settings, loaded once at startup and read-only after.
pub struct Config {
    pub port: u16,
    /// Absent means in-process counters only.
    pub redis_url: Option<String>,
    pub auth_base_url: String,
    pub auth_service_key: String,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_from: String,
    pub allowed_origin: String,
    pub confirm_redirect_url: String,
    /// Honor proxy-forwarded client addresses. Only enable behind a proxy
    /// that overwrites the header, otherwise callers pick their own bucket.
    pub trust_proxy: bool,

    pub api_max: u64,
    pub api_window_secs: u64,
    pub ip_max: u64,
    pub ip_window_secs: u64,
    pub email_max: u64,
    pub email_window_secs: u64,
    pub device_max: u64,
    pub device_window_secs: u64,

    pub slowdown_after: u64,
    pub slowdown_window_secs: u64,
    pub slowdown_base_ms: u64,
    pub slowdown_cap_ms: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("RUST_PORT", "8080"),
            redis_url: var("REDIS_URL").ok(),
            auth_base_url: try_load("AUTH_BASE_URL", "http://127.0.0.1:9999"),
            auth_service_key: read_secret("AUTH_SERVICE_KEY"),
            mail_api_url: try_load("MAIL_API_URL", "https://api.smtp2go.com/v3/email/send"),
            mail_api_key: read_secret("MAIL_API_KEY"),
            mail_from: try_load("MAIL_FROM", "Atelier <no-reply@atelier.example>"),
            allowed_origin: try_load("ALLOWED_ORIGIN", "http://localhost:5173"),
            confirm_redirect_url: try_load("CONFIRM_REDIRECT_URL", "http://localhost:5173/welcome"),
            trust_proxy: try_load("TRUST_PROXY", "true"),

            api_max: try_load("API_MAX", "100"),
            api_window_secs: try_load("API_WINDOW_SECS", "900"),
            ip_max: try_load("SIGNUP_IP_MAX", "5"),
            ip_window_secs: try_load("SIGNUP_IP_WINDOW_SECS", "3600"),
            email_max: try_load("SIGNUP_EMAIL_MAX", "3"),
            email_window_secs: try_load("SIGNUP_EMAIL_WINDOW_SECS", "3600"),
            device_max: try_load("SIGNUP_DEVICE_MAX", "10"),
            device_window_secs: try_load("SIGNUP_DEVICE_WINDOW_SECS", "3600"),

            slowdown_after: try_load("SLOWDOWN_AFTER", "2"),
            slowdown_window_secs: try_load("SLOWDOWN_WINDOW_SECS", "900"),
            slowdown_base_ms: try_load("SLOWDOWN_BASE_MS", "1000"),
            slowdown_cap_ms: try_load("SLOWDOWN_CAP_MS", "30000"),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn read_secret(secret_name: &str) -> String {
    let path = format!("/run/secrets/{secret_name}");

    if let Ok(contents) = read_to_string(&path) {
        return contents.trim().to_string();
    }

    env::var(secret_name)
        .map_err(|_| {
            warn!("Secret {secret_name} found neither at {path} nor in the environment");
        })
        .expect("Secrets misconfigured!")
}
