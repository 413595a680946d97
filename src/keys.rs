//! Rate-limit bucket keys.
//!
//! Each admission guard buckets traffic along one dimension of the request.
//! Keys are namespaced `<scope>:<dimension>:<value>` so two dimensions over
//! the same request never share a counter.
//!
//! The device fingerprint hashes a low-entropy header tuple; two browsers of
//! the same version behind one corporate NAT collide into one bucket. That
//! false positive is accepted, the fingerprint is a coarse net behind the
//! address and email dimensions, not an identity.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex length of the device fingerprint digest.
const FINGERPRINT_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("email is required")]
    MissingKeyInput,
}

/// Everything the guards need to know about one request, captured once at
/// the boundary and passed down. Handlers build it; nothing mutates it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub addr: IpAddr,
    pub path: String,
    pub email: Option<String>,
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub api_key: Option<String>,
}

impl RequestContext {
    pub fn from_request(
        headers: &HeaderMap,
        peer: SocketAddr,
        path: &str,
        email: Option<String>,
        trust_proxy: bool,
    ) -> Self {
        let addr = if trust_proxy {
            forwarded_ip(headers).unwrap_or_else(|| peer.ip())
        } else {
            peer.ip()
        };

        Self {
            // Canonical form: v4-mapped v6 addresses collapse to v4, so one
            // client cannot hold two address buckets by varying notation.
            addr: addr.to_canonical(),
            path: path.to_string(),
            email,
            user_agent: header_str(headers, "user-agent"),
            accept_language: header_str(headers, "accept-language"),
            accept_encoding: header_str(headers, "accept-encoding"),
            api_key: headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

/// Client address from proxy headers, in order: first valid entry of
/// `X-Forwarded-For`, then `X-Real-IP`. Only consulted when the deployment
/// declares a trusted proxy in front of the service.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for") {
        if let Ok(value) = xff.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(xri) = headers.get("x-real-ip") {
        if let Ok(value) = xri.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// How a guard buckets requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Canonicalized client network address.
    CallerAddress,
    /// Lower-cased, trimmed submitted email. Absent input is a hard
    /// rejection, never a silent skip.
    Email,
    /// Digest over the `{user-agent, accept-language, accept-encoding,
    /// caller-address}` tuple.
    DeviceFingerprint,
    /// Supplied API key, falling back to the caller address.
    Credential,
}

impl KeyStrategy {
    pub fn dimension(&self) -> &'static str {
        match self {
            KeyStrategy::CallerAddress => "ip",
            KeyStrategy::Email => "email",
            KeyStrategy::DeviceFingerprint => "device",
            KeyStrategy::Credential => "credential",
        }
    }

    pub fn derive(&self, ctx: &RequestContext) -> Result<String, KeyError> {
        match self {
            KeyStrategy::CallerAddress => Ok(ctx.addr.to_string()),
            KeyStrategy::Email => {
                let email = ctx
                    .email
                    .as_deref()
                    .map(|e| e.trim().to_lowercase())
                    .filter(|e| !e.is_empty())
                    .ok_or(KeyError::MissingKeyInput)?;
                Ok(email)
            }
            KeyStrategy::DeviceFingerprint => Ok(device_fingerprint(ctx)),
            KeyStrategy::Credential => Ok(ctx
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| ctx.addr.to_string())),
        }
    }
}

pub fn bucket_key(scope: &str, dimension: &str, value: &str) -> String {
    format!("{scope}:{dimension}:{value}")
}

fn device_fingerprint(ctx: &RequestContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ctx.user_agent.as_bytes());
    hasher.update(b"\n");
    hasher.update(ctx.accept_language.as_bytes());
    hasher.update(b"\n");
    hasher.update(ctx.accept_encoding.as_bytes());
    hasher.update(b"\n");
    hasher.update(ctx.addr.to_string().as_bytes());

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}
