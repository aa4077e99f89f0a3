//! Inbound envelopes and typed payloads
//!
//! `InboundMessage` is the broker-agnostic view of a delivery: tag, bytes,
//! headers. `TypedPayload` is the closed set of event variants, discriminated
//! by the JSON `type` field; anything outside the set is a parse error.

use std::collections::HashMap;
use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::WorkerError;

/// Deliveries beyond this size are acknowledged and dropped without
/// processing.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_URL_LEN: usize = 2048;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

const FORBIDDEN_URL_PREFIXES: [&str; 4] = ["javascript:", "data:", "vbscript:", "file:"];

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^[a-zA-Z0-9.!\#$%&'*+/=?^_`{|}~-]+
        @
        [a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?
        (?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email regex must compile")
});

/// Message type derived for metric labels only; routing never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Verification,
    PasswordReset,
    Unknown,
}

impl MessageKind {
    /// Cheap substring sniff over the raw body. Yields `Unknown` on unusual
    /// field ordering, which only skews a label.
    pub fn sniff(body: &[u8]) -> Self {
        if contains(body, b"email_verification") {
            Self::Verification
        } else if contains(body, b"password_reset") {
            Self::PasswordReset
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verification => "email_verification",
            Self::PasswordReset => "password_reset",
            Self::Unknown => "unknown",
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// One broker delivery, owned by the consumer core until ack/nack.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
}

impl InboundMessage {
    pub fn new(delivery_tag: u64, body: Vec<u8>) -> Self {
        Self { delivery_tag, body, headers: HashMap::new(), content_type: None }
    }

    /// Idempotency key: hex SHA-256 of the body. Redeliveries carry fresh
    /// delivery tags but identical bodies, so the tag stays out of the hash.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.body);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(REQUEST_ID_HEADER))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::sniff(&self.body)
    }

    pub fn oversized(&self) -> bool {
        self.body.len() > MAX_BODY_BYTES
    }
}

/// The two event variants this worker understands. Unknown `type` tags fail
/// to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum TypedPayload {
    #[serde(rename = "email_verification")]
    VerifyEmail { email: String, verification_url: String },
    #[serde(rename = "password_reset")]
    PasswordReset { email: String, reset_url: String },
}

impl TypedPayload {
    pub fn parse(body: &[u8]) -> Result<Self, WorkerError> {
        serde_json::from_slice(body)
            .map_err(|e| WorkerError::InvalidInput(format!("malformed payload: {e}")))
    }

    pub fn email(&self) -> &str {
        match self {
            Self::VerifyEmail { email, .. } | Self::PasswordReset { email, .. } => email,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::VerifyEmail { verification_url, .. } => verification_url,
            Self::PasswordReset { reset_url, .. } => reset_url,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::VerifyEmail { .. } => MessageKind::Verification,
            Self::PasswordReset { .. } => MessageKind::PasswordReset,
        }
    }

    /// Field-level validation: address shape and length, URL scheme, length
    /// and forbidden prefixes.
    pub fn validate(&self) -> Result<(), WorkerError> {
        validate_email(self.email())?;
        validate_url(self.url())
    }
}

fn validate_email(email: &str) -> Result<(), WorkerError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(WorkerError::InvalidInput(format!(
            "email exceeds {MAX_EMAIL_LEN} characters"
        )));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(WorkerError::InvalidInput("email address is malformed".into()));
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), WorkerError> {
    if raw.len() > MAX_URL_LEN {
        return Err(WorkerError::InvalidInput(format!("url exceeds {MAX_URL_LEN} characters")));
    }
    let lowered = raw.trim().to_ascii_lowercase();
    for prefix in FORBIDDEN_URL_PREFIXES {
        if lowered.starts_with(prefix) {
            return Err(WorkerError::InvalidInput(format!("url scheme {prefix} is forbidden")));
        }
    }
    let parsed =
        Url::parse(raw).map_err(|e| WorkerError::InvalidInput(format!("url is malformed: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(WorkerError::InvalidInput(format!("url scheme {other} is not allowed"))),
    }
}
