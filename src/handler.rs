//! Per-message handler: validate, rate-limit, render, send
//!
//! Split to match who owns what: [`MessageHandler::prepare`] runs once per
//! delivery (parsing, validation, the rate-limit charge), and
//! [`MessageHandler::send`] is a single provider attempt. The consumer core
//! wraps only `send` in its retry loop, so retries never re-charge the
//! recipient's rate budget. Everything logged here is sanitized first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::WorkerError;
use crate::message::TypedPayload;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::sanitize;
use crate::sender::EmailSender;

pub const VERIFICATION_RATE_LIMIT: u32 = 5;
pub const PASSWORD_RESET_RATE_LIMIT: u32 = 3;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct MessageHandler {
    sender: EmailSender,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
}

impl MessageHandler {
    pub fn new(sender: EmailSender, limiter: RateLimiter, metrics: Arc<Metrics>) -> Self {
        Self { sender, limiter, metrics }
    }

    pub fn sender(&self) -> &EmailSender {
        &self.sender
    }

    /// Parse, validate, and charge the rate limit. Runs exactly once per
    /// delivery, before any retry. Every rejection here is permanent
    /// (`invalid_input`): malformed JSON, a bad address or URL, or a
    /// recipient over budget.
    pub async fn prepare(&self, body: &[u8]) -> Result<TypedPayload, WorkerError> {
        let payload = TypedPayload::parse(body)?;
        payload.validate()?;

        let max = match &payload {
            TypedPayload::VerifyEmail { .. } => VERIFICATION_RATE_LIMIT,
            TypedPayload::PasswordReset { .. } => PASSWORD_RESET_RATE_LIMIT,
        };
        self.limiter.check(payload.email(), max, RATE_LIMIT_WINDOW).await?;

        tracing::info!(
            kind = payload.kind().as_str(),
            email = %sanitize::mask_email(payload.email()),
            url = %sanitize::redact_url(payload.url()),
            "accepted email for dispatch"
        );
        Ok(payload)
    }

    /// One send attempt over a prepared payload. Never retries; the
    /// consumer core owns the loop. Failures surface as
    /// `email_provider_error` or `permanent_failure` from the sender.
    pub async fn send(&self, payload: &TypedPayload) -> Result<(), WorkerError> {
        let kind = payload.kind();
        let provider = self.sender.provider_name();
        let started = Instant::now();
        let result = match payload {
            TypedPayload::VerifyEmail { email, verification_url } => {
                self.sender.send_verification(email, verification_url).await
            }
            TypedPayload::PasswordReset { email, reset_url } => {
                self.sender.send_password_reset(email, reset_url).await
            }
        };

        match result {
            Ok(()) => {
                self.metrics
                    .email_send_duration
                    .with_label_values(&[kind.as_str(), provider])
                    .observe(started.elapsed().as_secs_f64());
                self.metrics.email_sent.with_label_values(&[kind.as_str(), provider]).inc();
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .email_failed
                    .with_label_values(&[kind.as_str(), provider, e.code()])
                    .inc();
                tracing::warn!(
                    kind = kind.as_str(),
                    email = %sanitize::mask_email(payload.email()),
                    error = %e,
                    "email dispatch failed"
                );
                Err(e)
            }
        }
    }
}
