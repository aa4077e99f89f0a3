//! Outbound provider boundary
//!
//! `EmailProvider::send_email` is the only place the pipeline touches the
//! network for mail. Errors arrive pre-classified: transient failures feed
//! the retry loop, permanent rejections do not.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// The rendered message handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub from: String,
    pub from_name: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Worth retrying: timeouts, connection failures, throttling, 5xx.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The provider rejected the message outright; retrying cannot help.
    #[error("permanent provider rejection: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_email(&self, envelope: &Envelope) -> Result<(), ProviderError>;

    /// Label for metrics and logs.
    fn name(&self) -> &'static str;
}

/// Development sink: logs the envelope instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProvider;

#[async_trait]
impl EmailProvider for LogProvider {
    async fn send_email(&self, envelope: &Envelope) -> Result<(), ProviderError> {
        tracing::info!(
            to = %crate::sanitize::mask_email(&envelope.to),
            subject = %envelope.subject,
            "log provider: pretending to deliver email"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    from_name: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
}

/// Transactional HTTP API client. One `reqwest::Client` per provider so the
/// connection pool is reused across sends.
pub struct HttpProvider {
    http_client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpProvider {
    pub fn new(base_url: String, token: String) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http_client, base_url, token })
    }

    fn endpoint(&self) -> String {
        format!("{}/email", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmailProvider for HttpProvider {
    async fn send_email(&self, envelope: &Envelope) -> Result<(), ProviderError> {
        let request = SendEmailRequest {
            from: &envelope.from,
            from_name: &envelope.from_name,
            to: &envelope.to,
            subject: &envelope.subject,
            html_body: &envelope.body_html,
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        let reason = format!("provider returned {status}: {detail}");
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(ProviderError::Transient(reason))
        } else {
            Err(ProviderError::Permanent(reason))
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
