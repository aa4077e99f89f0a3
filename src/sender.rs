//! Email sender: one provider behind the circuit breaker
//!
//! Render, then dispatch inside `breaker.call`. Breaker rejections surface as
//! retryable provider errors, so the consumer's retry loop backs off instead
//! of hammering an open circuit.

use std::sync::Arc;

use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitState};
use crate::error::WorkerError;
use crate::provider::{EmailProvider, Envelope, ProviderError};
use crate::templates::{self, RenderedEmail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderHealth {
    pub provider: &'static str,
    pub circuit: CircuitState,
}

#[derive(Clone)]
pub struct EmailSender {
    provider: Arc<dyn EmailProvider>,
    breaker: CircuitBreaker,
    from: String,
    from_name: String,
}

impl EmailSender {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        breaker: CircuitBreaker,
        from: String,
        from_name: String,
    ) -> Self {
        Self { provider, breaker, from, from_name }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// A provider is always configured by construction; health reporting is
    /// provider identity plus the breaker's view of it.
    pub fn health(&self) -> SenderHealth {
        SenderHealth { provider: self.provider.name(), circuit: self.breaker.state() }
    }

    pub async fn send_verification(&self, to: &str, url: &str) -> Result<(), WorkerError> {
        self.dispatch(to, templates::verification(url)).await
    }

    pub async fn send_password_reset(&self, to: &str, url: &str) -> Result<(), WorkerError> {
        self.dispatch(to, templates::password_reset(url)).await
    }

    async fn dispatch(&self, to: &str, rendered: RenderedEmail) -> Result<(), WorkerError> {
        let envelope = Envelope {
            to: to.to_owned(),
            subject: rendered.subject,
            body_html: rendered.html,
            from: self.from.clone(),
            from_name: self.from_name.clone(),
        };

        match self.breaker.call(|| self.provider.send_email(&envelope)).await {
            Ok(()) => Ok(()),
            Err(BreakerError::Open { failures }) => Err(WorkerError::Provider(format!(
                "circuit breaker open after {failures} consecutive failures"
            ))),
            Err(BreakerError::Inner(ProviderError::Transient(reason))) => {
                Err(WorkerError::Provider(reason))
            }
            Err(BreakerError::Inner(ProviderError::Permanent(reason))) => {
                Err(WorkerError::Permanent(reason))
            }
        }
    }
}
