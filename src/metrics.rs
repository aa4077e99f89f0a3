//! Prometheus metric families for the delivery pipeline
//!
//! One `Metrics` instance owns its `Registry`; every stage receives it as an
//! injected `Arc`. `render` produces the text exposition format for whatever
//! probe server fronts the worker.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Deliveries taken off each queue, labeled with the body-scan type.
    pub messages_consumed: IntCounterVec,
    /// Successful provider sends.
    pub email_sent: IntCounterVec,
    /// Failed provider sends, labeled with the error code.
    pub email_failed: IntCounterVec,
    /// Wall time of a single provider send.
    pub email_send_duration: HistogramVec,
    /// Wall time of one delivery through the whole pipeline (success only).
    pub processing_duration: HistogramVec,
    /// Attempts beyond the first, per message type.
    pub retry_attempts: IntCounterVec,
    /// Dead-letter outcomes by reason; includes metric-only reasons like
    /// `message_too_large` and `permanent_failure`.
    pub dlq_messages: IntCounterVec,
    /// Fingerprint claims, labeled hit/miss.
    pub idempotency_checks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_consumed = IntCounterVec::new(
            Opts::new("messages_consumed_total", "Broker deliveries received"),
            &["queue", "type"],
        )?;
        let email_sent = IntCounterVec::new(
            Opts::new("email_sent_total", "Emails accepted by the provider"),
            &["type", "provider"],
        )?;
        let email_failed = IntCounterVec::new(
            Opts::new("email_failed_total", "Emails the provider rejected or never received"),
            &["type", "provider", "error_type"],
        )?;
        let email_send_duration = HistogramVec::new(
            HistogramOpts::new("email_send_duration_seconds", "Provider send latency"),
            &["type", "provider"],
        )?;
        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "message_processing_duration_seconds",
                "End-to-end processing latency for acknowledged successes",
            ),
            &["type"],
        )?;
        let retry_attempts = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Handler attempts beyond the first"),
            &["type"],
        )?;
        let dlq_messages = IntCounterVec::new(
            Opts::new("dlq_messages_total", "Messages dead-lettered or dropped, by reason"),
            &["reason"],
        )?;
        let idempotency_checks = IntCounterVec::new(
            Opts::new("idempotency_checks_total", "Fingerprint claims by outcome"),
            &["result"],
        )?;

        registry.register(Box::new(messages_consumed.clone()))?;
        registry.register(Box::new(email_sent.clone()))?;
        registry.register(Box::new(email_failed.clone()))?;
        registry.register(Box::new(email_send_duration.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;
        registry.register(Box::new(retry_attempts.clone()))?;
        registry.register(Box::new(dlq_messages.clone()))?;
        registry.register(Box::new(idempotency_checks.clone()))?;

        Ok(Self {
            registry,
            messages_consumed,
            email_sent,
            email_failed,
            email_send_duration,
            processing_duration,
            retry_attempts,
            dlq_messages,
            idempotency_checks,
        })
    }

    pub fn record_dlq(&self, reason: &str) {
        self.dlq_messages.with_label_values(&[reason]).inc();
    }

    pub fn record_idempotency(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.idempotency_checks.with_label_values(&[result]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format for scraping.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not utf-8: {e}")))
    }
}
