//! Consumer core: the per-delivery pipeline
//!
//! Wires broker deliveries through idempotency → validation → retried send
//! and decides the acknowledgement for every branch. The invariant: each delivery gets
//! exactly one ACK or NACK — the send succeeded, a DLQ copy was persisted,
//! the message was classified poison, or the broker gets it back.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::dlq::DlqPublisher;
use crate::handler::MessageHandler;
use crate::idempotency::IdempotencyStore;
use crate::message::InboundMessage;
use crate::metrics::Metrics;
use crate::retry::{self, RetryConfig, RetryError, Sleeper, TokioSleeper};
use crate::worker_pool::WorkerPool;

#[derive(Debug, Error)]
#[error("acknowledgement failed: {0}")]
pub struct AckError(pub String);

/// Per-delivery acknowledgement handle. The consumer core calls exactly one
/// of these, exactly once, for every delivery it receives.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AckError>;
    async fn nack_requeue(&self) -> Result<(), AckError>;
}

#[derive(Clone)]
pub struct Consumer {
    handler: MessageHandler,
    idempotency: IdempotencyStore,
    dlq: Arc<dyn DlqPublisher>,
    pool: Arc<WorkerPool>,
    retry: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: MessageHandler,
        idempotency: IdempotencyStore,
        dlq: Arc<dyn DlqPublisher>,
        pool: Arc<WorkerPool>,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handler,
            idempotency,
            dlq,
            pool,
            retry,
            sleeper: Arc::new(TokioSleeper),
            metrics,
            shutdown,
        }
    }

    /// Swap the backoff sleeper; tests use this to run retries instantly.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Record the delivery and hand it to the worker pool. Blocks only when
    /// the pool buffer is full; that backpressure, together with broker
    /// prefetch, bounds in-flight work.
    pub async fn dispatch(&self, queue: &str, message: InboundMessage, acker: Arc<dyn Acker>) {
        let kind = message.kind();
        self.metrics.messages_consumed.with_label_values(&[queue, kind.as_str()]).inc();

        let consumer = self.clone();
        self.pool.submit(async move { consumer.process(message, acker).await }).await;
    }

    /// One handle-message unit. Public so the end-to-end tests can drive the
    /// pipeline without a live broker.
    pub async fn process(&self, message: InboundMessage, acker: Arc<dyn Acker>) {
        let request_id = message
            .request_id()
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "process_message",
            request_id = %request_id,
            delivery_tag = message.delivery_tag,
        );
        self.process_inner(message, acker).instrument(span).await;
    }

    async fn process_inner(&self, message: InboundMessage, acker: Arc<dyn Acker>) {
        let started = Instant::now();
        let kind = message.kind();

        if message.oversized() {
            tracing::warn!(bytes = message.body.len(), "message exceeds size limit, dropping");
            self.metrics.record_dlq("message_too_large");
            Self::ack(&acker).await;
            return;
        }

        let fingerprint = message.fingerprint();
        match self.idempotency.check_and_mark(&fingerprint).await {
            Err(e) => {
                // Cannot tell whether this fingerprint was processed:
                // sending risks a duplicate, acking risks loss. Hand the
                // delivery back to the broker.
                tracing::error!(error = %e, "idempotency check failed, returning delivery");
                self.metrics.record_dlq("idempotency_check_failed");
                Self::nack(&acker).await;
                return;
            }
            Ok(true) => {
                tracing::info!(%fingerprint, "duplicate delivery suppressed");
                self.metrics.record_idempotency(true);
                Self::ack(&acker).await;
                return;
            }
            Ok(false) => self.metrics.record_idempotency(false),
        }

        // Parse, validate, and charge the rate limit exactly once; the
        // retry loop below wraps only the send, so attempts never re-charge
        // the recipient's budget. Rejections here are permanent.
        let payload = match self.handler.prepare(&message.body).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "payload rejected, dropping message");
                self.metrics.record_dlq(e.code());
                Self::ack(&acker).await;
                return;
            }
        };

        let handler = &self.handler;
        let payload_ref = &payload;
        let result = retry::run(&self.retry, &self.shutdown, self.sleeper.as_ref(), |attempt| {
            if attempt > 0 {
                self.metrics.retry_attempts.with_label_values(&[kind.as_str()]).inc();
            }
            async move { handler.send(payload_ref).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.metrics
                    .processing_duration
                    .with_label_values(&[kind.as_str()])
                    .observe(started.elapsed().as_secs_f64());
                Self::ack(&acker).await;
            }
            Err(RetryError::Cancelled) => {
                tracing::warn!("shutdown interrupted processing, returning delivery");
                Self::nack(&acker).await;
            }
            Err(RetryError::Fatal(e)) => {
                // Known poison: keeping it in the queue would loop forever.
                tracing::warn!(error = %e, code = e.code(), "permanent failure, dropping message");
                self.metrics.record_dlq(e.code());
                Self::ack(&acker).await;
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(attempts, error = %last, "retries exhausted, dead-lettering");
                match self.dlq.publish(&message, &last.to_string()).await {
                    Ok(()) => {
                        self.metrics.record_dlq(last.code());
                        Self::ack(&acker).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dead-letter publish failed, returning delivery");
                        self.metrics.record_dlq("dlq_publish_failed");
                        Self::nack(&acker).await;
                    }
                }
            }
        }
    }

    /// Drain: stop accepting new work and wait for everything submitted.
    pub async fn drain(&self) {
        self.pool.wait().await;
    }

    async fn ack(acker: &Arc<dyn Acker>) {
        if let Err(e) = acker.ack().await {
            tracing::error!(error = %e, "failed to ack delivery");
        }
    }

    async fn nack(acker: &Arc<dyn Acker>) {
        if let Err(e) = acker.nack_requeue().await {
            tracing::error!(error = %e, "failed to nack delivery");
        }
    }
}
