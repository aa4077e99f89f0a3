//! Observable doubles for driving the pipeline without broker, Redis, or a
//! real provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use courier::consumer::{AckError, Acker, Consumer};
use courier::dlq::{annotated_headers, DlqError, DlqPublisher};
use courier::handler::MessageHandler;
use courier::idempotency::IdempotencyStore;
use courier::kv::{InMemoryKv, KeyValue, KvError};
use courier::message::InboundMessage;
use courier::metrics::Metrics;
use courier::provider::{EmailProvider, Envelope, ProviderError};
use courier::rate_limit::RateLimiter;
use courier::retry::{RetryConfig, Sleeper};
use courier::sender::EmailSender;
use courier::worker_pool::WorkerPool;

/// Provider that fails a scripted number of times before succeeding, or
/// permanently. Records every envelope it sees.
#[derive(Default)]
pub struct MockProvider {
    pub calls: AtomicUsize,
    pub envelopes: Mutex<Vec<Envelope>>,
    fail_times: AtomicUsize,
    permanent: bool,
}

impl MockProvider {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn transient_failures(n: usize) -> Self {
        Self { fail_times: AtomicUsize::new(n), ..Self::default() }
    }

    pub fn always_failing() -> Self {
        Self::transient_failures(usize::MAX)
    }

    pub fn permanent_rejection() -> Self {
        Self { fail_times: AtomicUsize::new(usize::MAX), permanent: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailProvider for MockProvider {
    async fn send_email(&self, envelope: &Envelope) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.envelopes.lock().unwrap().push(envelope.clone());
        let remaining = self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            if self.permanent {
                return Err(ProviderError::Permanent("mailbox does not exist".into()));
            }
            return Err(ProviderError::Transient("connection reset".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Acknowledgement recorder. The no-silent-loss property is checked by
/// asserting `acks + nacks == 1` per delivery.
#[derive(Default)]
pub struct RecordingAcker {
    pub acks: AtomicUsize,
    pub nacks: AtomicUsize,
}

impl RecordingAcker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acked(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> Result<(), AckError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack_requeue(&self) -> Result<(), AckError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DlqRecord {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub reason: String,
}

/// Dead-letter sink storing full records; can be switched to fail.
#[derive(Default)]
pub struct RecordingDlq {
    pub records: Mutex<Vec<DlqRecord>>,
    fail: AtomicBool,
}

impl RecordingDlq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let dlq = Self::default();
        dlq.fail.store(true, Ordering::SeqCst);
        Arc::new(dlq)
    }

    pub fn records(&self) -> Vec<DlqRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DlqPublisher for RecordingDlq {
    async fn declare(&self) -> Result<(), DlqError> {
        Ok(())
    }

    async fn publish(&self, message: &InboundMessage, reason: &str) -> Result<(), DlqError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DlqError::Publish("dead-letter broker unavailable".into()));
        }
        self.records.lock().unwrap().push(DlqRecord {
            body: message.body.clone(),
            headers: annotated_headers(message, reason),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// In-memory key-value store with a failure switch, for the
/// idempotency-outage scenario.
#[derive(Default)]
pub struct FlakyKv {
    inner: InMemoryKv,
    fail: AtomicBool,
}

impl FlakyKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KvError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(KvError::Backend("store outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValue for FlakyKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.check()
    }
}

pub struct Pipeline {
    pub consumer: Consumer,
    pub metrics: Arc<Metrics>,
    pub provider: Arc<MockProvider>,
    pub dlq: Arc<RecordingDlq>,
    pub idempotency: IdempotencyStore,
    pub shutdown: CancellationToken,
}

/// Fast retry schedule for tests that do not assert on wall time.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

pub fn build_pipeline(
    provider: Arc<MockProvider>,
    dlq: Arc<RecordingDlq>,
    kv: Arc<dyn KeyValue>,
    retry: RetryConfig,
    sleeper: Option<Arc<dyn Sleeper>>,
) -> Pipeline {
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    let sender = EmailSender::new(
        provider.clone(),
        CircuitBreaker::new(CircuitBreakerConfig::default()),
        "no-reply@example.com".into(),
        "Courier".into(),
    );
    let handler = MessageHandler::new(sender, RateLimiter::new(kv.clone()), metrics.clone());
    let idempotency = IdempotencyStore::new(kv);
    let shutdown = CancellationToken::new();

    let mut consumer = Consumer::new(
        handler,
        idempotency.clone(),
        dlq.clone(),
        Arc::new(WorkerPool::new(4)),
        retry,
        metrics.clone(),
        shutdown.clone(),
    );
    if let Some(sleeper) = sleeper {
        consumer = consumer.with_sleeper(sleeper);
    }

    Pipeline { consumer, metrics, provider, dlq, idempotency, shutdown }
}

pub fn verification_message(tag: u64) -> InboundMessage {
    let body =
        br#"{"type":"email_verification","email":"alice@example.com","verification_url":"https://app.test/v?t=abc"}"#
            .to_vec();
    let mut message = InboundMessage::new(tag, body);
    message.headers.insert("X-Request-ID".into(), format!("req-{tag}"));
    message
}

pub fn reset_message(tag: u64) -> InboundMessage {
    let body =
        br#"{"type":"password_reset","email":"bob@example.com","reset_url":"https://app.test/r?t=xyz"}"#
            .to_vec();
    InboundMessage::new(tag, body)
}
