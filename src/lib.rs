#![forbid(unsafe_code)]

//! # Courier
//!
//! Asynchronous email delivery worker. Upstream services publish events
//! ("verify this email", "send a password reset") to a message broker;
//! this worker consumes them, renders HTML, and dispatches through a
//! pluggable outbound provider. Upstream never blocks on mail.
//!
//! The core is the reliable pipeline between broker and provider:
//!
//! - at-least-once consumption without user-visible duplicates
//!   ([`idempotency`])
//! - bounded retry with capped exponential backoff ([`retry`])
//! - provider isolation behind a circuit breaker ([`circuit_breaker`])
//! - per-recipient rate limiting ([`rate_limit`])
//! - bounded concurrency with clean drain ([`worker_pool`])
//! - dead-lettering with failure annotations ([`dlq`])
//!
//! [`consumer::Consumer`] composes all of it around every delivery and
//! guarantees exactly one ACK or NACK per message under every failure
//! branch. The AMQP transport ([`amqp`]) and the Redis-backed stores
//! ([`kv`]) are thin adapters behind traits, so the pipeline runs against
//! in-memory doubles in tests.

pub mod amqp;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod kv;
pub mod message;
pub mod metrics;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod sanitize;
pub mod sender;
pub mod telemetry;
pub mod templates;
pub mod worker_pool;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, MonotonicClock,
};
pub use config::{ProviderKind, Settings};
pub use consumer::{AckError, Acker, Consumer};
pub use dlq::{DlqError, DlqPublisher};
pub use error::WorkerError;
pub use handler::MessageHandler;
pub use idempotency::IdempotencyStore;
pub use kv::{InMemoryKv, KeyValue, KvError, RedisKv};
pub use message::{InboundMessage, MessageKind, TypedPayload, MAX_BODY_BYTES};
pub use metrics::Metrics;
pub use provider::{EmailProvider, Envelope, HttpProvider, LogProvider, ProviderError};
pub use rate_limit::RateLimiter;
pub use retry::{InstantSleeper, RetryConfig, RetryError, Sleeper, TokioSleeper, TrackingSleeper};
pub use sender::EmailSender;
pub use worker_pool::WorkerPool;
