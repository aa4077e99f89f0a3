//! Per-recipient send limits
//!
//! A counter per key with the window as its TTL. Limiting is advisory, not a
//! correctness property, so a store outage fails open: better to send a few
//! extra emails than none.

use std::sync::Arc;
use std::time::Duration;

use crate::error::WorkerError;
use crate::kv::KeyValue;

const KEY_PREFIX: &str = "ratelimit:email:";

#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KeyValue>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    /// Count one hit for `key`. Errors with `invalid_input` once the counter
    /// exceeds `max` within the window.
    pub async fn check(&self, key: &str, max: u32, window: Duration) -> Result<(), WorkerError> {
        let counter_key = format!("{KEY_PREFIX}{key}");
        let count = match self.kv.incr(&counter_key).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "rate limit store unavailable, failing open");
                return Ok(());
            }
        };

        if count == 1 {
            if let Err(e) = self.kv.expire(&counter_key, window).await {
                tracing::warn!(error = %e, "failed to set rate limit window");
            }
        }

        if count > i64::from(max) {
            return Err(WorkerError::InvalidInput(format!(
                "rate limit exceeded for {key}: {count} sends in window (max {max})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{InMemoryKv, KvError};
    use async_trait::async_trait;

    struct BrokenKv;

    #[async_trait]
    impl KeyValue for BrokenKv {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn incr(&self, _: &str) -> Result<i64, KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn ping(&self) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKv::new()));
        for _ in 0..5 {
            limiter.check("alice@example.com", 5, Duration::from_secs(3600)).await.unwrap();
        }
        let err = limiter
            .check("alice@example.com", 5, Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKv::new()));
        for _ in 0..3 {
            limiter.check("a@example.com", 3, Duration::from_secs(3600)).await.unwrap();
        }
        limiter.check("b@example.com", 3, Duration::from_secs(3600)).await.unwrap();
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let limiter = RateLimiter::new(Arc::new(InMemoryKv::new()));
        limiter.check("c@example.com", 1, Duration::from_millis(10)).await.unwrap();
        assert!(limiter.check("c@example.com", 1, Duration::from_millis(10)).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.check("c@example.com", 1, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenKv));
        for _ in 0..10 {
            limiter.check("d@example.com", 1, Duration::from_secs(3600)).await.unwrap();
        }
    }
}
