//! Idempotent processing markers
//!
//! At-least-once delivery means redeliveries are normal; the store turns them
//! into no-ops. The claim must be atomic: the first concurrent caller for a
//! fingerprint creates the marker, everyone else observes a duplicate.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::kv::{KeyValue, KvError};

const KEY_PREFIX: &str = "email:processed:";

/// Outlives any broker redelivery window.
pub const PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct IdempotencyStore {
    kv: Arc<dyn KeyValue>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv, ttl: PROCESSED_TTL }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Atomically claim a fingerprint. Returns `true` when it was already
    /// claimed (duplicate delivery). A backend error means the caller must
    /// not proceed: sending risks a duplicate, acknowledging risks loss.
    pub async fn check_and_mark(&self, fingerprint: &str) -> Result<bool, KvError> {
        let key = format!("{KEY_PREFIX}{fingerprint}");
        let claimed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let created = self.kv.set_if_absent(&key, &claimed_at.to_string(), self.ttl).await?;
        Ok(!created)
    }

    /// Read-only probe for diagnostics; not on the hot path.
    pub async fn is_processed(&self, fingerprint: &str) -> Result<bool, KvError> {
        self.kv.exists(&format!("{KEY_PREFIX}{fingerprint}")).await
    }
}
