//! Dead-letter publishing
//!
//! Poisoned messages keep their original body and headers and gain two
//! annotations: why they failed and when. If the dead-letter write itself
//! fails the caller must NACK with requeue; losing the message is not an
//! option.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::message::InboundMessage;

pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";
pub const FAILED_AT_HEADER: &str = "x-failed-at";

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dead-letter declare failed: {0}")]
    Declare(String),
    #[error("dead-letter publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait DlqPublisher: Send + Sync {
    /// Idempotent; must run before the first `publish`.
    async fn declare(&self) -> Result<(), DlqError>;

    /// Persist a copy of `message` with failure annotations.
    async fn publish(&self, message: &InboundMessage, reason: &str) -> Result<(), DlqError>;
}

/// Original headers plus `x-failure-reason` and `x-failed-at` (Unix seconds
/// as a string). Existing annotations from earlier trips are overwritten.
pub fn annotated_headers(message: &InboundMessage, reason: &str) -> HashMap<String, String> {
    let mut headers = message.headers.clone();
    headers.insert(FAILURE_REASON_HEADER.to_string(), reason.to_string());
    let failed_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    headers.insert(FAILED_AT_HEADER.to_string(), failed_at.to_string());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_added_and_originals_kept() {
        let mut message = InboundMessage::new(4, b"body".to_vec());
        message.headers.insert("X-Request-ID".into(), "req-4".into());

        let headers = annotated_headers(&message, "email provider error: down");

        assert_eq!(headers.get("X-Request-ID").map(String::as_str), Some("req-4"));
        assert_eq!(
            headers.get(FAILURE_REASON_HEADER).map(String::as_str),
            Some("email provider error: down")
        );
        let failed_at: u64 = headers.get(FAILED_AT_HEADER).unwrap().parse().unwrap();
        assert!(failed_at > 1_600_000_000, "must be a plausible unix timestamp");
    }

    #[test]
    fn stale_annotations_are_overwritten() {
        let mut message = InboundMessage::new(4, b"body".to_vec());
        message.headers.insert(FAILURE_REASON_HEADER.into(), "old reason".into());
        message.headers.insert(FAILED_AT_HEADER.into(), "0".into());

        let headers = annotated_headers(&message, "new reason");
        assert_eq!(headers.get(FAILURE_REASON_HEADER).map(String::as_str), Some("new reason"));
        assert_ne!(headers.get(FAILED_AT_HEADER).map(String::as_str), Some("0"));
    }
}
