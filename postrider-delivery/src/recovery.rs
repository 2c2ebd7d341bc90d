//! The recovery path: classify a failed delivery and rebind the message
//! to a delayed-retry or failure queue.
//!
//! Errors never travel back up the pipeline. Whatever stage a failure
//! happens in calls [`return_mail`], which republishes and resolves the
//! envelope's result sink; the AMQP consumer then acks the source delivery
//! (the republish is durable, so the broker remains the persistence layer).

use std::time::Duration;

use async_trait::async_trait;
use postrider_common::{Message, SendEnvelope, SendResult, unix_now};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::DeliveryError;
use crate::pipeline::Shared;

/// Give up on a message after this many delayed retries.
pub const MAX_SEND_ATTEMPTS: u32 = 25;

/// The delayed-retry queues, escalating with the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayBucket {
    Second,
    Minute,
    TenMinutes,
    ThirtyMinutes,
    Hour,
    SixHours,
    Day,
}

impl DelayBucket {
    /// The backoff escalator: seconds, then minutes, then hours, then a day.
    #[must_use]
    pub const fn for_retry(retries: u32) -> Self {
        match retries {
            0 => Self::Second,
            1 => Self::Minute,
            2 => Self::TenMinutes,
            3 => Self::ThirtyMinutes,
            4 => Self::Hour,
            5 => Self::SixHours,
            _ => Self::Day,
        }
    }

    /// Message TTL in the delayed queue before it dead-letters back.
    #[must_use]
    pub const fn ttl(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::TenMinutes => Duration::from_secs(10 * 60),
            Self::ThirtyMinutes => Duration::from_secs(30 * 60),
            Self::Hour => Duration::from_secs(60 * 60),
            Self::SixHours => Duration::from_secs(6 * 60 * 60),
            Self::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Queue-name suffix under the source exchange.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Second => "dlx.second",
            Self::Minute => "dlx.minute",
            Self::TenMinutes => "dlx.ten.minute",
            Self::ThirtyMinutes => "dlx.thirty.minute",
            Self::Hour => "dlx.hour",
            Self::SixHours => "dlx.six.hours",
            Self::Day => "dlx.day",
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 7] {
        [
            Self::Second,
            Self::Minute,
            Self::TenMinutes,
            Self::ThirtyMinutes,
            Self::Hour,
            Self::SixHours,
            Self::Day,
        ]
    }
}

/// The terminal failure queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate window exhausted.
    OverLimit,
    /// 550/551/553: the mailbox does not exist.
    InvalidRecipient,
    /// 552/554 and remaining 5xx: the message itself was refused.
    ContentRejected,
    /// MX discovery failed.
    UnroutableDomain,
    /// Transport kept failing until the retry budget ran out.
    Disconnected,
}

impl FailureKind {
    #[must_use]
    pub const fn for_code(code: u16) -> Self {
        match code {
            550 | 551 | 553 => Self::InvalidRecipient,
            _ => Self::ContentRejected,
        }
    }

    /// Queue-name suffix under the source exchange.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::OverLimit => "fail.overlimit",
            Self::InvalidRecipient => "fail.invalid",
            Self::ContentRejected => "fail.content",
            Self::UnroutableDomain => "fail.unroutable",
            Self::Disconnected => "fail.disconnected",
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::OverLimit,
            Self::InvalidRecipient,
            Self::ContentRejected,
            Self::UnroutableDomain,
            Self::Disconnected,
        ]
    }
}

#[derive(Debug, Error)]
#[error("republish failed: {0}")]
pub struct RepublishError(pub String);

/// Rebinds messages to their delayed and failure queues. Implemented by
/// the AMQP layer; tests substitute a recorder.
#[async_trait]
pub trait Republisher: Send + Sync {
    async fn publish_delayed(
        &self,
        message: &Message,
        bucket: DelayBucket,
    ) -> Result<(), RepublishError>;

    async fn publish_failure(
        &self,
        message: &Message,
        kind: FailureKind,
    ) -> Result<(), RepublishError>;
}

/// Route a failed envelope per the error taxonomy.
pub(crate) async fn return_mail(shared: &Shared, envelope: SendEnvelope, error: &DeliveryError) {
    match error {
        DeliveryError::Permanent { code, .. } => {
            fail(shared, envelope, FailureKind::for_code(*code), SendResult::Failed).await;
        }
        DeliveryError::Unroutable(_) => {
            fail(
                shared,
                envelope,
                FailureKind::UnroutableDomain,
                SendResult::Failed,
            )
            .await;
        }
        DeliveryError::Temporary { .. } | DeliveryError::Transport(_) => {
            if envelope.message.retries >= MAX_SEND_ATTEMPTS {
                fail(shared, envelope, FailureKind::Disconnected, SendResult::Failed).await;
            } else {
                delay(shared, envelope, error).await;
            }
        }
        DeliveryError::Config(_) => {
            fail(shared, envelope, FailureKind::Disconnected, SendResult::Failed).await;
        }
    }
}

async fn delay(shared: &Shared, envelope: SendEnvelope, error: &DeliveryError) {
    let mut message = envelope.message.clone();
    let bucket = DelayBucket::for_retry(message.retries);
    message.retries += 1;
    message.created_at = unix_now();

    debug!(
        hostname = %message.hostname_from,
        id = message.id,
        retries = message.retries,
        bucket = bucket.suffix(),
        error = %error,
        "rebinding mail for delayed retry"
    );

    match shared.republisher.publish_delayed(&message, bucket).await {
        Ok(()) => envelope.complete(SendResult::Delayed),
        Err(publish_error) => {
            error!(
                hostname = %message.hostname_from,
                id = message.id,
                error = %publish_error,
                "can't republish to delayed queue"
            );
            envelope.complete(SendResult::Failed);
        }
    }
}

/// Republish to a failure queue, retry count preserved, and resolve the
/// sink with `result`.
pub(crate) async fn fail(
    shared: &Shared,
    envelope: SendEnvelope,
    kind: FailureKind,
    result: SendResult,
) {
    let message = &envelope.message;
    debug!(
        hostname = %message.hostname_from,
        id = message.id,
        queue = kind.suffix(),
        "rebinding mail to failure queue"
    );

    if let Err(publish_error) = shared.republisher.publish_failure(message, kind).await {
        error!(
            hostname = %message.hostname_from,
            id = message.id,
            error = %publish_error,
            "can't republish to failure queue"
        );
    }
    envelope.complete(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_buckets_escalate_with_retries() {
        assert_eq!(DelayBucket::for_retry(0), DelayBucket::Second);
        assert_eq!(DelayBucket::for_retry(1), DelayBucket::Minute);
        assert_eq!(DelayBucket::for_retry(2), DelayBucket::TenMinutes);
        assert_eq!(DelayBucket::for_retry(3), DelayBucket::ThirtyMinutes);
        assert_eq!(DelayBucket::for_retry(4), DelayBucket::Hour);
        assert_eq!(DelayBucket::for_retry(5), DelayBucket::SixHours);
        assert_eq!(DelayBucket::for_retry(6), DelayBucket::Day);
        assert_eq!(DelayBucket::for_retry(100), DelayBucket::Day);
    }

    #[test]
    fn failure_kind_by_reply_code() {
        assert_eq!(FailureKind::for_code(550), FailureKind::InvalidRecipient);
        assert_eq!(FailureKind::for_code(551), FailureKind::InvalidRecipient);
        assert_eq!(FailureKind::for_code(553), FailureKind::InvalidRecipient);
        assert_eq!(FailureKind::for_code(552), FailureKind::ContentRejected);
        assert_eq!(FailureKind::for_code(554), FailureKind::ContentRejected);
        assert_eq!(FailureKind::for_code(571), FailureKind::ContentRejected);
    }

    #[test]
    fn ttls_match_bucket_names() {
        assert_eq!(DelayBucket::Second.ttl(), Duration::from_secs(1));
        assert_eq!(DelayBucket::TenMinutes.ttl(), Duration::from_secs(600));
        assert_eq!(DelayBucket::Day.ttl(), Duration::from_secs(86400));
        assert_eq!(DelayBucket::all().len(), 7);
        assert_eq!(FailureKind::all().len(), 5);
    }
}
