//! Queue topology for a source binding.
//!
//! Next to every source exchange the service declares seven delayed
//! queues (`<exchange>.dlx.second` … `.day`) whose messages dead-letter
//! back to the source exchange after a fixed TTL, and one failure queue
//! per terminal category (`<exchange>.fail.<kind>`).

use lapin::{
    Channel, ExchangeKind,
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use postrider_common::config::{BindingConfig, ExchangeType};
use postrider_delivery::{DelayBucket, FailureKind};
use tracing::debug;

pub(crate) fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

pub(crate) fn delayed_name(exchange: &str, bucket: DelayBucket) -> String {
    format!("{exchange}.{}", bucket.suffix())
}

pub(crate) fn failure_name(exchange: &str, kind: FailureKind) -> String {
    format!("{exchange}.{}", kind.suffix())
}

/// Arguments for a delayed queue: expire after the bucket's TTL, then
/// dead-letter back into the source exchange under the source queue's
/// routing key.
pub(crate) fn delayed_queue_args(binding: &BindingConfig, bucket: DelayBucket) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(i64::try_from(bucket.ttl().as_millis()).unwrap_or(i64::MAX)),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(binding.exchange.clone().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(binding.queue.clone().into()),
    );
    args
}

/// Declare a source binding together with its delayed and failure siblings.
///
/// Declarations are idempotent; every reconnect runs them again.
///
/// # Errors
///
/// Returns the underlying lapin error when a declaration is refused.
pub async fn declare_topology(
    channel: &Channel,
    binding: &BindingConfig,
) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    channel
        .exchange_declare(
            &binding.exchange,
            exchange_kind(binding.kind),
            durable,
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(&binding.queue, durable_queue, FieldTable::default())
        .await?;
    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    for bucket in DelayBucket::all() {
        let name = delayed_name(&binding.exchange, bucket);
        channel
            .exchange_declare(&name, ExchangeKind::Direct, durable, FieldTable::default())
            .await?;
        channel
            .queue_declare(&name, durable_queue, delayed_queue_args(binding, bucket))
            .await?;
        channel
            .queue_bind(
                &name,
                &name,
                &name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    for kind in FailureKind::all() {
        let name = failure_name(&binding.exchange, kind);
        channel
            .exchange_declare(&name, ExchangeKind::Direct, durable, FieldTable::default())
            .await?;
        channel
            .queue_declare(&name, durable_queue, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                &name,
                &name,
                &name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    debug!(
        exchange = %binding.exchange,
        queue = %binding.queue,
        "declared binding topology"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> BindingConfig {
        BindingConfig {
            exchange: "mail".to_string(),
            queue: "mail.out".to_string(),
            kind: ExchangeType::Direct,
            handlers: 1,
        }
    }

    #[test]
    fn sibling_queue_names() {
        assert_eq!(delayed_name("mail", DelayBucket::Second), "mail.dlx.second");
        assert_eq!(
            delayed_name("mail", DelayBucket::TenMinutes),
            "mail.dlx.ten.minute"
        );
        assert_eq!(delayed_name("mail", DelayBucket::Day), "mail.dlx.day");
        assert_eq!(
            failure_name("mail", FailureKind::OverLimit),
            "mail.fail.overlimit"
        );
        assert_eq!(
            failure_name("mail", FailureKind::UnroutableDomain),
            "mail.fail.unroutable"
        );
    }

    #[test]
    fn delayed_args_dead_letter_into_the_source() {
        let args = delayed_queue_args(&binding(), DelayBucket::Minute);
        let inner = args.inner();

        assert_eq!(
            inner.get("x-message-ttl"),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("mail".into()))
        );
        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("mail.out".into()))
        );
    }

    #[test]
    fn exchange_kinds_map_through() {
        assert_eq!(exchange_kind(ExchangeType::Direct), ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeType::Fanout), ExchangeKind::Fanout);
        assert_eq!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic);
    }
}
