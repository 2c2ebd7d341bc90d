//! End-to-end pipeline tests against a mock remote MTA.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use postrider_common::{Config, Domain, Message, SendResult};
use postrider_delivery::{
    DelayBucket, DnsError, FailureKind, MxRecord, MxResolver, Pipeline, RepublishError,
    Republisher,
};
use support::mock_server::MockSmtpServer;

/// Resolves every domain to the mock server; sender domains get a dummy
/// MX so the sender table can be built offline.
struct MockResolver {
    mock_port: u16,
}

#[async_trait]
impl MxResolver for MockResolver {
    async fn lookup_mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, DnsError> {
        match domain.as_str() {
            "a.example" => Ok(vec![MxRecord::new("mx.a.example", 10)]),
            "unroutable.example" => Err(DnsError::NoRecords(domain.clone())),
            _ => {
                let mut record = MxRecord::new("127.0.0.1", 10);
                record.port = self.mock_port;
                Ok(vec![record])
            }
        }
    }
}

/// Records republishes instead of touching a broker.
#[derive(Default)]
struct RecordingRepublisher {
    delayed: Mutex<Vec<(DelayBucket, Message)>>,
    failed: Mutex<Vec<(FailureKind, Message)>>,
}

#[async_trait]
impl Republisher for RecordingRepublisher {
    async fn publish_delayed(
        &self,
        message: &Message,
        bucket: DelayBucket,
    ) -> Result<(), RepublishError> {
        self.delayed.lock().unwrap().push((bucket, message.clone()));
        Ok(())
    }

    async fn publish_failure(
        &self,
        message: &Message,
        kind: FailureKind,
    ) -> Result<(), RepublishError> {
        self.failed.lock().unwrap().push((kind, message.clone()));
        Ok(())
    }
}

fn test_config(yaml: &str) -> Config {
    Config::from_yaml(yaml.as_bytes()).unwrap()
}

fn test_message(id: u64) -> Message {
    Message::new(
        id,
        "sender@a.example",
        "user@b.example",
        "Subject: hello\r\n\r\nhello world\r\n".to_string(),
    )
    .unwrap()
}

async fn build_pipeline(
    yaml: &str,
    mock_port: u16,
) -> (Pipeline, Arc<RecordingRepublisher>) {
    let republisher = Arc::new(RecordingRepublisher::default());
    let pipeline = Pipeline::new(
        &test_config(yaml),
        Arc::clone(&republisher) as Arc<dyn Republisher>,
        Arc::new(MockResolver { mock_port }),
    )
    .await
    .unwrap();
    (pipeline, republisher)
}

const PLAIN_CONFIG: &str = "
workers: 2
timeouts: {sleep_secs: 1, connection_secs: 5, hello_secs: 5, mail_secs: 5, data_secs: 5, quit_secs: 2}
postmans:
  a.example: {}
";

#[tokio::test]
async fn happy_path_delivers_and_acks() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(result, SendResult::Delivered);
    assert!(server.saw_command("MAIL FROM:<sender@a.example>").await);
    assert!(server.saw_command("RCPT TO:<user@b.example>").await);
    assert!(server.saw_command("DATA").await);
    assert!(republisher.delayed.lock().unwrap().is_empty());
    assert!(republisher.failed.lock().unwrap().is_empty());

    pipeline.finish().await;
}

#[tokio::test]
async fn pooled_connection_is_reused_across_messages() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let (pipeline, _) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    for id in 1..=3 {
        let result = pipeline.submit(test_message(id)).await.unwrap().await.unwrap();
        assert_eq!(result, SendResult::Delivered);
    }

    // Sequential sends reuse the single pooled client.
    assert_eq!(server.connection_count(), 1);

    pipeline.finish().await;
}

#[tokio::test]
async fn excluded_recipient_is_revoked_without_network_activity() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = "
workers: 2
postmans:
  a.example:
    exclude: [b.example]
";
    let (pipeline, republisher) = build_pipeline(config, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(result, SendResult::Revoked);
    assert_eq!(server.connection_count(), 0);
    assert!(republisher.failed.lock().unwrap().is_empty());

    pipeline.finish().await;
}

#[tokio::test]
async fn rate_limit_rebinds_the_overflow() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = "
workers: 2
postmans:
  a.example:
    limits:
      b.example: {value: 2, duration: minute}
";
    let (pipeline, republisher) = build_pipeline(config, server.port()).await;

    let mut results = Vec::new();
    for id in 1..=3 {
        results.push(pipeline.submit(test_message(id)).await.unwrap().await.unwrap());
    }

    assert_eq!(
        results
            .iter()
            .filter(|r| **r == SendResult::Delivered)
            .count(),
        2
    );
    assert_eq!(
        results
            .iter()
            .filter(|r| **r == SendResult::OverLimit)
            .count(),
        1
    );

    let failed = republisher.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, FailureKind::OverLimit);
    // Retry count rides along unchanged.
    assert_eq!(failed[0].1.retries, 0);
    drop(failed);

    pipeline.finish().await;
}

#[tokio::test]
async fn permanent_rejection_lands_in_the_invalid_queue() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "No such user")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(result, SendResult::Failed);
    let failed = republisher.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, FailureKind::InvalidRecipient);
    drop(failed);

    // The rejection poisoned nothing: the client went back to the pool
    // Waiting, and the next send reuses the same connection.
    let result = pipeline
        .submit(test_message(2))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, SendResult::Failed);
    assert_eq!(server.connection_count(), 1);

    pipeline.finish().await;
}

#[tokio::test]
async fn content_rejection_is_classified_separately() {
    let server = MockSmtpServer::builder()
        .with_data_end_response(554, "Message refused")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(result, SendResult::Failed);
    assert_eq!(
        republisher.failed.lock().unwrap()[0].0,
        FailureKind::ContentRejected
    );

    pipeline.finish().await;
}

#[tokio::test]
async fn starttls_failure_falls_back_to_plaintext() {
    let server = MockSmtpServer::builder()
        .with_starttls_response(454, "TLS not available due to temporary reason")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    // One probe, one QUIT, then a plaintext redial on a fresh connection.
    assert_eq!(result, SendResult::Delivered);
    assert_eq!(server.command_count("STARTTLS").await, 1);
    assert_eq!(server.command_count("QUIT").await, 1);
    assert_eq!(server.connection_count(), 2);
    assert!(republisher.delayed.lock().unwrap().is_empty());

    // The latch holds: the next send reuses the plaintext client and the
    // still-advertised extension is never probed again.
    let result = pipeline
        .submit(test_message(2))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, SendResult::Delivered);
    assert_eq!(server.command_count("STARTTLS").await, 1);
    assert_eq!(server.connection_count(), 2);

    pipeline.finish().await;
}

#[tokio::test]
async fn pool_saturation_respects_the_learned_capacity() {
    let server = MockSmtpServer::builder()
        .with_connection_limit(2)
        .with_data_end_delay(Duration::from_millis(200))
        .build()
        .await
        .unwrap();
    let config = "
workers: 4
timeouts: {sleep_secs: 1, connection_secs: 5, hello_secs: 5, mail_secs: 5, data_secs: 5, quit_secs: 2}
postmans:
  a.example: {}
";
    let (pipeline, republisher) = build_pipeline(config, server.port()).await;

    let mut receivers = Vec::new();
    for id in 1..=4 {
        receivers.push(pipeline.submit(test_message(id)).await.unwrap());
    }
    for receiver in receivers {
        assert_eq!(receiver.await.unwrap(), SendResult::Delivered);
    }

    // The remote admits two concurrent sessions. Rejected dials latch the
    // queue capacity; the overflow waits for a pooled client instead of
    // opening more connections.
    assert!(server.max_active_connections() <= 2);
    assert!(server.connection_count() <= 2);
    assert!(republisher.delayed.lock().unwrap().is_empty());
    assert!(republisher.failed.lock().unwrap().is_empty());

    pipeline.finish().await;
}

#[tokio::test]
async fn transient_rejection_is_delayed_with_escalated_retry() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "Try again later")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(result, SendResult::Delayed);
    let delayed = republisher.delayed.lock().unwrap();
    assert_eq!(delayed.len(), 1);
    // First failure rebinds to the second-bucket, with the count bumped.
    assert_eq!(delayed[0].0, DelayBucket::Second);
    assert_eq!(delayed[0].1.retries, 1);
    drop(delayed);

    pipeline.finish().await;
}

#[tokio::test]
async fn second_retry_escalates_the_delay_bucket() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "Try again later")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let mut message = test_message(1);
    message.retries = 1;
    let result = pipeline.submit(message).await.unwrap().await.unwrap();

    assert_eq!(result, SendResult::Delayed);
    let delayed = republisher.delayed.lock().unwrap();
    assert_eq!(delayed[0].0, DelayBucket::Minute);
    assert_eq!(delayed[0].1.retries, 2);
    drop(delayed);

    pipeline.finish().await;
}

#[tokio::test]
async fn unroutable_domain_fails_with_code_511_path() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let mut message = test_message(1);
    message.hostname_to = Domain::new("unroutable.example");
    message.recipient = "user@unroutable.example".to_string();

    let result = pipeline.submit(message).await.unwrap().await.unwrap();

    assert_eq!(result, SendResult::Failed);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(
        republisher.failed.lock().unwrap()[0].0,
        FailureKind::UnroutableDomain
    );

    pipeline.finish().await;
}

#[tokio::test]
async fn exhausted_retry_budget_lands_in_the_disconnected_queue() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "Try again later")
        .build()
        .await
        .unwrap();
    let (pipeline, republisher) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let mut message = test_message(1);
    message.retries = postrider_delivery::MAX_SEND_ATTEMPTS;
    let result = pipeline.submit(message).await.unwrap().await.unwrap();

    assert_eq!(result, SendResult::Failed);
    assert_eq!(
        republisher.failed.lock().unwrap()[0].0,
        FailureKind::Disconnected
    );

    pipeline.finish().await;
}

#[tokio::test]
async fn finished_pipeline_rejects_new_submissions() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let (pipeline, _) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    pipeline.finish().await;
    assert!(pipeline.submit(test_message(1)).await.is_err());
}

#[tokio::test]
async fn missing_dkim_key_still_delivers_unsigned() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let (pipeline, _) = build_pipeline(PLAIN_CONFIG, server.port()).await;

    let result = pipeline
        .submit(test_message(1))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, SendResult::Delivered);

    pipeline.finish().await;
}
