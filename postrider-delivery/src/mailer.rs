//! The mailer: DKIM-sign the message, run the SMTP transaction, classify
//! the outcome and return the client to its pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use postrider_common::{Message, SendEnvelope, SendResult};
use postrider_smtp::{Response, SmtpClient};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connector::pool::{LimitQueue, MxServer, PooledClient};
use crate::error::{DeliveryError, classify_reply};
use crate::pipeline::Shared;
use crate::recovery;
use crate::sender::SenderRuntime;

/// An envelope with a live SMTP client attached by a connector.
pub(crate) struct MailerEvent {
    pub envelope: SendEnvelope,
    pub client: PooledClient,
    pub queue: Arc<LimitQueue>,
    pub mx: Arc<MxServer>,
}

pub(crate) async fn deliver(shared: &Shared, worker_id: usize, event: MailerEvent) {
    let MailerEvent {
        envelope,
        mut client,
        queue,
        mx,
    } = event;

    let message = &envelope.message;
    info!(
        hostname = %message.hostname_from,
        id = message.id,
        mx = %mx.hostname,
        client = client.id,
        "mailer#{worker_id} sends mail"
    );

    let sender = shared.senders.get(&message.hostname_from).map(Arc::as_ref);
    let body = prepare_body(sender, message);

    match transaction(shared, &mut client.client, message, &body).await {
        Ok(()) => {
            debug!(
                hostname = %message.hostname_from,
                id = message.id,
                "delivery success"
            );
            // Return the client before resolving the sink so a follow-up
            // send finds it pooled rather than dialing a sibling.
            park(shared, client, &queue).await;
            envelope.complete(SendResult::Delivered);
        }
        Err(error) if error.is_transport() => {
            warn!(
                hostname = %message.hostname_from,
                id = message.id,
                mx = %mx.hostname,
                error = %error,
                "connection failed mid-transaction"
            );
            // The next connector pop discards a Disconnected client.
            client.disconnect();
            queue.push(client);
            recovery::return_mail(shared, envelope, &error).await;
        }
        Err(error) => {
            // The remote rejected the transaction, but the connection
            // itself is healthy.
            park(shared, client, &queue).await;
            recovery::return_mail(shared, envelope, &error).await;
        }
    }
}

/// Reset the transaction state and return the client to its queue, or mark
/// it dead when even RSET fails.
async fn park(shared: &Shared, mut client: PooledClient, queue: &LimitQueue) {
    match timeout(shared.timeouts.mail(), client.client.rset()).await {
        Ok(Ok(reply)) if reply.is_success() => client.park(),
        _ => client.disconnect(),
    }
    queue.push(client);
}

async fn transaction(
    shared: &Shared,
    client: &mut SmtpClient,
    message: &Message,
    body: &str,
) -> Result<(), DeliveryError> {
    let reply = run(
        shared.timeouts.mail(),
        "MAIL FROM",
        client.mail_from(&message.envelope_from),
    )
    .await?;
    if !reply.is_success() {
        return Err(classify_reply("MAIL FROM", &reply));
    }

    let reply = run(
        shared.timeouts.mail(),
        "RCPT TO",
        client.rcpt_to(&message.recipient),
    )
    .await?;
    if !reply.is_success() {
        return Err(classify_reply("RCPT TO", &reply));
    }

    let reply = run(shared.timeouts.data(), "DATA", client.data()).await?;
    if !(300..400).contains(&reply.code) {
        return Err(classify_reply("DATA", &reply));
    }

    let reply = run(shared.timeouts.data(), "message body", client.send_data(body)).await?;
    if !reply.is_success() {
        return Err(classify_reply("message body", &reply));
    }

    Ok(())
}

async fn run(
    limit: Duration,
    command: &str,
    operation: impl Future<Output = postrider_smtp::client::Result<Response>>,
) -> Result<Response, DeliveryError> {
    match timeout(limit, operation).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(error)) => Err(DeliveryError::Transport(format!("{command} failed: {error}"))),
        Err(_) => Err(DeliveryError::Transport(format!("{command} timed out"))),
    }
}

/// Inject `Message-ID` and `Date` when absent, then prepend the DKIM
/// signature over the final header set.
fn prepare_body(sender: Option<&SenderRuntime>, message: &Message) -> String {
    let mut body = ensure_headers(message);
    if let Some(sealer) = sender.and_then(|s| s.dkim.as_ref()) {
        if let Some(header) = sealer.seal(&body) {
            body.insert_str(0, &header);
        }
    }
    body
}

fn ensure_headers(message: &Message) -> String {
    let body = &message.body;
    let head_end = body
        .find("\r\n\r\n")
        .or_else(|| body.find("\n\n"))
        .unwrap_or(body.len());
    let head = &body[..head_end];

    let mut injected = String::new();
    if !has_header(head, "Message-ID") {
        injected.push_str(&format!(
            "Message-ID: <{}@{}>\r\n",
            message.id, message.hostname_from
        ));
    }
    if !has_header(head, "Date") {
        let date = chrono::DateTime::from_timestamp(
            i64::try_from(message.created_at).unwrap_or_default(),
            0,
        )
        .unwrap_or_default();
        injected.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
    }

    if injected.is_empty() {
        body.clone()
    } else {
        format!("{injected}{body}")
    }
}

fn has_header(head: &str, name: &str) -> bool {
    head.lines().any(|line| {
        line.get(..name.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(name))
            && line.as_bytes().get(name.len()) == Some(&b':')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_body(body: &str) -> Message {
        let mut message =
            Message::new(42, "a@a.example", "b@b.example", body.to_string()).unwrap();
        message.created_at = 1_700_000_000;
        message
    }

    #[test]
    fn injects_missing_message_id_and_date() {
        let message = message_with_body("Subject: hi\r\n\r\nbody");
        let body = ensure_headers(&message);
        assert!(body.starts_with("Message-ID: <42@a.example>\r\n"));
        assert!(body.contains("Date: "));
        assert!(body.ends_with("Subject: hi\r\n\r\nbody"));
    }

    #[test]
    fn injection_is_deterministic() {
        let message = message_with_body("Subject: hi\r\n\r\nbody");
        assert_eq!(ensure_headers(&message), ensure_headers(&message));
    }

    #[test]
    fn present_headers_are_left_alone() {
        let message = message_with_body(
            "Message-ID: <given@a.example>\r\nDate: Tue, 14 Nov 2023 22:13:20 +0000\r\n\r\nbody",
        );
        assert_eq!(ensure_headers(&message), message.body);
    }

    #[test]
    fn header_match_is_case_insensitive() {
        assert!(has_header("message-id: <x>", "Message-ID"));
        assert!(has_header("DATE: now", "Date"));
        assert!(!has_header("Dated: now", "Date"));
        assert!(!has_header("X-Message-ID-ish: no", "Message-ID"));
    }
}
