//! The wire representation of an outbound mail.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::domain::Domain;

/// An outbound mail as carried on the AMQP queues.
///
/// The `retries` counter survives republishes to the delayed queues; the
/// recovery path uses it to pick an escalating delay bucket. `binding`
/// names the source exchange a consumed message arrived through, so a
/// republish lands next to the queue it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    /// Envelope sender address (`MAIL FROM`).
    pub envelope_from: String,
    /// The sender identity; keys the per-sender configuration.
    pub hostname_from: Domain,
    /// Recipient address (`RCPT TO`).
    pub recipient: String,
    /// Recipient domain; keys MX discovery, limits and exclusions.
    pub hostname_to: Domain,
    /// Raw RFC 5322 message.
    pub body: String,
    #[serde(default = "unix_now")]
    pub created_at: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

impl Message {
    /// Build a message from bare addresses, deriving the envelope domains.
    ///
    /// Returns `None` when either address has no domain part.
    #[must_use]
    pub fn new(id: u64, envelope_from: &str, recipient: &str, body: String) -> Option<Self> {
        let hostname_from = Domain::new(domain_of(envelope_from)?);
        let hostname_to = Domain::new(domain_of(recipient)?);
        Some(Self {
            id,
            envelope_from: envelope_from.to_string(),
            hostname_from,
            recipient: recipient.to_string(),
            hostname_to,
            body,
            created_at: unix_now(),
            retries: 0,
            binding: None,
        })
    }
}

/// Current wall-clock time as Unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extract the domain part of an email address.
#[must_use]
pub fn domain_of(email: &str) -> Option<&str> {
    let cleaned = email.trim().trim_matches(|c| c == '<' || c == '>');
    cleaned
        .split('@')
        .nth(1)
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
}
