//! Typed error handling for delivery operations.
//!
//! The recovery path branches on these categories: permanent failures land
//! in a failure queue, temporary and transport failures in a delayed-retry
//! queue, and lookup failures in the unroutable-domain failure queue.

use postrider_common::Domain;
use postrider_smtp::{ClientError, Response};
use thiserror::Error;

/// What went wrong with one delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// 5xx reply; the remote rejected the transaction for good.
    #[error("permanent failure: {code} {message}")]
    Permanent { code: u16, message: String },

    /// 4xx reply; worth retrying after a delay.
    #[error("temporary failure: {code} {message}")]
    Temporary { code: u16, message: String },

    /// Dial, TLS, I/O or protocol-parse failure below the reply layer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// MX discovery failed; the recipient domain is unroutable.
    #[error("511 can't look up mail servers for {0}")]
    Unroutable(Domain),

    /// Invalid configuration; fatal at init.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// Transport failures poison the connection; reply-coded failures
    /// leave it usable.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Classify a non-success reply to `command`.
///
/// Codes outside 4xx/5xx on a failure path mean the remote is talking
/// nonsense; that is a transport failure.
#[must_use]
pub fn classify_reply(command: &str, reply: &Response) -> DeliveryError {
    let message = format!("{command} rejected: {}", reply.message());
    if reply.is_temporary_error() {
        DeliveryError::Temporary {
            code: reply.code,
            message,
        }
    } else if reply.is_permanent_error() {
        DeliveryError::Permanent {
            code: reply.code,
            message,
        }
    } else {
        DeliveryError::Transport(format!("unexpected reply to {command}: {}", reply.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_temporary() {
        let error = classify_reply("MAIL FROM", &Response::new(451, vec!["try later".into()]));
        assert!(matches!(error, DeliveryError::Temporary { code: 451, .. }));
        assert!(!error.is_permanent());
        assert!(!error.is_transport());
    }

    #[test]
    fn classify_permanent() {
        let error = classify_reply("RCPT TO", &Response::new(550, vec!["no such user".into()]));
        assert!(matches!(error, DeliveryError::Permanent { code: 550, .. }));
        assert!(error.is_permanent());
    }

    #[test]
    fn classify_nonsense_code_as_transport() {
        let error = classify_reply("DATA", &Response::new(999, vec![]));
        assert!(error.is_transport());
    }

    #[test]
    fn client_error_becomes_transport() {
        let error: DeliveryError = ClientError::ConnectionClosed.into();
        assert!(error.is_transport());
    }
}
