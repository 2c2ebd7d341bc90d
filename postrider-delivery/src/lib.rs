//! The postrider delivery pipeline.
//!
//! A message consumed from an AMQP queue traverses five stages on its way
//! to the remote MTA:
//!
//! 1. **Guardian** drops sends whose recipient domain the sender excludes.
//! 2. **Limiter** enforces per-(sender, recipient-domain) rate windows.
//! 3. **Connector** resolves MX servers and acquires a pooled, optionally
//!    STARTTLS-upgraded, SMTP connection.
//! 4. **Mailer** signs with DKIM and runs the SMTP transaction.
//! 5. The submitter acks or the recovery path has already rebound the
//!    message to a delayed or failure queue.

#![deny(clippy::all)]
#![allow(clippy::must_use_candidate)]

pub mod connector;
mod dkim;
pub mod error;
mod guardian;
mod limiter;
mod mailer;
pub mod pipeline;
pub mod recovery;
mod sender;

pub use connector::resolver::{DnsError, HickoryMxResolver, MxRecord, MxResolver};
pub use error::DeliveryError;
pub use pipeline::{Pipeline, PipelineClosed};
pub use recovery::{
    DelayBucket, FailureKind, MAX_SEND_ATTEMPTS, RepublishError, Republisher,
};
