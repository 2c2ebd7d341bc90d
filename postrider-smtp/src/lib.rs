//! Outbound SMTP protocol client for postrider.
//!
//! This crate speaks the client side of RFC 5321 over plain TCP or a
//! STARTTLS-upgraded connection. It knows nothing about pooling, retries
//! or queues; the delivery crate layers those on top.

pub mod client;

pub use client::{ClientError, Response, SmtpClient};
