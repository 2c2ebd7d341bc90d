//! Shared types for the postrider delivery service.
//!
//! Everything that crosses a crate boundary lives here: the [`Domain`]
//! newtype, the wire [`Message`], the in-flight [`SendEnvelope`] with its
//! single-shot result sink, and the YAML configuration model.

pub mod config;
pub mod domain;
pub mod envelope;
pub mod message;

pub use config::Config;
pub use domain::Domain;
pub use envelope::{SendEnvelope, SendResult};
pub use message::{Message, unix_now};
