//! AMQP ingress and egress for postrider.
//!
//! The consumer fleet sources send requests from the configured brokers
//! and performs the terminal acknowledgement; the republisher rebinds
//! failed messages to the delayed and failure queues declared alongside
//! each source binding.

mod binding;
mod consumer;
mod publisher;

pub use binding::declare_topology;
pub use consumer::AmqpService;
pub use publisher::AmqpRepublisher;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error(transparent)]
    Lapin(#[from] lapin::Error),

    #[error("connection to {0} lost")]
    ConnectionLost(String),
}
