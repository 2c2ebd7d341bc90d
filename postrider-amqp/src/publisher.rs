//! The republisher: rebinds failed messages to their delayed and failure
//! queues over a dedicated broker connection.

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::BasicPublishOptions,
};
use postrider_common::Message;
use postrider_delivery::{DelayBucket, FailureKind, RepublishError, Republisher};
use tracing::{debug, warn};

use crate::binding::{delayed_name, failure_name};
use crate::{AmqpError, declare_topology};

pub struct AmqpRepublisher {
    uri: String,
    /// Fallback source exchange for messages that arrived without one.
    default_exchange: Option<String>,
    state: tokio::sync::Mutex<Option<(Connection, Channel)>>,
}

impl AmqpRepublisher {
    /// Connect to the broker and declare the topology for every binding
    /// so a republish never targets a missing queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker is unreachable or a declaration
    /// is refused.
    pub async fn connect(
        uri: &str,
        bindings: &[postrider_common::config::BindingConfig],
    ) -> Result<Self, AmqpError> {
        let (connection, channel) = open(uri).await?;
        for binding in bindings {
            declare_topology(&channel, binding).await?;
        }
        Ok(Self {
            uri: uri.to_string(),
            default_exchange: bindings.first().map(|binding| binding.exchange.clone()),
            state: tokio::sync::Mutex::new(Some((connection, channel))),
        })
    }

    fn source_exchange(&self, message: &Message) -> Result<String, RepublishError> {
        message
            .binding
            .clone()
            .or_else(|| self.default_exchange.clone())
            .ok_or_else(|| RepublishError("message has no source binding".to_string()))
    }

    async fn publish(&self, target: &str, message: &Message) -> Result<(), RepublishError> {
        let payload = serde_json::to_vec(message)
            .map_err(|error| RepublishError(format!("can't encode message: {error}")))?;

        // Fast path over the held channel; one redial on failure.
        {
            let guard = self.state.lock().await;
            if let Some((_, channel)) = guard.as_ref() {
                if try_publish(channel, target, &payload).await.is_ok() {
                    return Ok(());
                }
            }
        }

        warn!(uri = %self.uri, "republish channel is gone, redialing");
        let (connection, channel) = open(&self.uri)
            .await
            .map_err(|error| RepublishError(error.to_string()))?;
        try_publish(&channel, target, &payload)
            .await
            .map_err(|error| RepublishError(error.to_string()))?;
        *self.state.lock().await = Some((connection, channel));
        Ok(())
    }
}

#[async_trait]
impl Republisher for AmqpRepublisher {
    async fn publish_delayed(
        &self,
        message: &Message,
        bucket: DelayBucket,
    ) -> Result<(), RepublishError> {
        let source = self.source_exchange(message)?;
        let target = delayed_name(&source, bucket);
        debug!(id = message.id, target = %target, "republishing for delayed retry");
        self.publish(&target, message).await
    }

    async fn publish_failure(
        &self,
        message: &Message,
        kind: FailureKind,
    ) -> Result<(), RepublishError> {
        let source = self.source_exchange(message)?;
        let target = failure_name(&source, kind);
        debug!(id = message.id, target = %target, "republishing to failure queue");
        self.publish(&target, message).await
    }
}

async fn open(uri: &str) -> Result<(Connection, Channel), AmqpError> {
    let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    Ok((connection, channel))
}

async fn try_publish(channel: &Channel, target: &str, payload: &[u8]) -> Result<(), lapin::Error> {
    channel
        .basic_publish(
            target,
            target,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await?
        .await?;
    Ok(())
}
