//! The consumer fleet: one connection per broker, `handlers` delivery
//! handlers per binding, and a redial loop on unexpected close.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use futures_util::StreamExt;
use lapin::{
    Connection, ConnectionProperties,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    types::FieldTable,
};
use postrider_common::config::ConsumerConfig;
use postrider_common::{Message, SendResult};
use postrider_delivery::Pipeline;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::AmqpError;
use crate::binding::declare_topology;

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// The running ingress: broker loops that survive connection loss until
/// [`AmqpService::finish`].
pub struct AmqpService {
    finishing: Arc<AtomicBool>,
    brokers: Vec<JoinHandle<()>>,
}

impl AmqpService {
    /// Start one broker loop per configured consumer.
    #[must_use]
    pub fn start(consumers: Vec<ConsumerConfig>, pipeline: Arc<Pipeline>) -> Self {
        let finishing = Arc::new(AtomicBool::new(false));
        let brokers = consumers
            .into_iter()
            .map(|config| {
                tokio::spawn(broker_loop(
                    config,
                    Arc::clone(&pipeline),
                    Arc::clone(&finishing),
                ))
            })
            .collect();
        Self { finishing, brokers }
    }

    /// Stop consuming. Handlers finish their in-flight envelope; the
    /// broker connections are closed.
    pub async fn finish(self) {
        self.finishing.store(true, Ordering::SeqCst);
        for broker in self.brokers {
            let _ = broker.await;
        }
    }
}

async fn broker_loop(config: ConsumerConfig, pipeline: Arc<Pipeline>, finishing: Arc<AtomicBool>) {
    while !finishing.load(Ordering::SeqCst) {
        match run_broker(&config, &pipeline, &finishing).await {
            Ok(()) => break,
            Err(error) => {
                warn!(uri = %config.uri, error = %error, "consumer connection failed, restarting");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
    debug!(uri = %config.uri, "consumer loop stopped");
}

/// One connection lifetime: declare the topology, start the handlers,
/// then watch for finish or connection loss.
async fn run_broker(
    config: &ConsumerConfig,
    pipeline: &Arc<Pipeline>,
    finishing: &Arc<AtomicBool>,
) -> Result<(), AmqpError> {
    let connection = Connection::connect(&config.uri, ConnectionProperties::default()).await?;
    let declare_channel = connection.create_channel().await?;
    for binding in &config.bindings {
        declare_topology(&declare_channel, binding).await?;
    }

    let mut handlers = Vec::new();
    let mut handler_id = 0;
    for binding in &config.bindings {
        for _ in 0..binding.handlers.max(1) {
            handler_id += 1;
            let channel = connection.create_channel().await?;
            channel.basic_qos(1, BasicQosOptions::default()).await?;
            let consumer = channel
                .basic_consume(
                    &binding.queue,
                    &format!("postrider.{}.{handler_id}", binding.queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            handlers.push(tokio::spawn(handle_deliveries(
                consumer,
                binding.exchange.clone(),
                Arc::clone(pipeline),
                Arc::clone(finishing),
            )));
        }
    }

    info!(uri = %config.uri, handlers = handlers.len(), "consumers running");

    loop {
        if finishing.load(Ordering::SeqCst) {
            let _ = connection.close(200, "finishing").await;
            for handler in handlers {
                let _ = handler.await;
            }
            return Ok(());
        }
        if !connection.status().connected() {
            for handler in handlers {
                let _ = handler.await;
            }
            return Err(AmqpError::ConnectionLost(config.uri.clone()));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn handle_deliveries(
    mut consumer: lapin::Consumer,
    exchange: String,
    pipeline: Arc<Pipeline>,
    finishing: Arc<AtomicBool>,
) {
    while let Some(next) = consumer.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(error) => {
                warn!(error = %error, "consumer stream error");
                break;
            }
        };
        process_delivery(delivery, &exchange, &pipeline).await;
        if finishing.load(Ordering::SeqCst) {
            break;
        }
    }
}

async fn process_delivery(delivery: Delivery, exchange: &str, pipeline: &Pipeline) {
    let mut message: Message = match serde_json::from_slice(&delivery.data) {
        Ok(message) => message,
        Err(decode_error) => {
            error!(error = %decode_error, "can't decode send request, dropping");
            let _ = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await;
            return;
        }
    };
    message.binding = Some(exchange.to_string());

    match pipeline.submit(message).await {
        Ok(receiver) => {
            let result = receiver.await.unwrap_or(SendResult::Failed);
            debug!(?result, "send request finished");
            // The recovery path already rebound non-delivered mail to a
            // durable queue; acking drops it from the source in every case.
            if let Err(ack_error) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %ack_error, "can't ack delivery");
            }
        }
        Err(_closed) => {
            // The pipeline is draining; hand the message back for the
            // next run.
            let _ = delivery.reject(BasicRejectOptions { requeue: true }).await;
        }
    }
}
