//! Service lifecycle: init, run, reconfigure, finish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use postrider_amqp::{AmqpRepublisher, AmqpService};
use postrider_common::Config;
use postrider_delivery::{HickoryMxResolver, Pipeline, Republisher};
use tracing::{error, info};

use crate::config_source::ConfigSource;

/// Grace period after finishing services before the next init, letting
/// in-flight envelopes settle.
const RECONFIGURE_PAUSE: Duration = Duration::from_secs(2);

/// Run until a finish signal arrives, restarting the services whenever
/// the configuration document changes.
///
/// # Errors
///
/// Returns an error when the initial configuration is unusable or a
/// service fails to start; both are fatal.
pub async fn run(source: ConfigSource) -> anyhow::Result<()> {
    let mut raw = source.load().await.context("can't read configuration")?;
    let mut config = Config::from_yaml(&raw).context("can't parse configuration")?;

    loop {
        let services = Services::start(&config).await?;
        info!("postrider is running");

        tokio::select! {
            () = finish_signal() => {
                info!("finish signal received, draining");
                services.finish().await;
                return Ok(());
            }
            bytes = source.changed(&raw) => {
                info!("configuration changed, reconfiguring");
                services.finish().await;
                tokio::time::sleep(RECONFIGURE_PAUSE).await;

                match Config::from_yaml(&bytes) {
                    Ok(parsed) => {
                        config = parsed;
                        raw = bytes;
                    }
                    Err(parse_error) => {
                        error!(error = %parse_error, "new configuration is invalid, keeping the previous one");
                    }
                }
            }
        }
    }
}

struct Services {
    pipeline: Arc<Pipeline>,
    amqp: AmqpService,
}

impl Services {
    async fn start(config: &Config) -> anyhow::Result<Self> {
        let consumer = config
            .consumers
            .first()
            .context("consumer config is empty")?;

        let republisher: Arc<dyn Republisher> = Arc::new(
            AmqpRepublisher::connect(&consumer.uri, &consumer.bindings)
                .await
                .context("can't connect republisher")?,
        );
        let resolver = Arc::new(HickoryMxResolver::new());

        let pipeline = Arc::new(
            Pipeline::new(config, republisher, resolver)
                .await
                .context("can't start delivery pipeline")?,
        );
        let amqp = AmqpService::start(config.consumers.clone(), Arc::clone(&pipeline));

        Ok(Self { pipeline, amqp })
    }

    /// Stop the ingress first so no new envelopes arrive, then drain the
    /// pipeline stage by stage.
    async fn finish(self) {
        self.amqp.finish().await;
        self.pipeline.finish().await;
    }
}

async fn finish_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
