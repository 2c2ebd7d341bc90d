//! The pipeline controller.
//!
//! One `Pipeline` owns every stage worker pool, the channel topology
//! between them, and the shared maps (sender table, limit registry, MX
//! registry). Envelopes do not carry routing state; after each stage the
//! controller's channels decide the next destination:
//!
//! guardian → limiter → preparer (→ seeker) → connector → mailer
//!
//! The submitter holds the envelope's result sink and plays the terminal
//! consumer stage.

use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use postrider_common::config::{Config, Timeouts};
use postrider_common::{Domain, Message, SendEnvelope, SendResult};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connector::seeker::{MailServerRegistry, SeekRequest};
use crate::connector::{self, ConnectionEvent};
use crate::guardian;
use crate::limiter::{self, LimitRegistry};
use crate::mailer::{self, MailerEvent};
use crate::recovery::Republisher;
use crate::sender::{self, SenderRuntime};
use crate::{connector::resolver::MxResolver, error::DeliveryError};

#[derive(Debug, Error)]
#[error("pipeline is closed")]
pub struct PipelineClosed;

/// A stage's inbound channel, closable for a sequential drain on finish.
pub(crate) struct StageTx<T>(parking_lot::Mutex<Option<mpsc::Sender<T>>>);

impl<T> StageTx<T> {
    fn new(tx: mpsc::Sender<T>) -> Self {
        Self(parking_lot::Mutex::new(Some(tx)))
    }

    /// Forward to the stage. On a closed stage the value is dropped, which
    /// for envelopes resolves their sink with `Failed`.
    pub async fn send(&self, value: T) -> Result<(), ()> {
        let tx = self.0.lock().clone();
        match tx {
            Some(tx) => tx.send(value).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    fn close(&self) {
        self.0.lock().take();
    }
}

pub(crate) struct Stages {
    pub guardian: StageTx<SendEnvelope>,
    pub limiter: StageTx<SendEnvelope>,
    pub preparer: StageTx<SendEnvelope>,
    pub seeker: StageTx<SeekRequest>,
    pub connector: StageTx<ConnectionEvent>,
    pub mailer: StageTx<MailerEvent>,
}

/// State shared by every stage worker.
pub(crate) struct Shared {
    pub senders: AHashMap<Domain, Arc<SenderRuntime>>,
    pub timeouts: Timeouts,
    pub limits: Arc<LimitRegistry>,
    pub registry: MailServerRegistry,
    pub resolver: Arc<dyn MxResolver>,
    pub republisher: Arc<dyn Republisher>,
    pub stages: Stages,
}

struct WorkerSet {
    guardian: Vec<JoinHandle<()>>,
    limiter: Vec<JoinHandle<()>>,
    preparer: Vec<JoinHandle<()>>,
    seeker: Vec<JoinHandle<()>>,
    connector: Vec<JoinHandle<()>>,
    mailer: Vec<JoinHandle<()>>,
    cleaner: JoinHandle<()>,
}

pub struct Pipeline {
    shared: Arc<Shared>,
    workers: tokio::sync::Mutex<Option<WorkerSet>>,
}

impl Pipeline {
    /// Build the stage topology and start the worker pools.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] when a sender identity cannot be
    /// initialised (unreadable key material, unresolvable sender MX).
    pub async fn new(
        config: &Config,
        republisher: Arc<dyn Republisher>,
        resolver: Arc<dyn MxResolver>,
    ) -> Result<Self, DeliveryError> {
        let workers = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };

        let senders = sender::build(config, resolver.as_ref()).await?;
        let limits = Arc::new(LimitRegistry::build(config));

        let (guardian_tx, guardian_rx) = mpsc::channel(1);
        let (limiter_tx, limiter_rx) = mpsc::channel(1);
        let (preparer_tx, preparer_rx) = mpsc::channel(1);
        let (seeker_tx, seeker_rx) = mpsc::channel(1);
        let (connector_tx, connector_rx) = mpsc::channel(1);
        let (mailer_tx, mailer_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            senders,
            timeouts: config.timeouts.clone(),
            limits: Arc::clone(&limits),
            registry: MailServerRegistry::new(),
            resolver,
            republisher,
            stages: Stages {
                guardian: StageTx::new(guardian_tx),
                limiter: StageTx::new(limiter_tx),
                preparer: StageTx::new(preparer_tx),
                seeker: StageTx::new(seeker_tx),
                connector: StageTx::new(connector_tx),
                mailer: StageTx::new(mailer_tx),
            },
        });

        let worker_set = WorkerSet {
            guardian: spawn_pool(workers, guardian_rx, {
                let shared = Arc::clone(&shared);
                move |worker_id, envelope| {
                    let shared = Arc::clone(&shared);
                    async move { guardian::guard(&shared, worker_id, envelope).await }
                }
            }),
            limiter: spawn_pool(workers, limiter_rx, {
                let shared = Arc::clone(&shared);
                move |worker_id, envelope| {
                    let shared = Arc::clone(&shared);
                    async move { limiter::limit(&shared, worker_id, envelope).await }
                }
            }),
            preparer: spawn_pool(workers, preparer_rx, {
                let shared = Arc::clone(&shared);
                move |worker_id, envelope| {
                    let shared = Arc::clone(&shared);
                    async move {
                        connector::preparer::prepare(&shared, worker_id, envelope).await;
                    }
                }
            }),
            seeker: spawn_pool(workers, seeker_rx, {
                let shared = Arc::clone(&shared);
                move |_, request| {
                    let shared = Arc::clone(&shared);
                    async move {
                        connector::seeker::seek(
                            &shared.registry,
                            shared.resolver.as_ref(),
                            request,
                        )
                        .await;
                    }
                }
            }),
            connector: spawn_pool(workers, connector_rx, {
                let shared = Arc::clone(&shared);
                move |worker_id, event| {
                    let shared = Arc::clone(&shared);
                    async move { connector::connect(&shared, worker_id, event).await }
                }
            }),
            mailer: spawn_pool(workers, mailer_rx, {
                let shared = Arc::clone(&shared);
                move |worker_id, event| {
                    let shared = Arc::clone(&shared);
                    async move { mailer::deliver(&shared, worker_id, event).await }
                }
            }),
            cleaner: tokio::spawn(limiter::run_cleaner(limits)),
        };

        Ok(Self {
            shared,
            workers: tokio::sync::Mutex::new(Some(worker_set)),
        })
    }

    /// Enter a message into the pipeline; the returned receiver resolves
    /// with its terminal result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineClosed`] once [`Pipeline::finish`] has run.
    pub async fn submit(
        &self,
        message: Message,
    ) -> Result<oneshot::Receiver<SendResult>, PipelineClosed> {
        let (envelope, receiver) = SendEnvelope::new(message);
        self.shared
            .stages
            .guardian
            .send(envelope)
            .await
            .map_err(|()| PipelineClosed)?;
        Ok(receiver)
    }

    /// Drain the pipeline stage by stage in flow order. In-flight
    /// envelopes finish; new submissions fail with [`PipelineClosed`].
    pub async fn finish(&self) {
        let Some(set) = self.workers.lock().await.take() else {
            return;
        };
        let stages = &self.shared.stages;

        for (close, workers) in [
            (&stages.guardian as &dyn Close, set.guardian),
            (&stages.limiter as &dyn Close, set.limiter),
            (&stages.preparer as &dyn Close, set.preparer),
            (&stages.seeker as &dyn Close, set.seeker),
            (&stages.connector as &dyn Close, set.connector),
            (&stages.mailer as &dyn Close, set.mailer),
        ] {
            close.close_stage();
            for handle in workers {
                let _ = handle.await;
            }
        }

        set.cleaner.abort();
    }
}

/// Type-erased close so `finish` can iterate stages of differing payloads.
trait Close {
    fn close_stage(&self);
}

impl<T> Close for StageTx<T> {
    fn close_stage(&self) {
        self.close();
    }
}

/// Start `count` workers draining one shared inbound channel; the channel
/// closing is the shutdown signal.
fn spawn_pool<T, F, Fut>(count: usize, receiver: mpsc::Receiver<T>, handler: F) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(usize, T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    (0..count)
        .map(|worker_id| {
            let receiver = Arc::clone(&receiver);
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let item = { receiver.lock().await.recv().await };
                    match item {
                        Some(item) => handler(worker_id, item).await,
                        None => break,
                    }
                }
            })
        })
        .collect()
}
