//! Per-(sender, recipient-domain) rate limiting.
//!
//! Limits are windowed counters: the limiter increments atomically on the
//! hot path, and a dedicated cleaner zeroes expired windows once a second.
//! The two coordinate only through the atomics; there is no lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use postrider_common::config::Config;
use postrider_common::{Domain, SendEnvelope, SendResult, unix_now};
use tracing::{debug, warn};

use crate::pipeline::Shared;
use crate::recovery::{self, FailureKind};

/// One windowed quota.
pub(crate) struct Limit {
    max_value: u32,
    window_secs: u64,
    current: AtomicU32,
    modified: AtomicU64,
}

impl Limit {
    pub fn new(max_value: u32, window: Duration) -> Self {
        Self {
            max_value,
            window_secs: window.as_secs(),
            current: AtomicU32::new(0),
            modified: AtomicU64::new(unix_now()),
        }
    }

    /// Count one send; `false` when the window's quota is exhausted.
    pub fn try_increment(&self) -> bool {
        self.current.fetch_add(1, Ordering::SeqCst) < self.max_value
    }

    /// Zero the counter when the window has passed. Called by the cleaner.
    pub fn reset_if_expired(&self, now: u64) -> bool {
        if now.saturating_sub(self.modified.load(Ordering::SeqCst)) >= self.window_secs {
            self.current.store(0, Ordering::SeqCst);
            self.modified.store(now, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn backdate(&self, seconds: u64) {
        self.modified
            .store(unix_now().saturating_sub(seconds), Ordering::SeqCst);
    }
}

/// All configured limits, keyed by (sender, recipient domain). Built at
/// init and immutable afterwards, so lookups are lock-free.
#[derive(Default)]
pub(crate) struct LimitRegistry {
    limits: AHashMap<(Domain, Domain), Limit>,
}

impl LimitRegistry {
    pub fn build(config: &Config) -> Self {
        let mut limits = AHashMap::new();
        for (sender, postman) in &config.postmans {
            for (recipient, limit) in &postman.limits {
                debug!(
                    hostname = %sender,
                    recipient = %recipient,
                    value = limit.value,
                    "create limit"
                );
                limits.insert(
                    (sender.clone(), recipient.clone()),
                    Limit::new(limit.value, limit.duration.duration()),
                );
            }
        }
        Self { limits }
    }

    pub fn get(&self, from: &Domain, to: &Domain) -> Option<&Limit> {
        self.limits.get(&(from.clone(), to.clone()))
    }

    pub fn sweep(&self, now: u64) {
        for limit in self.limits.values() {
            limit.reset_if_expired(now);
        }
    }
}

pub(crate) async fn limit(shared: &Shared, worker_id: usize, envelope: SendEnvelope) {
    let message = &envelope.message;
    let allowed = shared
        .limits
        .get(&message.hostname_from, &message.hostname_to)
        .map_or(true, Limit::try_increment);

    if allowed {
        if shared.stages.preparer.send(envelope).await.is_err() {
            warn!("preparer stage is closed");
        }
    } else {
        debug!(
            hostname = %message.hostname_from,
            id = message.id,
            recipient = %message.hostname_to,
            "limiter#{worker_id} detects overlimit"
        );
        recovery::fail(shared, envelope, FailureKind::OverLimit, SendResult::OverLimit).await;
    }
}

/// Tick at 1 Hz, zeroing every limit whose window has elapsed.
pub(crate) async fn run_cleaner(limits: std::sync::Arc<LimitRegistry>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        limits.sweep(unix_now());
    }
}
