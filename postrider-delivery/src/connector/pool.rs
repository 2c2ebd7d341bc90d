//! The per-MX connection pool.
//!
//! Each [`MxServer`] keeps one [`LimitQueue`] of idle clients per local
//! source address. A queue starts unbounded; the first dial or HELO failure
//! latches it ("limit on"), after which the connector never creates clients
//! beyond the observed concurrent capacity for that (MX, source IP) pair.
//! The latch is one-way for the process lifetime.

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Instant,
};

use dashmap::DashMap;
use postrider_smtp::SmtpClient;

/// One MX host of a recipient domain.
pub(crate) struct MxServer {
    pub hostname: Arc<str>,
    /// Apex of the MX's delegated mail cluster; used as the TLS identity.
    pub real_name: Arc<str>,
    pub port: u16,
    use_tls: AtomicBool,
    queues: DashMap<Option<IpAddr>, Arc<LimitQueue>>,
}

impl MxServer {
    pub fn new(hostname: &str, real_name: &str, port: u16) -> Self {
        Self {
            hostname: Arc::from(hostname),
            real_name: Arc::from(real_name),
            port,
            use_tls: AtomicBool::new(true),
            queues: DashMap::new(),
        }
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls.load(Ordering::Acquire)
    }

    /// One-way latch after a failed STARTTLS handshake.
    pub fn disable_tls(&self) {
        self.use_tls.store(false, Ordering::Release);
    }

    /// The idle-client queue for a source address, created on first use.
    pub fn queue(&self, source: Option<IpAddr>) -> Arc<LimitQueue> {
        self.queues
            .entry(source)
            .or_insert_with(|| Arc::new(LimitQueue::new()))
            .clone()
    }

    /// Smallest unused client id: queues track their high-water mark, so
    /// the sum over all of them plus one is fresh.
    pub fn next_client_id(&self) -> u32 {
        self.queues
            .iter()
            .map(|queue| queue.max_len())
            .sum::<u32>()
            + 1
    }
}

/// A bounded FIFO of idle clients with a learned capacity.
pub(crate) struct LimitQueue {
    idle: parking_lot::Mutex<VecDeque<PooledClient>>,
    max_len: AtomicU32,
    has_limit: AtomicBool,
}

impl LimitQueue {
    pub fn new() -> Self {
        Self {
            idle: parking_lot::Mutex::new(VecDeque::new()),
            max_len: AtomicU32::new(0),
            has_limit: AtomicBool::new(false),
        }
    }

    pub fn pop(&self) -> Option<PooledClient> {
        self.idle.lock().pop_front()
    }

    pub fn push(&self, client: PooledClient) {
        self.idle.lock().push_back(client);
    }

    pub fn has_limit(&self) -> bool {
        self.has_limit.load(Ordering::Acquire)
    }

    /// Latch the capacity: the remote signalled a per-IP concurrency cap.
    pub fn limit_on(&self) {
        self.has_limit.store(true, Ordering::Release);
    }

    pub fn max_len(&self) -> u32 {
        self.max_len.load(Ordering::Acquire)
    }

    /// Record one more client ever created for this queue.
    pub fn add_max_len(&self) {
        self.max_len.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientStatus {
    /// Handed out to a mailer.
    Working,
    /// Idle in its queue.
    Waiting,
    /// Connection died; the next pop discards it.
    Disconnected,
}

/// A pooled SMTP connection. Ownership moves between a queue and at most
/// one mailer at a time, so no interior locking is needed.
pub(crate) struct PooledClient {
    pub id: u32,
    pub client: SmtpClient,
    pub status: ClientStatus,
    pub modified: Instant,
}

impl PooledClient {
    pub fn new(id: u32, client: SmtpClient) -> Self {
        Self {
            id,
            client,
            status: ClientStatus::Waiting,
            modified: Instant::now(),
        }
    }

    pub fn wakeup(&mut self) {
        self.status = ClientStatus::Working;
        self.modified = Instant::now();
    }

    pub fn park(&mut self) {
        self.status = ClientStatus::Waiting;
        self.modified = Instant::now();
    }

    pub fn disconnect(&mut self) {
        self.status = ClientStatus::Disconnected;
        self.modified = Instant::now();
    }

    /// Replace a dead connection in place, keeping the client id.
    pub fn reopen(&mut self, client: SmtpClient) {
        self.client = client;
        self.status = ClientStatus::Waiting;
        self.modified = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_latch_is_one_way() {
        let mx = MxServer::new("mx.example.com", "example.com", 25);
        assert!(mx.use_tls());
        mx.disable_tls();
        assert!(!mx.use_tls());
        mx.disable_tls();
        assert!(!mx.use_tls());
    }

    #[test]
    fn limit_latch_is_one_way() {
        let queue = LimitQueue::new();
        assert!(!queue.has_limit());
        queue.limit_on();
        assert!(queue.has_limit());
    }

    #[test]
    fn client_ids_count_across_source_queues() {
        let mx = MxServer::new("mx.example.com", "example.com", 25);
        assert_eq!(mx.next_client_id(), 1);

        mx.queue(None).add_max_len();
        mx.queue(Some("203.0.113.10".parse().unwrap())).add_max_len();
        mx.queue(Some("203.0.113.10".parse().unwrap())).add_max_len();

        assert_eq!(mx.next_client_id(), 4);
    }

    #[test]
    fn queue_is_per_source_address() {
        let mx = MxServer::new("mx.example.com", "example.com", 25);
        let a = mx.queue(None);
        let b = mx.queue(Some("203.0.113.10".parse().unwrap()));
        let a_again = mx.queue(None);
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
