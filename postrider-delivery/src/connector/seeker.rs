//! MX discovery with duplicate-lookup suppression.
//!
//! The first envelope bound for a domain claims its registry slot and owns
//! the one `LookupMX` that will ever run for it; everyone else awaits the
//! slot's completion broadcast. The registry lives for the process (or
//! until a reconfigure rebuilds the pipeline).

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use postrider_common::Domain;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::pool::MxServer;
use super::resolver::MxResolver;

/// Where a domain's discovery currently stands.
#[derive(Clone)]
pub(crate) enum MailServerState {
    /// A lookup is in flight; await the watch channel.
    Lookup,
    /// MX servers in preference order.
    Success(Arc<Vec<Arc<MxServer>>>),
    /// The domain is unroutable.
    Error,
}

struct MailServerSlot {
    /// Preparer that claimed the lookup; only its request resolves.
    claimed_by: usize,
    state: watch::Sender<MailServerState>,
}

/// A request from a preparer for one domain's mail servers.
pub(crate) struct SeekRequest {
    pub domain: Domain,
    pub preparer_id: usize,
    pub reply: oneshot::Sender<watch::Receiver<MailServerState>>,
}

#[derive(Default)]
pub(crate) struct MailServerRegistry {
    slots: DashMap<Domain, MailServerSlot>,
}

impl MailServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handle one seek request: answer with the slot's watch channel, and
/// perform the lookup when this request is the one that claimed the slot.
pub(crate) async fn seek(
    registry: &MailServerRegistry,
    resolver: &dyn MxResolver,
    request: SeekRequest,
) {
    let (receiver, claimed) = match registry.slots.entry(request.domain.clone()) {
        Entry::Occupied(slot) => (slot.get().state.subscribe(), false),
        Entry::Vacant(vacancy) => {
            debug!(hostname = %request.domain, "create mail server record");
            let (state, receiver) = watch::channel(MailServerState::Lookup);
            vacancy.insert(MailServerSlot {
                claimed_by: request.preparer_id,
                state,
            });
            (receiver, true)
        }
    };

    // Answer first; the preparer observes the terminal state through the
    // watch channel whether or not this request runs the lookup.
    let _ = request.reply.send(receiver);

    if !claimed {
        return;
    }

    let state = resolve(resolver, &request.domain).await;
    if let Some(slot) = registry.slots.get(&request.domain) {
        if slot.claimed_by == request.preparer_id {
            slot.state.send_replace(state);
        }
    }
}

async fn resolve(resolver: &dyn MxResolver, domain: &Domain) -> MailServerState {
    match resolver.lookup_mx(domain).await {
        Ok(records) => {
            let mut servers = Vec::with_capacity(records.len());
            for record in records {
                let real_name = seek_real_server_name(resolver, &record.host).await;
                debug!(
                    hostname = %domain,
                    mx = %record.host,
                    real_name = %real_name,
                    "discovered mx server"
                );
                servers.push(Arc::new(MxServer::new(&record.host, &real_name, record.port)));
            }
            MailServerState::Success(Arc::new(servers))
        }
        Err(error) => {
            warn!(hostname = %domain, error = %error, "can't look up mx servers");
            MailServerState::Error
        }
    }
}

/// Walk MX records up the domain tree to find the apex zone actually
/// hosting the mail cluster. `mx1.eu.mail.example.com` resolves to
/// whatever zone's best MX points back into it; that zone names the TLS
/// identity shared by the MX siblings.
pub(crate) async fn seek_real_server_name(resolver: &dyn MxResolver, hostname: &str) -> String {
    let mut candidate = hostname.trim_end_matches('.').to_string();

    // Depth-bounded: a malicious zone must not loop us forever.
    for _ in 0..8 {
        let Some(zone) = parent_zone(&candidate) else {
            return candidate;
        };
        match resolver.lookup_mx(&Domain::new(&zone)).await {
            Ok(records) if !records.is_empty() => {
                let best = records[0].host.trim_end_matches('.');
                if best.ends_with(zone.as_str()) {
                    return zone;
                }
                candidate = best.to_string();
            }
            _ => return zone,
        }
    }
    candidate
}

/// The two-label zone a hostname hangs off: `mx1.mail.example.com` →
/// `example.com`.
fn parent_zone(hostname: &str) -> Option<String> {
    let labels: Vec<&str> = hostname.trim_end_matches('.').split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::resolver::{DnsError, MxRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedResolver {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl MxResolver for ScriptedResolver {
        async fn lookup_mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, DnsError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match domain.as_str() {
                "b.example" => Ok(vec![
                    MxRecord::new("mx1.b.example", 10),
                    MxRecord::new("mx2.b.example", 20),
                ]),
                // zone walk target for mx hosts of b.example
                "broken.example" => Err(DnsError::NoRecords(domain.clone())),
                other => Ok(vec![MxRecord::new(format!("mx1.{other}"), 10)]),
            }
        }
    }

    #[test]
    fn parent_zone_strips_host_labels() {
        assert_eq!(
            parent_zone("mx1.mail.example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(parent_zone("mx.example.com.").as_deref(), Some("example.com"));
        assert_eq!(parent_zone("example.com"), None);
    }

    #[tokio::test]
    async fn real_server_name_stops_at_matching_zone() {
        let resolver = ScriptedResolver {
            lookups: AtomicUsize::new(0),
        };
        // b.example's best MX is mx1.b.example, which ends with b.example.
        let name = seek_real_server_name(&resolver, "mx1.b.example").await;
        assert_eq!(name, "b.example");
    }

    #[tokio::test]
    async fn lookup_runs_once_per_domain() {
        let registry = MailServerRegistry::new();
        let resolver = ScriptedResolver {
            lookups: AtomicUsize::new(0),
        };

        for preparer_id in 0..3 {
            let (reply, rx) = oneshot::channel();
            seek(
                &registry,
                &resolver,
                SeekRequest {
                    domain: Domain::new("broken.example"),
                    preparer_id,
                    reply,
                },
            )
            .await;
            let state_rx = rx.await.unwrap();
            assert!(matches!(*state_rx.borrow(), MailServerState::Error));
        }

        // One MX lookup despite three racing requests.
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_seek_orders_servers_by_preference() {
        let registry = MailServerRegistry::new();
        let resolver = ScriptedResolver {
            lookups: AtomicUsize::new(0),
        };

        let (reply, rx) = oneshot::channel();
        seek(
            &registry,
            &resolver,
            SeekRequest {
                domain: Domain::new("b.example"),
                preparer_id: 1,
                reply,
            },
        )
        .await;

        let state_rx = rx.await.unwrap();
        let state = state_rx.borrow().clone();
        match state {
            MailServerState::Success(servers) => {
                assert_eq!(&*servers[0].hostname, "mx1.b.example");
                assert_eq!(&*servers[1].hostname, "mx2.b.example");
            }
            _ => panic!("expected success"),
        }
    }
}
