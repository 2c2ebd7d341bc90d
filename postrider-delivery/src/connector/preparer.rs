//! The preparer: resolves a domain's mail servers via the seeker, then
//! hands the envelope to a connector.

use postrider_common::{Domain, SendEnvelope};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ConnectionEvent;
use super::seeker::{MailServerState, SeekRequest};
use crate::error::DeliveryError;
use crate::pipeline::Shared;
use crate::recovery;

pub(crate) async fn prepare(shared: &Shared, worker_id: usize, envelope: SendEnvelope) {
    let message = &envelope.message;
    debug!(
        hostname = %message.hostname_from,
        id = message.id,
        "preparer#{worker_id} tries to create connection"
    );

    // Rotate through the sender's source-IP pool by worker index.
    let source = shared
        .senders
        .get(&message.hostname_from)
        .and_then(|sender| {
            if sender.ips.is_empty() {
                None
            } else {
                Some(sender.ips[worker_id % sender.ips.len()])
            }
        });

    let domain: Domain = message.hostname_to.clone();
    let (reply, receiver) = oneshot::channel();
    let request = SeekRequest {
        domain: domain.clone(),
        preparer_id: worker_id,
        reply,
    };

    if shared.stages.seeker.send(request).await.is_err() {
        warn!(hostname = %message.hostname_from, "seeker stage is closed");
        return; // dropping the envelope resolves its sink with Failed
    }
    let Ok(mut state_rx) = receiver.await else {
        warn!(hostname = %message.hostname_from, "seeker dropped the request");
        return;
    };

    // Await the slot's completion broadcast; the claiming request's lookup
    // guarantees a terminal transition.
    let state = loop {
        let current = state_rx.borrow_and_update().clone();
        if !matches!(current, MailServerState::Lookup) {
            break current;
        }
        if state_rx.changed().await.is_err() {
            break MailServerState::Error;
        }
    };

    match state {
        MailServerState::Success(servers) => {
            let event = ConnectionEvent {
                envelope,
                servers,
                source,
            };
            if shared.stages.connector.send(event).await.is_err() {
                warn!(hostname = %domain, "connector stage is closed");
            }
        }
        MailServerState::Error | MailServerState::Lookup => {
            recovery::return_mail(shared, envelope, &DeliveryError::Unroutable(domain)).await;
        }
    }
}
