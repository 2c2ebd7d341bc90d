//! The guardian blocks sends to domains on the sender's exclusion list.

use postrider_common::{SendEnvelope, SendResult};
use tracing::{debug, warn};

use crate::pipeline::Shared;

pub(crate) async fn guard(shared: &Shared, worker_id: usize, envelope: SendEnvelope) {
    let message = &envelope.message;
    debug!(
        hostname = %message.hostname_from,
        id = message.id,
        "guardian#{worker_id} checks mail"
    );

    let excluded = shared
        .senders
        .get(&message.hostname_from)
        .is_some_and(|sender| sender.excludes.contains(&message.hostname_to));

    if excluded {
        debug!(
            hostname = %message.hostname_from,
            id = message.id,
            excluded = %message.hostname_to,
            "revoke sending mail"
        );
        envelope.complete(SendResult::Revoked);
    } else if shared.stages.limiter.send(envelope).await.is_err() {
        warn!("limiter stage is closed");
    }
}
