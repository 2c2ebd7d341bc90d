//! Per-sender runtime state, resolved from the configuration at init.

use std::net::IpAddr;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use postrider_common::config::Config;
use postrider_common::Domain;
use postrider_smtp::client::tls;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::connector::resolver::MxResolver;
use crate::dkim::DkimSealer;
use crate::error::DeliveryError;

/// Everything the pipeline needs to act as one sender identity.
pub(crate) struct SenderRuntime {
    /// The canonical public hostname presented in EHLO/HELO: the best MX
    /// of the configured `mxHostname` (or of the sender domain itself).
    pub helo_hostname: String,
    pub ips: Vec<IpAddr>,
    pub excludes: AHashSet<Domain>,
    /// STARTTLS identity: client-authenticated when a certificate pair is
    /// configured, anonymous over the system roots otherwise.
    pub tls: TlsConnector,
    /// DKIM signer; `None` sends unsigned with a warning.
    pub dkim: Option<DkimSealer>,
}

/// Build the sender table. Broken key material or an unresolvable sender
/// MX is fatal: a misconfigured identity must not silently send.
pub(crate) async fn build(
    config: &Config,
    resolver: &dyn MxResolver,
) -> Result<AHashMap<Domain, Arc<SenderRuntime>>, DeliveryError> {
    let mut senders = AHashMap::with_capacity(config.postmans.len());

    for (domain, postman) in &config.postmans {
        let mx_source = postman
            .mx_hostname
            .as_ref()
            .map_or_else(|| domain.clone(), |hostname| Domain::new(hostname));

        let helo_hostname = resolver
            .lookup_mx(&mx_source)
            .await
            .ok()
            .and_then(|records| records.into_iter().next())
            .map(|record| record.host)
            .ok_or_else(|| {
                DeliveryError::Config(format!("can't resolve mx for sender {domain}"))
            })?;

        if postman.ips.is_empty() {
            warn!(hostname = %domain, "ips should be defined");
        }

        let dkim = match &postman.private_key {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|error| {
                    DeliveryError::Config(format!(
                        "can't read private key {}: {error}",
                        path.display()
                    ))
                })?;
                Some(DkimSealer::new(
                    domain.as_str(),
                    &postman.dkim_selector,
                    &pem,
                )?)
            }
            None => {
                warn!(hostname = %domain, "private key not configured, mail goes out unsigned");
                None
            }
        };

        let tls = match (&postman.certificate, &postman.private_key) {
            (Some(certificate), Some(key)) => {
                tls::connector(certificate, key).map_err(|error| {
                    DeliveryError::Config(format!("can't build TLS identity for {domain}: {error}"))
                })?
            }
            _ => {
                debug!(hostname = %domain, "no client certificate, STARTTLS uses system roots");
                tls::default_connector()
            }
        };

        senders.insert(
            domain.clone(),
            Arc::new(SenderRuntime {
                helo_hostname,
                ips: postman.ips.clone(),
                excludes: postman.exclude.iter().cloned().collect(),
                tls,
                dkim,
            }),
        );
    }

    Ok(senders)
}
