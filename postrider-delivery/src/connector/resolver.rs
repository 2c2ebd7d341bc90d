//! MX resolution for outbound delivery.

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
};
use postrider_common::Domain;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    /// The domain has no MX records.
    #[error("no mail servers found for {0}")]
    NoRecords(Domain),

    /// The query itself failed (network, NXDOMAIN, timeout).
    #[error("MX lookup failed for {domain}: {reason}")]
    Lookup { domain: Domain, reason: String },
}

/// One MX record, best preference first after sorting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
    pub port: u16,
}

impl MxRecord {
    #[must_use]
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
            port: 25,
        }
    }
}

/// MX lookup abstraction so the seeker can be exercised without DNS.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Resolve the MX records for `domain`, sorted by preference.
    async fn lookup_mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, DnsError>;
}

/// The production resolver backed by hickory.
pub struct HickoryMxResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryMxResolver {
    /// Use the system resolver configuration, falling back to defaults
    /// when `/etc/resolv.conf` is unusable.
    #[must_use]
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

impl Default for HickoryMxResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn lookup_mx(&self, domain: &Domain) -> Result<Vec<MxRecord>, DnsError> {
        let lookup = self.resolver.mx_lookup(domain.as_str()).await.map_err(|err| {
            if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                DnsError::NoRecords(domain.clone())
            } else {
                DnsError::Lookup {
                    domain: domain.clone(),
                    reason: err.to_string(),
                }
            }
        })?;

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                MxRecord::new(host.trim_end_matches('.'), mx.preference())
            })
            .collect();

        if records.is_empty() {
            return Err(DnsError::NoRecords(domain.clone()));
        }

        records.sort_by_key(|record| record.preference);
        Ok(records)
    }
}
