//! DNS utilities for relay delivery
//!
//! MX lookups go through the [`MxResolver`] trait so the delivery engine can
//! be driven by a fixed table in tests.

use crate::error::{RelayError, Result};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::*;
use trust_dns_resolver::TokioAsyncResolver;

/// One mail exchanger for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

#[async_trait::async_trait]
pub trait MxResolver: Send + Sync {
    /// Exchanges for `domain`, lowest preference (highest priority) first
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>>;
}

/// MX resolution against the system's configured nameservers
pub struct DnsMxResolver {
    resolver: TokioAsyncResolver,
}

impl DnsMxResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for DnsMxResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MxResolver for DnsMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        info!("Looking up MX records for {}", domain);

        let lookup = self.resolver.mx_lookup(domain).await.map_err(|e| {
            warn!("MX lookup failed for {}: {}", domain, e);
            RelayError::RelayLookup(format!("{}: {}", domain, e))
        })?;

        let records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord {
                preference: mx.preference(),
                exchange: mx.exchange().to_string().trim_end_matches('.').to_string(),
            })
            .collect();

        for record in &records {
            debug!("  MX {} priority {}", record.exchange, record.preference);
        }

        Ok(sort_by_preference(records))
    }
}

/// Order exchanges by priority; equal preferences keep lookup order
pub fn sort_by_preference(mut records: Vec<MxRecord>) -> Vec<MxRecord> {
    records.sort_by_key(|record| record.preference);
    records
}
