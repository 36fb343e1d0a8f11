//! Resolution of a trunk's proxy domain into an ordered list of candidate hops.
//!
//! The ordered list is embedded into the [`TransactionContext`] of an outbound
//! INVITE; failover consumes it front to back.
//!
//! [`TransactionContext`]: crate::transaction::TransactionContext
use crate::Result;
use rsip::{Domain, Port, Transport};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub mod sip_resolver;

pub use sip_resolver::{resolve_hops, SrvRecord};
#[cfg(feature = "srv_lookup")]
pub use sip_resolver::HickorySource;

/// One candidate network destination for an outbound session-setup attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl Hop {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self { addr, transport }
    }
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.transport)
    }
}

#[async_trait::async_trait]
pub trait LookupSource: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>>;
    async fn lookup_a_aaaa(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// A/AAAA only, through the system resolver. SRV queries always miss, so
/// resolution falls back to the default port of the transport.
#[derive(Debug, Clone, Default)]
pub struct SystemLookup {}

#[async_trait::async_trait]
impl LookupSource for SystemLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        Err(crate::Error::Error(format!("srv lookup unavailable for {}", name)))
    }

    async fn lookup_a_aaaa(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| crate::Error::Error(format!("DNS resolution failed for {}: {}", name, e)))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

#[derive(Clone)]
pub struct HopResolver {
    source: Arc<dyn LookupSource>,
}

impl Default for HopResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemLookup::default()))
    }
}

impl HopResolver {
    pub fn new(source: Arc<dyn LookupSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(
        &self,
        domain: &Domain,
        port: Option<Port>,
        transport: Option<Transport>,
        secure: bool,
    ) -> Result<Vec<Hop>> {
        resolve_hops(self.source.as_ref(), domain, port, transport, secure).await
    }
}
