// # NAT Router Trait
//
// Defines the interface to the consumer router that performs NAT traversal.
//
// ## Implementations
//
// - UPnP IGD: `connect-router-igd` crate
//
// Routers are plain executors: lease bookkeeping, renewal cadence, and
// public port selection are owned by `UpnpLeaseManager`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
    /// TCP mapping
    Tcp,
    /// UDP mapping
    Udp,
}

/// A port mapping as reported by the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Public (external) port
    pub public_port: u16,
    /// Private (internal) port
    pub private_port: u16,
    /// Internal client address, if the router reports it
    pub private_host: Option<String>,
    /// Protocol
    pub protocol: MappingProtocol,
    /// Description shown in the router UI
    pub description: String,
    /// Remaining lease time, if the router reports it
    pub ttl: Option<Duration>,
}

/// Trait for NAT router implementations
///
/// All methods perform network I/O and may fail with `Error::Router`.
/// Implementations must not retry internally.
#[async_trait]
pub trait NatRouter: Send + Sync {
    /// Create (or refresh) a TCP mapping `public_port -> private_port`
    async fn create_mapping(
        &self,
        public_port: u16,
        private_port: u16,
        description: &str,
        ttl: Duration,
    ) -> Result<(), crate::Error>;

    /// Remove the mapping for `public_port`
    async fn remove_mapping(&self, public_port: u16, private_port: u16) -> Result<(), crate::Error>;

    /// List the router's current mappings
    async fn list_mappings(&self) -> Result<Vec<PortMapping>, crate::Error>;
}
