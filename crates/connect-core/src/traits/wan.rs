// # WAN Resolver Trait
//
// Resolves the appliance's externally visible address so backends can
// report the URL remote clients should use.
//
// ## Implementations
//
// - HTTP echo service: `connect-wan-http` crate

use async_trait::async_trait;
use std::net::IpAddr;

/// Trait for public address resolution
#[async_trait]
pub trait WanResolver: Send + Sync {
    /// Current public IP address of the appliance
    async fn public_ip(&self) -> Result<IpAddr, crate::Error>;
}
