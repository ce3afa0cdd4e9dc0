// # Reverse Proxy Trait
//
// The reverse proxy reads the WAN-access flag from configuration; after the
// flag changes it must be reloaded so externally-facing routing follows.

use async_trait::async_trait;

/// Trait for reverse proxy implementations
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Reload the proxy configuration
    async fn reload(&self) -> Result<(), crate::Error>;
}
