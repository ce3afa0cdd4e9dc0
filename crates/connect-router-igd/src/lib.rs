// # IGD Router
//
// This crate talks to a UPnP Internet Gateway Device on the local network
// to create, renew, list and remove TCP port mappings.
//
// ## Architecture
//
// The synchronous `igd_next` gateway API does blocking network I/O, so
// every call runs on the blocking thread pool. The gateway is discovered
// lazily and cached; any failed call drops the cache so the next call
// rediscovers (routers reboot and change address).
//
// The internal client address of a mapping is the local interface address
// that routes to the gateway.

use async_trait::async_trait;
use connect_core::traits::{MappingProtocol, NatRouter, PortMapping};
use connect_core::{Error, Result};

use igd_next::{Gateway, PortMappingEntry, PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::sync::Mutex;

/// Default gateway discovery timeout
const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 5;

/// Safety bound when walking the router's mapping table
const MAX_MAPPING_ENTRIES: u32 = 512;

/// NAT router backed by a UPnP IGD
pub struct IgdRouter {
    /// Discovery timeout
    search_timeout: Duration,

    /// Cached gateway
    gateway: Mutex<Option<Gateway>>,
}

impl IgdRouter {
    /// Create a router that discovers the gateway on first use
    pub fn new() -> Self {
        Self::with_search_timeout(Duration::from_secs(DEFAULT_SEARCH_TIMEOUT_SECS))
    }

    /// Create with a custom discovery timeout
    pub fn with_search_timeout(search_timeout: Duration) -> Self {
        Self {
            search_timeout,
            gateway: Mutex::new(None),
        }
    }

    /// Discovered gateway, searching if none is cached
    async fn gateway(&self) -> Result<Gateway> {
        let mut cached = self.gateway.lock().await;
        if let Some(gateway) = cached.as_ref() {
            return Ok(gateway.clone());
        }

        let timeout = self.search_timeout;
        let gateway = tokio::task::spawn_blocking(move || {
            igd_next::search_gateway(SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| Error::router(format!("Gateway discovery task failed: {}", e)))?
        .map_err(|e| Error::router(format!("No UPnP gateway found: {}", e)))?;

        tracing::info!(gateway = %gateway.addr, "UPnP gateway discovered");
        *cached = Some(gateway.clone());
        Ok(gateway)
    }

    /// Forget the cached gateway after a failure
    async fn invalidate(&self) {
        self.gateway.lock().await.take();
    }

    /// Run a blocking gateway call, invalidating the cache on failure
    async fn call<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Gateway) -> std::result::Result<T, String> + Send + 'static,
    {
        let gateway = self.gateway().await?;
        let result = tokio::task::spawn_blocking(move || f(gateway))
            .await
            .map_err(|e| Error::router(format!("{} task failed: {}", what, e)))?;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate().await;
                Err(Error::router(format!("{} failed: {}", what, e)))
            }
        }
    }
}

impl Default for IgdRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Local interface address that routes to `gateway`
///
/// Connecting a UDP socket sends nothing; it only selects the route.
fn local_ip_towards(gateway: SocketAddr) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(gateway)?;
    Ok(socket.local_addr()?.ip())
}

/// Lease duration in the router's unit, saturating
fn lease_secs(ttl: Duration) -> u32 {
    u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX)
}

/// Convert a router table entry
fn to_mapping(entry: PortMappingEntry) -> PortMapping {
    PortMapping {
        public_port: entry.external_port,
        private_port: entry.internal_port,
        private_host: Some(entry.internal_client).filter(|host| !host.is_empty()),
        protocol: match entry.protocol {
            PortMappingProtocol::TCP => MappingProtocol::Tcp,
            PortMappingProtocol::UDP => MappingProtocol::Udp,
        },
        description: entry.port_mapping_description,
        // Zero means a permanent mapping
        ttl: (entry.lease_duration > 0).then(|| Duration::from_secs(u64::from(entry.lease_duration))),
    }
}

#[async_trait]
impl NatRouter for IgdRouter {
    async fn create_mapping(
        &self,
        public_port: u16,
        private_port: u16,
        description: &str,
        ttl: Duration,
    ) -> Result<()> {
        let description = description.to_string();
        let lease = lease_secs(ttl);

        self.call("Port mapping", move |gateway| {
            let local_ip = local_ip_towards(gateway.addr)
                .map_err(|e| format!("cannot determine local address: {}", e))?;
            gateway
                .add_port(
                    PortMappingProtocol::TCP,
                    public_port,
                    SocketAddr::new(local_ip, private_port),
                    lease,
                    &description,
                )
                .map_err(|e| e.to_string())
        })
        .await?;

        tracing::debug!(public_port, private_port, lease, "UPnP mapping created");
        Ok(())
    }

    async fn remove_mapping(&self, public_port: u16, private_port: u16) -> Result<()> {
        self.call("Port mapping removal", move |gateway| {
            gateway
                .remove_port(PortMappingProtocol::TCP, public_port)
                .map_err(|e| e.to_string())
        })
        .await?;

        tracing::debug!(public_port, private_port, "UPnP mapping removed");
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<PortMapping>> {
        self.call("Port mapping listing", move |gateway| {
            let mut mappings = Vec::new();
            for index in 0..MAX_MAPPING_ENTRIES {
                // Walking past the end of the table is reported as an error
                match gateway.get_generic_port_mapping_entry(index) {
                    Ok(entry) => mappings.push(to_mapping(entry)),
                    Err(_) if index > 0 => break,
                    Err(e) => {
                        tracing::debug!("Router reports no mapping entries: {}", e);
                        break;
                    }
                }
            }
            Ok(mappings)
        })
        .await
    }
}
