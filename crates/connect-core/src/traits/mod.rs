//! Collaborator traits for the connect agent
//!
//! This module defines the abstract interfaces to everything outside the core:
//!
//! - [`RelayTransport`]: Open the outbound control connection to the relay
//! - [`NatRouter`]: Create, remove, and list port mappings on the router
//! - [`ReverseProxy`]: Reload externally-facing routing
//! - [`WanResolver`]: Resolve the appliance's public address
//! - [`ConfigStore`]: Persist the agent's configuration

pub mod relay;
pub mod router;
pub mod proxy;
pub mod wan;
pub mod config_store;

pub use relay::{
    AccessUrl, AccessUrlType, ConnectionParams, RelayMessage, RelayStream, RelayTransport,
    RemoteAccessEvent, RemoteAccessEventType,
};
pub use router::{MappingProtocol, NatRouter, PortMapping};
pub use proxy::ReverseProxy;
pub use wan::WanResolver;
pub use config_store::ConfigStore;
