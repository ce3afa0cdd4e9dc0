// # connect-core
//
// Core library for the remote access control-plane agent.
//
// ## Architecture Overview
//
// The agent keeps an outbound control connection to the relay alive and
// decides whether, and how, remote access to the appliance should run:
// - **ConnectionManager**: Owns the relay connection, reconnects with backoff
// - **BackoffPolicy**: Disconnect code → reason and jittered retry delay
// - **EventRouter**: Validates inbound control events and dispatches them
// - **RemoteAccessOrchestrator**: At most one active backend, serialized transitions
// - **StaticBackend / UpnpBackend**: The two remote access strategies
// - **UpnpLeaseManager**: Creates, renews, and removes the router port mapping
// - **ReconciliationController / UpnpReconciler**: State-diff loops driving the above
// - **ConnectAgent**: Wires everything together
//
// ## Design Principles
//
// 1. **Single Writer**: Runtime state is written by orchestrator transitions only
// 2. **Explicit Handles**: Every manager is constructed once and passed by handle
// 3. **Bounded Fan-out**: Status notifications go through bounded queues
// 4. **Library-First**: Collaborators are traits; the daemon only wires concrete ones

pub mod traits;
pub mod config;
pub mod error;
pub mod state;
pub mod bus;
pub mod backoff;
pub mod connection;
pub mod upnp;
pub mod backend;
pub mod orchestrator;
pub mod dispatch;
pub mod reconcile;
pub mod proxy;
pub mod agent;

// Re-export core types for convenience
pub use traits::{ConfigStore, NatRouter, RelayTransport, ReverseProxy, WanResolver};
pub use agent::{Collaborators, ConnectAgent};
pub use backoff::{BackoffDecision, BackoffPolicy};
pub use bus::{StatusBus, StatusEvent};
pub use config::{AgentConfig, ConnectConfig, RemoteAccessConfig, RemoteAccessType, SetupRemoteAccessInput};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use dispatch::EventRouter;
pub use error::{Error, Result};
pub use orchestrator::{RemoteAccessControl, RemoteAccessOrchestrator};
pub use reconcile::{ReconciliationController, UpnpReconciler};
pub use state::{FileConfigStore, MemoryConfigStore, Store};
pub use upnp::{Lease, UpnpLeaseManager};
