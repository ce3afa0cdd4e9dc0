//! Connect agent
//!
//! [`ConnectAgent`] wires the components together and runs the
//! reconciliation loops:
//!
//! ```text
//!  config / system changes ──► ReconciliationController ──► ConnectionManager ──► relay
//!            │                          │                          │
//!            │                          ▼                          ▼ inbound events
//!            └──► UpnpReconciler ──► RemoteAccessOrchestrator ◄── EventRouter
//!                                       │
//!                          ┌────────────┴────────────┐
//!                          ▼                         ▼
//!                   StaticBackend              UpnpBackend ──► UpnpLeaseManager ──► router
//!                   (reverse proxy)
//! ```
//!
//! Every component is constructed once here and shared by handle; there
//! are no globals.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{StaticBackend, UpnpBackend};
use crate::bus::{StatusBus, StatusEvent};
use crate::config::{AgentConfig, RemoteAccessConfig, RemoteAccessType, SetupRemoteAccessInput};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::dispatch::EventRouter;
use crate::error::Result;
use crate::orchestrator::{RemoteAccessControl, RemoteAccessOrchestrator};
use crate::reconcile::{ReconciliationController, UpnpReconciler};
use crate::state::{RemoteAccessStatus, Store};
use crate::traits::{ConfigStore, NatRouter, RelayTransport, ReverseProxy, WanResolver};
use crate::upnp::UpnpLeaseManager;

/// External collaborators the agent talks to
pub struct Collaborators {
    /// Relay connection transport
    pub transport: Arc<dyn RelayTransport>,
    /// NAT router for UPnP leases
    pub router: Arc<dyn NatRouter>,
    /// Reverse proxy reloaded on WAN-access changes
    pub proxy: Arc<dyn ReverseProxy>,
    /// Public address resolver
    pub wan: Arc<dyn WanResolver>,
    /// Configuration persistence
    pub persistence: Arc<dyn ConfigStore>,
}

/// The remote access control-plane agent
pub struct ConnectAgent {
    store: Store,
    bus: StatusBus,
    connection: ConnectionManager,
    orchestrator: RemoteAccessOrchestrator,
    leases: Arc<UpnpLeaseManager>,
    controller: Arc<ReconciliationController>,
    upnp: Arc<UpnpReconciler>,
    proxy: Arc<dyn ReverseProxy>,
}

impl ConnectAgent {
    /// Create an agent and load persisted configuration
    ///
    /// # Errors
    ///
    /// - `Error::Config`: `config` is invalid
    /// - `Error::Persistence`: the configuration store could not be read
    pub async fn new(config: AgentConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let store = Store::new(collaborators.persistence);
        store.load().await?;

        let bus = StatusBus::new(config.status_channel_capacity);
        let leases = Arc::new(UpnpLeaseManager::new(
            collaborators.router,
            config.mapping_description.clone(),
        ));

        let orchestrator = RemoteAccessOrchestrator::new(
            store.clone(),
            bus.clone(),
            Arc::new(StaticBackend::new(
                collaborators.proxy.clone(),
                collaborators.wan.clone(),
            )),
            Arc::new(UpnpBackend::new(leases.clone(), collaborators.wan)),
            config.upnp_renewal_interval(),
        );

        let router = Arc::new(EventRouter::new(
            store.clone(),
            Arc::new(orchestrator.clone()),
        ));
        let connection = ConnectionManager::new(
            collaborators.transport,
            store.clone(),
            bus.clone(),
            router,
            config.api_version.clone(),
        );

        let controller = Arc::new(ReconciliationController::new(
            store.clone(),
            connection.clone(),
            orchestrator.clone(),
            config.max_reconcile_passes,
        ));
        let upnp = Arc::new(UpnpReconciler::new(
            store.clone(),
            orchestrator.clone(),
            leases.clone(),
            config.upnp_settle_delay(),
        ));

        Ok(Self {
            store,
            bus,
            connection,
            orchestrator,
            leases,
            controller,
            upnp,
            proxy: collaborators.proxy,
        })
    }

    /// Shared state handle
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Relay connection
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Remote access orchestrator
    pub fn orchestrator(&self) -> &RemoteAccessOrchestrator {
        &self.orchestrator
    }

    /// UPnP lease manager
    pub fn leases(&self) -> &Arc<UpnpLeaseManager> {
        &self.leases
    }

    /// Reconciliation controller
    pub fn controller(&self) -> &Arc<ReconciliationController> {
        &self.controller
    }

    /// Subscribe to status notifications
    pub fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    /// Remote access status surface
    pub fn status(&self) -> RemoteAccessStatus {
        self.store.remote_access_status()
    }

    /// Relay connection status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Store a relay credential accepted by the external validation routine
    ///
    /// `None` removes the credential, which suspends the relay connection.
    pub async fn set_api_key(&self, api_key: Option<String>) -> Result<bool> {
        self.store.update_config(|c| c.api_key = api_key).await
    }

    /// Apply a settings mutation from the external API layer
    ///
    /// Invalid input is rejected before anything is written. Switching the
    /// type stops the running backend first; reconciliation then brings up
    /// whatever the new settings call for.
    pub async fn setup_remote_access(&self, input: SetupRemoteAccessInput) -> Result<()> {
        let requested = input.to_config()?;

        if requested.remote_access_type != self.store.remote_access().remote_access_type
            && self.orchestrator.active_type().await != RemoteAccessType::Disabled
        {
            tracing::info!(
                to = %requested.remote_access_type,
                "Remote access type changing, stopping running backend"
            );
            if let Err(e) = self.orchestrator.stop().await {
                tracing::warn!("Failed to stop running backend: {}", e);
            }
        }

        // Read after the stop, which may have cleared the WAN flag
        let current = self.store.remote_access();
        let wan_changed = current.wan_access_enabled != requested.wan_access_enabled;
        let next = RemoteAccessConfig {
            wan_port: requested.wan_port.or(current.wan_port),
            ..requested
        };

        self.store
            .update_config(|c| c.remote_access = next)
            .await?;
        tracing::info!(
            access_type = ?input.access_type,
            forward_type = ?input.forward_type,
            "Remote access settings updated"
        );

        if wan_changed {
            self.proxy.reload().await?;
        }
        Ok(())
    }

    /// Run the agent until SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the agent until `shutdown_rx` fires
    ///
    /// Used by the daemon (which owns signal handling) and by tests.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        tracing::info!("Connect agent starting");

        let cancel = CancellationToken::new();
        let upnp_loop = self.spawn_upnp_loop(cancel.clone());

        let mut config_rx = self.store.subscribe_config();
        let mut system_rx = self.store.subscribe_system();
        config_rx.borrow_and_update();
        system_rx.borrow_and_update();

        self.controller.reconcile().await;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to wait for CTRL-C: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.controller.reconcile().await;
                }
                changed = system_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.controller.reconcile().await;
                }
            }
        }

        cancel.cancel();
        if let Err(e) = upnp_loop.await {
            tracing::warn!("UPnP reconciliation task ended abnormally: {}", e);
        }

        self.shutdown().await
    }

    fn spawn_upnp_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let upnp = self.upnp.clone();
        let mut config_rx = self.store.subscribe_config();
        let mut system_rx = self.store.subscribe_system();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = system_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                upnp.reconcile(&cancel).await;
            }
        })
    }

    /// Disconnect, stop remote access, and flush configuration
    pub async fn shutdown(&self) -> Result<()> {
        self.connection.disconnect();
        if let Err(e) = self.orchestrator.stop().await {
            tracing::warn!("Failed to stop remote access during shutdown: {}", e);
        }
        self.store.flush().await?;
        tracing::info!("Configuration flushed, agent stopped");
        Ok(())
    }
}
