// # UPnP Reconciler
//
// Keeps a running UPnP lease consistent with the live system:
//
// - UPnP switched off while the UPnP backend runs: stop it
// - The local port implied by the security mode moved away from the
//   lease's local port: wait for the settle delay, re-read, and if the
//   move still stands (and the system is still ready) extend the lease,
//   which re-points it at the new local port
//
// The settle delay absorbs bursts of state updates (the security mode and
// port settings usually change together) so the lease is moved once. The
// delay is abandoned as soon as the agent shuts down.
// Type changes and overall enablement belong to the main controller.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteAccessType;
use crate::orchestrator::{RemoteAccessControl, RemoteAccessOrchestrator};
use crate::state::Store;
use crate::upnp::UpnpLeaseManager;

/// Reconciles UPnP-specific enablement and local port
pub struct UpnpReconciler {
    store: Store,
    orchestrator: RemoteAccessOrchestrator,
    leases: Arc<UpnpLeaseManager>,
    settle_delay: Duration,
}

impl UpnpReconciler {
    /// Create a UPnP reconciler
    pub fn new(
        store: Store,
        orchestrator: RemoteAccessOrchestrator,
        leases: Arc<UpnpLeaseManager>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            leases,
            settle_delay,
        }
    }

    /// Run one reconciliation pass
    ///
    /// Returns early, leaving the lease alone, once `cancel` fires.
    pub async fn reconcile(&self, cancel: &CancellationToken) {
        if self.orchestrator.active_type().await != RemoteAccessType::Upnp {
            return;
        }

        if !self.store.remote_access().upnp_enabled {
            tracing::info!("UPnP disabled, stopping UPnP remote access");
            if let Err(e) = self.orchestrator.stop().await {
                tracing::warn!("Failed to stop UPnP remote access: {}", e);
            }
            return;
        }

        let Some(lease) = self.leases.current().await else {
            return;
        };
        if self.store.system().network.local_port() == lease.local_port {
            return;
        }

        tracing::debug!(
            delay_ms = self.settle_delay.as_millis() as u64,
            "Local port changed, waiting for state to settle"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Shutting down, abandoning pending lease move");
                return;
            }
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        let system = self.store.system();
        let local_port = system.network.local_port();
        if !system.is_ready() || local_port == lease.local_port {
            tracing::debug!("Local port change did not settle, leaving lease alone");
            return;
        }
        if self.orchestrator.active_type().await != RemoteAccessType::Upnp {
            return;
        }

        tracing::info!(
            old_local_port = lease.local_port,
            local_port,
            "Moving UPnP lease to new local port"
        );
        if let Err(e) = self.orchestrator.extend().await {
            tracing::error!("Failed to move UPnP lease: {}", e);
        }
    }
}
