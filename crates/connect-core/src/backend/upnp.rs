// # UPnP Backend
//
// Remote access through a UPnP lease on the router.
//
// The local port follows the web server's security mode (HTTP port when SSL
// is off, HTTPS port otherwise). The public port the router hands out is
// written back into the configuration so the next lease prefers it.
//
// A lease failure during begin or extend, or a failure to record the
// allocated port, stops the backend before the error is surfaced; a
// half-open lease is never left behind.

use async_trait::async_trait;
use std::sync::Arc;

use super::{RemoteAccessBackend, TransitionContext, ensure_configured, resolve_wan_url};
use crate::bus::StatusEvent;
use crate::config::RemoteAccessType;
use crate::error::{Error, Result};
use crate::traits::{AccessUrl, WanResolver};
use crate::upnp::{Lease, UpnpLeaseManager};

/// UPnP lease backend
pub struct UpnpBackend {
    leases: Arc<UpnpLeaseManager>,
    wan: Arc<dyn WanResolver>,
}

impl UpnpBackend {
    /// Create a UPnP backend on top of a lease manager
    pub fn new(leases: Arc<UpnpLeaseManager>, wan: Arc<dyn WanResolver>) -> Self {
        Self { leases, wan }
    }

    async fn record_public_port(&self, ctx: &TransitionContext, lease: &Lease) -> Result<()> {
        ctx.store
            .update_config(|c| c.remote_access.wan_port = Some(lease.public_port))
            .await?;
        Ok(())
    }

    async fn stop_after_failure(&self, ctx: &TransitionContext, cause: &Error) {
        tracing::error!("UPnP remote access failed, stopping it: {}", cause);
        if let Err(e) = self.stop(ctx).await {
            tracing::warn!("Cleanup after UPnP failure also failed: {}", e);
        }
    }
}

#[async_trait]
impl RemoteAccessBackend for UpnpBackend {
    fn kind(&self) -> RemoteAccessType {
        RemoteAccessType::Upnp
    }

    async fn get_url(&self, _ctx: &TransitionContext) -> Option<AccessUrl> {
        let lease = self.leases.current().await?;
        resolve_wan_url(self.wan.as_ref(), lease.public_port).await
    }

    async fn begin(&self, ctx: &TransitionContext) -> Result<Option<AccessUrl>> {
        ensure_configured(ctx, RemoteAccessType::Upnp)?;

        let settings = ctx.store.remote_access();
        if !settings.upnp_enabled {
            return Err(Error::config("UPnP remote access requires UPnP to be enabled"));
        }

        let local_port = ctx.store.system().network.local_port();
        let lease = match self
            .leases
            .create_or_renew_with(local_port, settings.wan_port)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.stop_after_failure(ctx, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.record_public_port(ctx, &lease).await {
            self.stop_after_failure(ctx, &e).await;
            return Err(e);
        }
        tracing::info!(
            public_port = lease.public_port,
            local_port = lease.local_port,
            "UPnP remote access enabled"
        );

        let url = resolve_wan_url(self.wan.as_ref(), lease.public_port).await;
        ctx.bus.publish(StatusEvent::AccessEnabled {
            kind: RemoteAccessType::Upnp,
            url: url.clone(),
        });
        Ok(url)
    }

    async fn stop(&self, ctx: &TransitionContext) -> Result<()> {
        let removed = self.leases.remove_current().await;

        ctx.bus.publish(StatusEvent::AccessDisabled {
            kind: RemoteAccessType::Upnp,
        });

        match removed {
            Ok(Some(lease)) => {
                tracing::info!(public_port = lease.public_port, "UPnP remote access disabled");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn extend(&self, ctx: &TransitionContext) -> Result<()> {
        // Re-resolved each time so a security mode change moves the lease
        let local_port = ctx.store.system().network.local_port();

        match self.leases.create_or_renew(local_port).await {
            Ok(lease) => self.record_public_port(ctx, &lease).await,
            Err(e) => {
                self.stop_after_failure(ctx, &e).await;
                Err(e)
            }
        }
    }
}
