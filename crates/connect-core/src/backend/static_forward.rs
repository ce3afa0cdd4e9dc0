// # Static Backend
//
// Remote access through a port the user forwarded on the router by hand.
//
// Opening access means flipping `wan_access_enabled` on and reloading the
// reverse proxy so it starts listening on the WAN side; closing does the
// reverse. The router itself is never touched. If the reload fails while
// opening, the flag is put back to what it was so the stored configuration
// never claims WAN access that is not being served.

use async_trait::async_trait;
use std::sync::Arc;

use super::{RemoteAccessBackend, TransitionContext, ensure_configured, resolve_wan_url};
use crate::bus::StatusEvent;
use crate::config::RemoteAccessType;
use crate::error::{Error, Result};
use crate::traits::{AccessUrl, ReverseProxy, WanResolver};

/// Statically forwarded WAN port backend
pub struct StaticBackend {
    proxy: Arc<dyn ReverseProxy>,
    wan: Arc<dyn WanResolver>,
}

impl StaticBackend {
    /// Create a static backend
    pub fn new(proxy: Arc<dyn ReverseProxy>, wan: Arc<dyn WanResolver>) -> Self {
        Self { proxy, wan }
    }

    async fn store_wan_access(&self, ctx: &TransitionContext, enabled: bool) -> Result<()> {
        ctx.store
            .update_config(|c| c.remote_access.wan_access_enabled = enabled)
            .await?;
        Ok(())
    }

    async fn set_wan_access(&self, ctx: &TransitionContext, enabled: bool) -> Result<()> {
        self.store_wan_access(ctx, enabled).await?;
        self.proxy.reload().await
    }
}

#[async_trait]
impl RemoteAccessBackend for StaticBackend {
    fn kind(&self) -> RemoteAccessType {
        RemoteAccessType::Static
    }

    async fn get_url(&self, ctx: &TransitionContext) -> Option<AccessUrl> {
        let port = ctx.store.remote_access().wan_port?;
        resolve_wan_url(self.wan.as_ref(), port).await
    }

    async fn begin(&self, ctx: &TransitionContext) -> Result<Option<AccessUrl>> {
        ensure_configured(ctx, RemoteAccessType::Static)?;

        let Some(port) = ctx.store.remote_access().wan_port else {
            return Err(Error::config(
                "Static remote access requires a WAN port to be configured",
            ));
        };

        let previous = ctx.store.remote_access().wan_access_enabled;
        self.store_wan_access(ctx, true).await?;
        if let Err(e) = self.proxy.reload().await {
            tracing::error!("Reverse proxy reload failed, reverting WAN access: {}", e);
            if let Err(restore) = self.store_wan_access(ctx, previous).await {
                tracing::warn!("Failed to restore WAN access flag: {}", restore);
            }
            return Err(e);
        }
        tracing::info!(wan_port = port, "Static remote access enabled");

        let url = self.get_url(ctx).await;
        ctx.bus.publish(StatusEvent::AccessEnabled {
            kind: RemoteAccessType::Static,
            url: url.clone(),
        });
        Ok(url)
    }

    async fn stop(&self, ctx: &TransitionContext) -> Result<()> {
        self.set_wan_access(ctx, false).await?;
        tracing::info!("Static remote access disabled");

        ctx.bus.publish(StatusEvent::AccessDisabled {
            kind: RemoteAccessType::Static,
        });
        Ok(())
    }
}
