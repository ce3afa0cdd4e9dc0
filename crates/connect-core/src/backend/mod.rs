//! Remote access backends
//!
//! A backend is one strategy for opening remote access:
//!
//! - [`StaticBackend`]: the user forwarded a WAN port on the router; the
//!   backend toggles the WAN-access flag and reloads the reverse proxy
//! - [`UpnpBackend`]: the agent holds a UPnP lease on the router
//!
//! Backends never run on their own. The orchestrator drives them and hands
//! them a [`TransitionContext`], which is the only way they reach shared
//! state: configuration writes happen inside a serialized transition.

pub mod static_forward;
pub mod upnp;

pub use static_forward::StaticBackend;
pub use upnp::UpnpBackend;

use async_trait::async_trait;
use std::net::IpAddr;
use url::Url;

use crate::bus::StatusBus;
use crate::config::RemoteAccessType;
use crate::error::{Error, Result};
use crate::state::Store;
use crate::traits::{AccessUrl, WanResolver};

/// Shared state handed to a backend for the duration of one transition
#[derive(Clone)]
pub struct TransitionContext {
    /// Agent state
    pub store: Store,
    /// Status notifications
    pub bus: StatusBus,
}

/// Trait for remote access strategies
///
/// # Contract
///
/// - `begin` fails with [`Error::TypeMismatch`] when the configured type is
///   not the backend's own type
/// - `stop` is safe to call when nothing is open
/// - `extend` only does something for lease-based backends
#[async_trait]
pub trait RemoteAccessBackend: Send + Sync {
    /// Type this backend implements
    fn kind(&self) -> RemoteAccessType;

    /// URL remote clients should use, if access is open
    async fn get_url(&self, ctx: &TransitionContext) -> Option<AccessUrl>;

    /// Open remote access
    async fn begin(&self, ctx: &TransitionContext) -> Result<Option<AccessUrl>>;

    /// Close remote access
    async fn stop(&self, ctx: &TransitionContext) -> Result<()>;

    /// Keep remote access open
    async fn extend(&self, _ctx: &TransitionContext) -> Result<()> {
        Ok(())
    }
}

/// Fail unless the configured type is `expected`
pub(crate) fn ensure_configured(ctx: &TransitionContext, expected: RemoteAccessType) -> Result<()> {
    let actual = ctx.store.remote_access().remote_access_type;
    if actual != expected {
        return Err(Error::TypeMismatch { expected, actual });
    }
    Ok(())
}

/// Build the externally reachable URL for a WAN port
pub(crate) async fn resolve_wan_url(wan: &dyn WanResolver, port: u16) -> Option<AccessUrl> {
    let ip = match wan.public_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("Could not resolve WAN address: {}", e);
            return None;
        }
    };

    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };

    match Url::parse(&format!("https://{}:{}", host, port)) {
        Ok(url) if ip.is_ipv6() => {
            let mut access = AccessUrl::wan(url);
            access.ipv6 = access.ipv4.take();
            Some(access)
        }
        Ok(url) => Some(AccessUrl::wan(url)),
        Err(e) => {
            tracing::warn!("Could not build WAN URL for {}:{}: {}", host, port, e);
            None
        }
    }
}
