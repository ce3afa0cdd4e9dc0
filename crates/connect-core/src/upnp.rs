//! UPnP lease management
//!
//! [`UpnpLeaseManager`] owns the single NAT port mapping the agent holds on
//! the router. A [`Lease`] is ephemeral: it is never persisted and is
//! recreated after a restart.
//!
//! ## Rules
//!
//! - Every mapping is requested with a fixed 6 hour TTL
//! - `create_or_renew` is idempotent: calling it again for the same local
//!   port refreshes the TTL on the same public port
//! - Moving to a different local port removes the old mapping first
//! - Failures are returned to the caller, never retried here; the
//!   orchestrator decides whether to stop the backend

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::validate_port;
use crate::error::{Error, Result};
use crate::traits::{NatRouter, PortMapping};

/// TTL requested for every mapping (6 hours)
pub const LEASE_TTL_SECS: u64 = 6 * 60 * 60;

/// Range random public ports are drawn from
pub const PUBLIC_PORT_RANGE: RangeInclusive<u16> = 35_000..=65_000;

const MAX_PORT_PICK_ATTEMPTS: usize = 64;

/// A time-bounded port mapping held on the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Local port traffic is forwarded to
    pub local_port: u16,
    /// Public port on the router
    pub public_port: u16,
    /// Requested lifetime
    pub ttl_seconds: u64,
    /// When the mapping was first created
    pub created_at: DateTime<Utc>,
    /// When the mapping was last refreshed
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    fn new(local_port: u16, public_port: u16) -> Self {
        let now = Utc::now();
        Self {
            local_port,
            public_port,
            ttl_seconds: LEASE_TTL_SECS,
            created_at: now,
            renewed_at: now,
        }
    }

    /// Requested lifetime as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// When the router will drop the mapping unless renewed
    pub fn expires_at(&self) -> DateTime<Utc> {
        // ttl_seconds is bounded by LEASE_TTL_SECS, far inside i64
        self.renewed_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

/// Creates, renews, and removes the agent's router mapping
pub struct UpnpLeaseManager {
    router: Arc<dyn NatRouter>,
    description: String,
    current: Mutex<Option<Lease>>,
}

impl UpnpLeaseManager {
    /// Create a lease manager on top of a router
    pub fn new(router: Arc<dyn NatRouter>, description: impl Into<String>) -> Self {
        Self {
            router,
            description: description.into(),
            current: Mutex::new(None),
        }
    }

    /// Create a mapping for `local_port`, or refresh the existing one
    pub async fn create_or_renew(&self, local_port: u16) -> Result<Lease> {
        self.create_or_renew_with(local_port, None).await
    }

    /// Like [`create_or_renew`](Self::create_or_renew), preferring a public port
    ///
    /// The preferred port is used when no lease exists yet and the router
    /// does not already map it to a different local port.
    pub async fn create_or_renew_with(
        &self,
        local_port: u16,
        preferred_public: Option<u16>,
    ) -> Result<Lease> {
        let local_port = validate_port(local_port)?;
        let preferred_public = preferred_public.map(validate_port).transpose()?;
        let ttl = Duration::from_secs(LEASE_TTL_SECS);

        let mut current = self.current.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.local_port == local_port {
                self.router
                    .create_mapping(existing.public_port, local_port, &self.description, ttl)
                    .await?;

                let mut renewed = existing.clone();
                renewed.renewed_at = Utc::now();
                tracing::debug!(
                    public_port = renewed.public_port,
                    local_port,
                    "UPnP lease renewed"
                );
                *current = Some(renewed.clone());
                return Ok(renewed);
            }

            tracing::info!(
                old_local_port = existing.local_port,
                local_port,
                "Local port changed, replacing UPnP lease"
            );
            if let Err(e) = self
                .router
                .remove_mapping(existing.public_port, existing.local_port)
                .await
            {
                tracing::warn!("Failed to remove previous UPnP mapping: {}", e);
            }
            // Keep the public port stable across a local port change
            let previous_public = existing.public_port;
            *current = None;
            return self
                .create_locked(&mut current, local_port, Some(previous_public), ttl)
                .await;
        }

        self.create_locked(&mut current, local_port, preferred_public, ttl)
            .await
    }

    async fn create_locked(
        &self,
        current: &mut Option<Lease>,
        local_port: u16,
        preferred_public: Option<u16>,
        ttl: Duration,
    ) -> Result<Lease> {
        let public_port = self.pick_public_port(local_port, preferred_public).await?;

        self.router
            .create_mapping(public_port, local_port, &self.description, ttl)
            .await?;

        let lease = Lease::new(local_port, public_port);
        tracing::info!(public_port, local_port, "UPnP lease created");
        *current = Some(lease.clone());
        Ok(lease)
    }

    /// Remove a lease from the router
    ///
    /// The lease is forgotten locally even if the router call fails; the
    /// router drops it on its own once the TTL elapses.
    pub async fn remove(&self, lease: &Lease) -> Result<()> {
        {
            let mut current = self.current.lock().await;
            if current.as_ref().map(|l| l.public_port) == Some(lease.public_port) {
                *current = None;
            }
        }

        self.router
            .remove_mapping(lease.public_port, lease.local_port)
            .await?;
        tracing::info!(public_port = lease.public_port, "UPnP lease removed");
        Ok(())
    }

    /// Remove the current lease, if any
    pub async fn remove_current(&self) -> Result<Option<Lease>> {
        let lease = self.current.lock().await.clone();
        match lease {
            Some(lease) => {
                self.remove(&lease).await?;
                Ok(Some(lease))
            }
            None => Ok(None),
        }
    }

    /// The lease currently held, if any
    pub async fn current(&self) -> Option<Lease> {
        self.current.lock().await.clone()
    }

    /// The router's current mappings
    pub async fn list_mappings(&self) -> Result<Vec<PortMapping>> {
        self.router.list_mappings().await
    }

    async fn pick_public_port(&self, local_port: u16, preferred: Option<u16>) -> Result<u16> {
        let mappings = match self.router.list_mappings().await {
            Ok(mappings) => mappings,
            Err(e) => {
                tracing::warn!("Could not list router mappings, assuming none: {}", e);
                Vec::new()
            }
        };

        if let Some(port) = preferred {
            let taken_by_other = mappings
                .iter()
                .any(|m| m.public_port == port && m.private_port != local_port);
            if !taken_by_other {
                return Ok(port);
            }
            tracing::info!(port, "Preferred public port is taken, picking another");
        }

        let used: HashSet<u16> = mappings.iter().map(|m| m.public_port).collect();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_PORT_PICK_ATTEMPTS {
            let candidate = rng.gen_range(PUBLIC_PORT_RANGE);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::router("No free public port available on router"))
    }
}
