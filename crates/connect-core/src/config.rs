//! Configuration types for the connect agent
//!
//! Two kinds of configuration live here:
//! - [`ConnectConfig`]: the persisted, user-facing remote access settings
//!   (plus the relay credential), mutated by the settings API and by the
//!   orchestrator writing back an allocated port.
//! - [`AgentConfig`]: process-level tuning knobs (relay endpoint, timers,
//!   channel capacities) supplied by the daemon at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which remote access strategy is configured (or running)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteAccessType {
    /// No dynamic remote access
    #[default]
    Disabled,
    /// Statically forwarded WAN port
    Static,
    /// Automatic NAT traversal via a UPnP lease
    Upnp,
}

impl fmt::Display for RemoteAccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteAccessType::Disabled => "DISABLED",
            RemoteAccessType::Static => "STATIC",
            RemoteAccessType::Upnp => "UPNP",
        };
        f.write_str(name)
    }
}

/// Persisted remote access settings
///
/// Invariant: `remote_access_type == Upnp` implies `upnp_enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAccessConfig {
    /// Whether the reverse proxy exposes the WAN listener
    #[serde(default)]
    pub wan_access_enabled: bool,

    /// Public WAN port (statically forwarded, or allocated by UPnP)
    #[serde(default)]
    pub wan_port: Option<u16>,

    /// Whether UPnP forwarding is allowed
    #[serde(default)]
    pub upnp_enabled: bool,

    /// Configured dynamic remote access strategy
    #[serde(default)]
    pub remote_access_type: RemoteAccessType,
}

impl RemoteAccessConfig {
    /// Check the cross-field invariants of the persisted settings
    pub fn validate(&self) -> Result<()> {
        if self.remote_access_type == RemoteAccessType::Upnp && !self.upnp_enabled {
            return Err(Error::config(
                "UPNP remote access requires upnp_enabled to be set",
            ));
        }
        if let Some(port) = self.wan_port {
            validate_port(port)?;
        }
        Ok(())
    }
}

/// Everything the agent persists between restarts
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Remote access settings
    #[serde(default)]
    pub remote_access: RemoteAccessConfig,

    /// Credential used to authenticate to the relay
    /// ⚠️ NEVER log this value
    #[serde(default)]
    pub api_key: Option<String>,
}

// Custom Debug implementation that hides the API key
impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("remote_access", &self.remote_access)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// Access mode requested through the settings API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    /// Remote access off
    Disabled,
    /// WAN access always on (not managed dynamically)
    Always,
    /// Dynamic remote access, opened on demand by the relay
    Predicate,
}

/// Forwarding strategy requested through the settings API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardType {
    /// User forwarded a port on the router
    Static,
    /// Agent opens a UPnP lease
    Upnp,
}

/// Settings-mutation input accepted from the external API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRemoteAccessInput {
    /// Requested access mode
    pub access_type: AccessMode,
    /// Requested forwarding strategy
    #[serde(default)]
    pub forward_type: Option<ForwardType>,
    /// Requested WAN port
    #[serde(default)]
    pub port: Option<u32>,
}

impl SetupRemoteAccessInput {
    /// Map the requested mode onto the dynamic remote access type
    pub fn remote_access_type(&self) -> RemoteAccessType {
        match self.access_type {
            AccessMode::Disabled | AccessMode::Always => RemoteAccessType::Disabled,
            AccessMode::Predicate => match self.forward_type {
                Some(ForwardType::Upnp) => RemoteAccessType::Upnp,
                _ => RemoteAccessType::Static,
            },
        }
    }

    /// Validate the input and produce the settings it describes
    ///
    /// Rejections happen here, before anything is written or any backend
    /// is touched.
    pub fn to_config(&self) -> Result<RemoteAccessConfig> {
        let wan_port = match self.port {
            Some(port) => Some(port_from_u32(port)?),
            None => None,
        };

        // PREDICATE without a forward type runs STATIC; ALWAYS only needs a
        // port when static forwarding was asked for explicitly
        let static_forward = match self.access_type {
            AccessMode::Disabled => false,
            AccessMode::Always => self.forward_type == Some(ForwardType::Static),
            AccessMode::Predicate => self.forward_type != Some(ForwardType::Upnp),
        };
        if static_forward && wan_port.is_none() {
            return Err(Error::config(
                "A WAN port is required when using a static forward type",
            ));
        }

        Ok(RemoteAccessConfig {
            wan_access_enabled: self.access_type == AccessMode::Always,
            wan_port,
            upnp_enabled: self.forward_type == Some(ForwardType::Upnp)
                && self.access_type != AccessMode::Disabled,
            remote_access_type: self.remote_access_type(),
        })
    }
}

/// Validate that a port is usable (non-zero)
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(Error::config("Port must be a positive integer, got 0"));
    }
    Ok(port)
}

/// Parse a port from its textual form
///
/// A non-numeric value is a configuration error, never a network error.
pub fn parse_port(raw: &str) -> Result<u16> {
    let trimmed = raw.trim();
    let value: u32 = trimmed
        .parse()
        .map_err(|_| Error::config(format!("Port must be a positive integer, got '{}'", trimmed)))?;
    port_from_u32(value)
}

fn port_from_u32(value: u32) -> Result<u16> {
    let port = u16::try_from(value)
        .map_err(|_| Error::config(format!("Port out of range: {}", value)))?;
    validate_port(port)
}

/// Process-level agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay endpoint (e.g. `wss://relay.example.net/ws`)
    pub relay_url: String,

    /// Version string of this agent, sent as `x-unraid-api-version`
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Capacity of each status bus subscriber queue
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,

    /// Interval between UPnP lease renewals (in seconds)
    ///
    /// Must be strictly shorter than the 6 hour lease TTL.
    #[serde(default = "default_upnp_renewal_secs")]
    pub upnp_renewal_secs: u64,

    /// Delay before re-checking array-derived values in the UPnP reconciler
    #[serde(default = "default_upnp_settle_secs")]
    pub upnp_settle_secs: u64,

    /// Upper bound on back-to-back reconciliation passes for one trigger
    #[serde(default = "default_max_reconcile_passes")]
    pub max_reconcile_passes: usize,

    /// Description attached to router port mappings
    #[serde(default = "default_mapping_description")]
    pub mapping_description: String,
}

impl AgentConfig {
    /// Create a configuration for the given relay endpoint with defaults
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            api_version: default_api_version(),
            status_channel_capacity: default_status_channel_capacity(),
            upnp_renewal_secs: default_upnp_renewal_secs(),
            upnp_settle_secs: default_upnp_settle_secs(),
            max_reconcile_passes: default_max_reconcile_passes(),
            mapping_description: default_mapping_description(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            return Err(Error::config("Relay URL cannot be empty"));
        }
        url::Url::parse(&self.relay_url)
            .map_err(|e| Error::config(format!("Invalid relay URL '{}': {}", self.relay_url, e)))?;
        if self.api_version.is_empty() {
            return Err(Error::config("API version cannot be empty"));
        }
        if self.status_channel_capacity == 0 {
            return Err(Error::config("Status channel capacity must be > 0"));
        }
        if self.upnp_renewal_secs == 0 || self.upnp_renewal_secs >= crate::upnp::LEASE_TTL_SECS {
            return Err(Error::config(format!(
                "UPnP renewal interval must be between 1 and {} seconds, got {}",
                crate::upnp::LEASE_TTL_SECS - 1,
                self.upnp_renewal_secs
            )));
        }
        if self.max_reconcile_passes == 0 {
            return Err(Error::config("Reconcile pass limit must be > 0"));
        }
        Ok(())
    }

    /// UPnP renewal cadence
    pub fn upnp_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.upnp_renewal_secs)
    }

    /// UPnP settle delay
    pub fn upnp_settle_delay(&self) -> Duration {
        Duration::from_secs(self.upnp_settle_secs)
    }
}

fn default_api_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_status_channel_capacity() -> usize {
    64
}

fn default_upnp_renewal_secs() -> u64 {
    30 * 60
}

fn default_upnp_settle_secs() -> u64 {
    5
}

fn default_max_reconcile_passes() -> usize {
    4
}

fn default_mapping_description() -> String {
    "connect remote access".to_string()
}
