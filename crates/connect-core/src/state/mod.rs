//! Shared agent state
//!
//! [`Store`] is the single place the agent keeps cross-component state:
//!
//! - [`ConnectConfig`]: persisted settings, written through a [`ConfigStore`]
//! - [`SystemState`]: live system facts supplied by the host (readiness,
//!   identity, network security mode)
//! - [`RuntimeState`]: in-memory remote access status, reset at start
//!
//! Each section is a `tokio::sync::watch` channel. Writers only notify when
//! the value actually changed, so reconcilers can diff snapshots instead of
//! reacting to every write.
//!
//! Persistence implementations live in [`memory`] and [`file`].

pub mod memory;
pub mod file;

pub use memory::MemoryConfigStore;
pub use file::FileConfigStore;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

use crate::config::{ConnectConfig, RemoteAccessConfig, RemoteAccessType};
use crate::error::{Error, Result};
use crate::traits::{AccessUrl, ConfigStore, ConnectionParams};

/// Load status of a state section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Not loaded yet
    #[default]
    Unloaded,
    /// Loaded and usable
    Loaded,
}

/// How the local web server is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Plain HTTP only
    #[default]
    No,
    /// HTTPS with a self-signed or user certificate
    Yes,
    /// HTTPS with a provisioned certificate
    Auto,
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "no" => Ok(SslMode::No),
            "yes" => Ok(SslMode::Yes),
            "auto" => Ok(SslMode::Auto),
            other => Err(Error::config(format!(
                "Unknown SSL mode '{}'. Valid: no, yes, auto",
                other
            ))),
        }
    }
}

/// Network security settings of the local web server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSecurity {
    /// SSL mode
    pub ssl_mode: SslMode,
    /// Local HTTP port
    pub http_port: u16,
    /// Local HTTPS port
    pub https_port: u16,
}

impl Default for NetworkSecurity {
    fn default() -> Self {
        Self {
            ssl_mode: SslMode::No,
            http_port: 80,
            https_port: 443,
        }
    }
}

impl NetworkSecurity {
    /// Local port remote traffic should be forwarded to
    pub fn local_port(&self) -> u16 {
        match self.ssl_mode {
            SslMode::No => self.http_port,
            SslMode::Yes | SslMode::Auto => self.https_port,
        }
    }
}

/// Live system facts read by the agent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemState {
    /// Whether the persisted configuration has been loaded
    pub config_status: LoadStatus,
    /// Whether array/system state has been loaded
    pub array_status: LoadStatus,
    /// Hardware identity
    pub flash_guid: Option<String>,
    /// Appliance OS version
    pub server_version: Option<String>,
    /// Local web server exposure
    pub network: NetworkSecurity,
}

impl SystemState {
    /// Both configuration and system state are loaded
    pub fn is_ready(&self) -> bool {
        self.config_status == LoadStatus::Loaded && self.array_status == LoadStatus::Loaded
    }
}

/// In-memory remote access status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeState {
    /// Backend actually active right now
    pub running_type: RemoteAccessType,
    /// Last recorded failure
    pub error: Option<String>,
    /// URLs advertised by the relay
    pub allowed_urls: Vec<AccessUrl>,
}

/// Status exposed to the external API layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccessStatus {
    /// Backend actually active right now
    pub running_type: RemoteAccessType,
    /// Configured type
    pub enabled_type: RemoteAccessType,
    /// Last recorded failure
    pub error: Option<String>,
}

/// Cloneable handle to the shared agent state
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: watch::Sender<ConnectConfig>,
    system: watch::Sender<SystemState>,
    runtime: watch::Sender<RuntimeState>,
    persistence: Arc<dyn ConfigStore>,
    /// Keeps persisted writes in the same order as in-memory writes
    write_lock: Mutex<()>,
}

impl Store {
    /// Create a store with defaults; call [`Store::load`] before use
    pub fn new(persistence: Arc<dyn ConfigStore>) -> Self {
        let (config, _) = watch::channel(ConnectConfig::default());
        let (system, _) = watch::channel(SystemState::default());
        let (runtime, _) = watch::channel(RuntimeState::default());

        Self {
            inner: Arc::new(StoreInner {
                config,
                system,
                runtime,
                persistence,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Load persisted configuration and mark it ready
    ///
    /// First boot (nothing persisted) keeps safe defaults: remote access
    /// disabled, no WAN port, UPnP off.
    pub async fn load(&self) -> Result<()> {
        let loaded = self.inner.persistence.load().await?;
        let config = match loaded {
            Some(config) => {
                if let Err(e) = config.remote_access.validate() {
                    tracing::warn!("Persisted remote access settings are inconsistent: {}", e);
                }
                config
            }
            None => {
                tracing::info!("No persisted configuration, starting with defaults");
                ConnectConfig::default()
            }
        };

        self.inner.config.send_replace(config);
        self.inner.system.send_modify(|s| s.config_status = LoadStatus::Loaded);
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> ConnectConfig {
        self.inner.config.borrow().clone()
    }

    /// Current remote access settings
    pub fn remote_access(&self) -> RemoteAccessConfig {
        self.inner.config.borrow().remote_access.clone()
    }

    /// Current system state
    pub fn system(&self) -> SystemState {
        self.inner.system.borrow().clone()
    }

    /// Current runtime state
    pub fn runtime(&self) -> RuntimeState {
        self.inner.runtime.borrow().clone()
    }

    /// Subscribe to configuration changes
    pub fn subscribe_config(&self) -> watch::Receiver<ConnectConfig> {
        self.inner.config.subscribe()
    }

    /// Subscribe to system state changes
    pub fn subscribe_system(&self) -> watch::Receiver<SystemState> {
        self.inner.system.subscribe()
    }

    /// Subscribe to runtime state changes
    pub fn subscribe_runtime(&self) -> watch::Receiver<RuntimeState> {
        self.inner.runtime.subscribe()
    }

    /// Modify the configuration and persist it
    ///
    /// Returns `true` if the configuration changed. Subscribers are only
    /// notified (and the store only written) on an actual change.
    pub async fn update_config<F>(&self, modify: F) -> Result<bool>
    where
        F: FnOnce(&mut ConnectConfig),
    {
        let _guard = self.inner.write_lock.lock().await;

        let changed = self.inner.config.send_if_modified(|config| {
            let before = config.clone();
            modify(config);
            *config != before
        });

        if changed {
            let snapshot = self.config();
            self.inner.persistence.save(&snapshot).await?;
        }

        Ok(changed)
    }

    /// Modify the system state
    ///
    /// Called by the host integration when it observes new system facts.
    pub fn update_system<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut SystemState),
    {
        self.inner.system.send_if_modified(|system| {
            let before = system.clone();
            modify(system);
            *system != before
        })
    }

    /// Modify the runtime state
    ///
    /// Only orchestrator transitions write here.
    pub(crate) fn update_runtime<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut RuntimeState),
    {
        self.inner.runtime.send_if_modified(|runtime| {
            let before = runtime.clone();
            modify(runtime);
            *runtime != before
        })
    }

    /// Clear the stored relay credential
    ///
    /// Reconnection stays suspended until new credentials are supplied.
    pub async fn invalidate_credential(&self) -> Result<()> {
        let changed = self.update_config(|config| config.api_key = None).await?;
        if changed {
            tracing::warn!("Relay credential invalidated");
        }
        Ok(())
    }

    /// Connection parameters, if every identity field is populated
    pub fn connection_params(&self, api_version: &str) -> Option<ConnectionParams> {
        let config = self.inner.config.borrow();
        let system = self.inner.system.borrow();
        ConnectionParams::from_fields(
            config.api_key.as_deref(),
            system.flash_guid.as_deref(),
            Some(api_version),
            system.server_version.as_deref(),
        )
    }

    /// Status surface for the external API layer
    pub fn remote_access_status(&self) -> RemoteAccessStatus {
        let runtime = self.inner.runtime.borrow();
        RemoteAccessStatus {
            running_type: runtime.running_type,
            enabled_type: self.inner.config.borrow().remote_access.remote_access_type,
            error: runtime.error.clone(),
        }
    }

    /// Flush persisted configuration
    pub async fn flush(&self) -> Result<()> {
        self.inner.persistence.flush().await
    }
}
