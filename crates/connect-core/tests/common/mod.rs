//! Test doubles and common utilities for architecture contract tests
//!
//! This module provides minimal test doubles for every collaborator of the
//! agent plus a harness that runs a complete agent against them.

#![allow(dead_code)]

use async_trait::async_trait;
use connect_core::config::{ConnectConfig, RemoteAccessType};
use connect_core::error::{Error, Result};
use connect_core::orchestrator::RemoteAccessControl;
use connect_core::state::{LoadStatus, MemoryConfigStore};
use connect_core::traits::{
    AccessUrl, ConfigStore, ConnectionParams, MappingProtocol, NatRouter, PortMapping, RelayMessage,
    RelayStream, RelayTransport, RemoteAccessEvent, RemoteAccessEventType, ReverseProxy,
    WanResolver,
};
use connect_core::{AgentConfig, Collaborators, ConnectAgent, ConnectionState};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Credential configured in every harness
pub const API_KEY: &str = "K";

/// Public IP reported by [`FixedWan`]
pub const WAN_IP: [u8; 4] = [203, 0, 113, 7];

/// A relay transport whose connections are driven by the test
#[derive(Default)]
pub struct ControlledTransport {
    sessions: Mutex<Vec<mpsc::UnboundedSender<RelayMessage>>>,
    params: Mutex<Vec<ConnectionParams>>,
    failures: Mutex<VecDeque<Error>>,
}

impl ControlledTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of times open() was called
    pub fn open_count(&self) -> usize {
        self.params.lock().unwrap().len()
    }

    /// Parameters of every open() call
    pub fn opened_params(&self) -> Vec<ConnectionParams> {
        self.params.lock().unwrap().clone()
    }

    /// Sender for the most recently opened connection
    pub fn latest(&self) -> mpsc::UnboundedSender<RelayMessage> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened yet")
    }

    /// Sender for the n-th opened connection
    pub fn session(&self, index: usize) -> mpsc::UnboundedSender<RelayMessage> {
        self.sessions.lock().unwrap()[index].clone()
    }

    /// Make the next open() fail with `error`
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Push a message into the latest connection
    pub fn send(&self, message: RelayMessage) {
        let _ = self.latest().send(message);
    }
}

#[async_trait]
impl RelayTransport for ControlledTransport {
    async fn open(&self, params: &ConnectionParams) -> Result<RelayStream> {
        self.params.lock().unwrap().push(params.clone());

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            // Failed attempts get a placeholder session so indexes line up
            let (tx, _rx) = mpsc::unbounded_channel();
            self.sessions.lock().unwrap().push(tx);
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// An in-memory router recording every call
#[derive(Default)]
pub struct MockRouter {
    mappings: Mutex<Vec<PortMapping>>,
    creates: AtomicUsize,
    removed: Mutex<Vec<u16>>,
    fail_create: AtomicBool,
}

impl MockRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of successful create_mapping() calls
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Public ports passed to remove_mapping()
    pub fn removed(&self) -> Vec<u16> {
        self.removed.lock().unwrap().clone()
    }

    /// Current mappings
    pub fn mappings(&self) -> Vec<PortMapping> {
        self.mappings.lock().unwrap().clone()
    }

    /// Make create_mapping() fail from now on
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NatRouter for MockRouter {
    async fn create_mapping(
        &self,
        public_port: u16,
        private_port: u16,
        description: &str,
        ttl: Duration,
    ) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::router("mapping refused by router"));
        }
        let mut mappings = self.mappings.lock().unwrap();
        mappings.retain(|m| m.public_port != public_port);
        mappings.push(PortMapping {
            public_port,
            private_port,
            private_host: Some("192.168.1.10".to_string()),
            protocol: MappingProtocol::Tcp,
            description: description.to_string(),
            ttl: Some(ttl),
        });
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_mapping(&self, public_port: u16, _private_port: u16) -> Result<()> {
        self.mappings
            .lock()
            .unwrap()
            .retain(|m| m.public_port != public_port);
        self.removed.lock().unwrap().push(public_port);
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<PortMapping>> {
        Ok(self.mappings())
    }
}

/// A reverse proxy counting reloads
#[derive(Default)]
pub struct CountingProxy {
    reloads: AtomicUsize,
    fail_reload: AtomicBool,
}

impl CountingProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Make reload() fail from now on
    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReverseProxy for CountingProxy {
    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(Error::proxy("reload command exited with 1"));
        }
        Ok(())
    }
}

/// A WAN resolver returning a fixed address
pub struct FixedWan;

#[async_trait]
impl WanResolver for FixedWan {
    async fn public_ip(&self) -> Result<IpAddr> {
        Ok(IpAddr::from(WAN_IP))
    }
}

/// A config store that counts flushes on top of an in-memory store
#[derive(Default)]
pub struct TrackingConfigStore {
    inner: MemoryConfigStore,
    flushes: AtomicUsize,
    fail_save: AtomicBool,
}

impl TrackingConfigStore {
    pub fn with_config(config: ConnectConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryConfigStore::with_config(config),
            flushes: AtomicUsize::new(0),
            fail_save: AtomicBool::new(false),
        })
    }

    /// Configuration as last persisted
    pub async fn saved(&self) -> Option<ConnectConfig> {
        self.inner.load().await.expect("memory store load succeeds")
    }

    pub fn save_count(&self) -> usize {
        self.inner.save_count()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Make save() fail from now on
    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigStore for TrackingConfigStore {
    async fn load(&self) -> Result<Option<ConnectConfig>> {
        self.inner.load().await
    }

    async fn save(&self, config: &ConnectConfig) -> Result<()> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(Error::Persistence("disk full".to_string()));
        }
        self.inner.save(config).await
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A remote access control recording every call
#[derive(Default)]
pub struct SpyControl {
    calls: Mutex<Vec<String>>,
}

impl SpyControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteAccessControl for SpyControl {
    async fn begin(&self, kind: RemoteAccessType) -> Result<Option<AccessUrl>> {
        self.calls.lock().unwrap().push(format!("begin:{}", kind));
        Ok(None)
    }

    async fn extend(&self) -> Result<()> {
        self.calls.lock().unwrap().push("extend".to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.lock().unwrap().push("stop".to_string());
        Ok(())
    }

    async fn record_allowed_url(&self, _url: AccessUrl) {
        self.calls.lock().unwrap().push("record_url".to_string());
    }
}

/// Relay message carrying a control event for `API_KEY`
pub fn event(kind: RemoteAccessEventType) -> RelayMessage {
    RelayMessage::Event(RemoteAccessEvent::new(kind, API_KEY))
}

/// Relay disconnect message
pub fn disconnected(code: u16) -> RelayMessage {
    RelayMessage::Disconnected {
        code,
        reason: String::new(),
    }
}

/// Saved configuration for STATIC remote access
pub fn static_config(wan_port: u16) -> ConnectConfig {
    let mut config = ConnectConfig::default();
    config.api_key = Some(API_KEY.to_string());
    config.remote_access.remote_access_type = RemoteAccessType::Static;
    config.remote_access.wan_port = Some(wan_port);
    config
}

/// Saved configuration for UPNP remote access
pub fn upnp_config() -> ConnectConfig {
    let mut config = ConnectConfig::default();
    config.api_key = Some(API_KEY.to_string());
    config.remote_access.remote_access_type = RemoteAccessType::Upnp;
    config.remote_access.upnp_enabled = true;
    config
}

/// Agent settings used by the harness
pub fn agent_config() -> AgentConfig {
    let mut config = AgentConfig::new("wss://relay.test/ws");
    config.api_version = "4.0.0".to_string();
    config
}

/// Poll `condition` until it holds, failing after a bounded wait
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A running agent wired to test doubles
pub struct Harness {
    pub agent: Arc<ConnectAgent>,
    pub transport: Arc<ControlledTransport>,
    pub router: Arc<MockRouter>,
    pub proxy: Arc<CountingProxy>,
    pub persistence: Arc<TrackingConfigStore>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Harness {
    /// Start an agent with `config` already persisted
    pub async fn start(config: ConnectConfig) -> Self {
        Self::start_with(config, agent_config()).await
    }

    /// Start an agent with custom agent settings
    pub async fn start_with(config: ConnectConfig, agent_config: AgentConfig) -> Self {
        let transport = ControlledTransport::new();
        let router = MockRouter::new();
        let proxy = CountingProxy::new();
        let persistence = TrackingConfigStore::with_config(config);

        let agent = ConnectAgent::new(
            agent_config,
            Collaborators {
                transport: transport.clone(),
                router: router.clone(),
                proxy: proxy.clone(),
                wan: Arc::new(FixedWan),
                persistence: persistence.clone(),
            },
        )
        .await
        .expect("agent construction succeeds");
        let agent = Arc::new(agent);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = agent.clone();
        let handle = tokio::spawn(async move { runner.run_with_shutdown(Some(shutdown_rx)).await });

        // Wait for startup
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            agent,
            transport,
            router,
            proxy,
            persistence,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Report the system as loaded with a complete identity
    pub fn mark_ready(&self) {
        self.agent.store().update_system(|system| {
            system.config_status = LoadStatus::Loaded;
            system.array_status = LoadStatus::Loaded;
            system.flash_guid = Some("0781-5571-0000-000000000001".to_string());
            system.server_version = Some("7.0.0".to_string());
        });
    }

    /// Mark ready and wait until the relay connection is up
    pub async fn connect(&self) {
        self.mark_ready();
        self.wait_connected().await;
    }

    /// Wait until the relay connection is up
    pub async fn wait_connected(&self) {
        let agent = self.agent.clone();
        wait_for("relay connection", move || {
            agent.connection_status().state == ConnectionState::Connected
        })
        .await;
    }

    /// Wait until the running type is `kind`
    pub async fn wait_running(&self, kind: RemoteAccessType) {
        let agent = self.agent.clone();
        wait_for(&format!("running type {}", kind), move || {
            agent.status().running_type == kind
        })
        .await;
    }

    /// Send the shutdown signal and wait for the agent to stop
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let handle = self.handle.take().expect("agent is running");
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("agent should stop within 10 seconds")
            .expect("agent task should not panic")
    }
}
