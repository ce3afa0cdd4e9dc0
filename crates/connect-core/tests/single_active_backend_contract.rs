//! Architectural Contract Test: Single Active Backend
//!
//! This test verifies that at most one remote access backend is active at
//! any instant and that transitions are serialized.
//!
//! Constraints verified:
//! - Switching type fully stops the previous backend before the next begins
//! - Concurrent begin/stop requests never overlap inside a backend
//! - A failed begin leaves remote access DISABLED with the error recorded
//! - stop with nothing active touches no backend
//!
//! If this test fails, someone has added:
//! - Transitions that bypass the orchestrator lock
//! - Fire-and-forget backend calls
//! - Runtime state written outside a transition

mod common;

use async_trait::async_trait;
use common::*;
use connect_core::backend::{RemoteAccessBackend, TransitionContext};
use connect_core::config::{ConnectConfig, RemoteAccessType};
use connect_core::error::{Error, Result};
use connect_core::orchestrator::RemoteAccessControl;
use connect_core::traits::AccessUrl;
use connect_core::{RemoteAccessOrchestrator, StatusBus, Store};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared probe recording call order and concurrent activity
#[derive(Default)]
struct Probe {
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    inside: AtomicUsize,
    max_inside: AtomicUsize,
}

impl Probe {
    fn enter(&self) {
        let inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(inside, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

struct ProbeBackend {
    kind: RemoteAccessType,
    probe: Arc<Probe>,
    fail_begin: AtomicBool,
}

impl ProbeBackend {
    fn new(kind: RemoteAccessType, probe: Arc<Probe>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            probe,
            fail_begin: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RemoteAccessBackend for ProbeBackend {
    fn kind(&self) -> RemoteAccessType {
        self.kind
    }

    async fn get_url(&self, _ctx: &TransitionContext) -> Option<AccessUrl> {
        None
    }

    async fn begin(&self, _ctx: &TransitionContext) -> Result<Option<AccessUrl>> {
        self.probe.enter();
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.probe.log.lock().unwrap().push(format!("begin:{}", self.kind));

        let result = if self.fail_begin.load(Ordering::SeqCst) {
            Err(Error::router("no gateway"))
        } else {
            let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_active.fetch_max(active, Ordering::SeqCst);
            Ok(None)
        };
        self.probe.leave();
        result
    }

    async fn stop(&self, _ctx: &TransitionContext) -> Result<()> {
        self.probe.enter();
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.probe.log.lock().unwrap().push(format!("stop:{}", self.kind));
        let _ = self
            .probe
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.probe.leave();
        Ok(())
    }

    async fn extend(&self, _ctx: &TransitionContext) -> Result<()> {
        self.probe.log.lock().unwrap().push(format!("extend:{}", self.kind));
        Ok(())
    }
}

struct Fixture {
    store: Store,
    orchestrator: RemoteAccessOrchestrator,
    probe: Arc<Probe>,
    upnp: Arc<ProbeBackend>,
}

async fn fixture(kind: RemoteAccessType) -> Fixture {
    let mut config = ConnectConfig::default();
    config.remote_access.remote_access_type = kind;
    config.remote_access.upnp_enabled = kind == RemoteAccessType::Upnp;
    let store = Store::new(TrackingConfigStore::with_config(config));
    store.load().await.expect("load succeeds");

    let probe = Arc::new(Probe::default());
    let static_backend = ProbeBackend::new(RemoteAccessType::Static, probe.clone());
    let upnp = ProbeBackend::new(RemoteAccessType::Upnp, probe.clone());
    let orchestrator = RemoteAccessOrchestrator::new(
        store.clone(),
        StatusBus::new(16),
        static_backend,
        upnp.clone(),
        Duration::from_secs(30 * 60),
    );

    Fixture {
        store,
        orchestrator,
        probe,
        upnp,
    }
}

async fn configure(store: &Store, kind: RemoteAccessType) {
    store
        .update_config(|config| {
            config.remote_access.remote_access_type = kind;
            config.remote_access.upnp_enabled = kind == RemoteAccessType::Upnp;
        })
        .await
        .expect("config update succeeds");
}

#[tokio::test]
async fn switching_type_stops_previous_first() {
    let f = fixture(RemoteAccessType::Static).await;

    f.orchestrator
        .begin(RemoteAccessType::Static)
        .await
        .expect("static begins");
    configure(&f.store, RemoteAccessType::Upnp).await;
    f.orchestrator
        .begin(RemoteAccessType::Upnp)
        .await
        .expect("upnp begins");

    assert_eq!(
        f.probe.log(),
        vec!["begin:STATIC", "stop:STATIC", "begin:UPNP"]
    );
    assert_eq!(f.orchestrator.active_type().await, RemoteAccessType::Upnp);
    assert_eq!(f.store.runtime().running_type, RemoteAccessType::Upnp);
    assert_eq!(f.probe.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_requests_never_overlap() {
    let f = fixture(RemoteAccessType::Upnp).await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let orchestrator = f.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => orchestrator.begin(RemoteAccessType::Upnp).await.map(|_| ()),
                1 => orchestrator.begin(RemoteAccessType::Static).await.map(|_| ()),
                _ => orchestrator.stop().await,
            }
        }));
    }
    for handle in handles {
        let _ = handle.await.expect("task does not panic");
    }

    assert_eq!(f.probe.max_inside.load(Ordering::SeqCst), 1, "backend calls overlapped");
    assert!(f.probe.max_active.load(Ordering::SeqCst) <= 1, "two backends were active");

    let running = f.store.runtime().running_type;
    assert_eq!(running, f.orchestrator.active_type().await);
    assert_ne!(
        running,
        RemoteAccessType::Static,
        "a begin for an unconfigured type never sticks"
    );
}

#[tokio::test]
async fn failed_begin_records_error() {
    let f = fixture(RemoteAccessType::Upnp).await;
    f.upnp.fail_begin.store(true, Ordering::SeqCst);

    let result = f.orchestrator.begin(RemoteAccessType::Upnp).await;
    assert!(result.is_err());

    let runtime = f.store.runtime();
    assert_eq!(runtime.running_type, RemoteAccessType::Disabled);
    assert!(runtime.error.is_some());
    assert_eq!(f.orchestrator.active_type().await, RemoteAccessType::Disabled);
}

#[tokio::test]
async fn stop_when_idle_is_a_noop() {
    let f = fixture(RemoteAccessType::Static).await;

    f.orchestrator.stop().await.expect("idle stop succeeds");
    f.orchestrator.extend().await.expect("idle extend succeeds");

    assert!(f.probe.log().is_empty());
}

#[tokio::test]
async fn repeated_begin_is_idempotent() {
    let f = fixture(RemoteAccessType::Upnp).await;

    f.orchestrator.begin(RemoteAccessType::Upnp).await.expect("begin");
    f.orchestrator.begin(RemoteAccessType::Upnp).await.expect("begin again");

    assert_eq!(f.probe.log(), vec!["begin:UPNP", "extend:UPNP"]);
}

#[tokio::test]
async fn harness_static_and_upnp_are_exclusive() {
    // Same guarantee through the real backends
    let harness = Harness::start(static_config(8443)).await;
    harness.connect().await;

    harness.transport.send(event(
        connect_core::traits::RemoteAccessEventType::Init,
    ));
    harness.wait_running(RemoteAccessType::Static).await;
    assert!(harness.agent.store().remote_access().wan_access_enabled);

    harness
        .agent
        .setup_remote_access(connect_core::config::SetupRemoteAccessInput {
            access_type: connect_core::config::AccessMode::Predicate,
            forward_type: Some(connect_core::config::ForwardType::Upnp),
            port: None,
        })
        .await
        .expect("setup succeeds");

    assert_eq!(harness.agent.status().running_type, RemoteAccessType::Disabled);
    assert!(!harness.agent.store().remote_access().wan_access_enabled);

    harness.transport.send(event(
        connect_core::traits::RemoteAccessEventType::Init,
    ));
    harness.wait_running(RemoteAccessType::Upnp).await;
    assert_eq!(harness.router.mappings().len(), 1);
    assert!(!harness.agent.store().remote_access().wan_access_enabled);

    harness.stop().await.expect("clean shutdown");
}
