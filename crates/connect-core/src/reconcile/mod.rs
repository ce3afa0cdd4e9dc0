//! Reconciliation of desired against running remote access
//!
//! [`ReconciliationController`] is an explicit state-diff loop. Each pass
//! computes a [`Snapshot`] of the inputs it acts on, compares it to the
//! snapshot it last applied, and acts only on the difference:
//!
//! | change                                   | action                                  |
//! |------------------------------------------|-----------------------------------------|
//! | `should_run` true → false                | disconnect relay, stop active backend   |
//! | `should_run` false → true                | connect relay                           |
//! | connection parameters changed            | full reconnect (or disconnect if gone)  |
//! | type changed while running               | stop the backend of the old type        |
//! | STATIC: WAN access on when it turns on   | begin STATIC                            |
//! | or when becoming runnable                |                                         |
//! | STATIC: WAN access turned off            | stop STATIC                             |
//!
//! Passes never nest: a trigger arriving while a pass is in flight only sets
//! a pending flag and the running pass loops once more, up to a bounded
//! number of passes plus one closing pass, so the latest change is always
//! applied. Writes made by a pass (an allocated port written back
//! during `begin`) are therefore seen by the next pass, where they diff to
//! nothing.
//!
//! UPnP-specific enablement lives in [`upnp::UpnpReconciler`].

pub mod upnp;

pub use upnp::UpnpReconciler;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{ConnectConfig, RemoteAccessType};
use crate::connection::ConnectionManager;
use crate::orchestrator::{RemoteAccessControl, RemoteAccessOrchestrator};
use crate::state::{Store, SystemState};
use crate::traits::ConnectionParams;

/// Whether remote access should be running
///
/// True iff configuration and system state are loaded and a dynamic
/// remote access type is configured.
pub fn should_run(config: &ConnectConfig, system: &SystemState) -> bool {
    system.is_ready() && config.remote_access.remote_access_type != RemoteAccessType::Disabled
}

/// Inputs a reconciliation pass acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Result of [`should_run`]
    pub should_run: bool,
    /// Configured type
    pub kind: RemoteAccessType,
    /// WAN-access flag
    pub wan_access_enabled: bool,
    /// Relay connection parameters, when running and complete
    pub params: Option<ConnectionParams>,
}

impl Snapshot {
    /// Compute the snapshot for the store's current state
    pub fn capture(store: &Store, api_version: &str) -> Self {
        let config = store.config();
        let system = store.system();
        let run = should_run(&config, &system);
        Self {
            should_run: run,
            kind: config.remote_access.remote_access_type,
            wan_access_enabled: config.remote_access.wan_access_enabled,
            params: if run {
                store.connection_params(api_version)
            } else {
                None
            },
        }
    }
}

/// Drives the relay connection and orchestrator toward the desired state
pub struct ReconciliationController {
    store: Store,
    connection: ConnectionManager,
    orchestrator: RemoteAccessOrchestrator,
    max_passes: usize,
    applied: Mutex<Option<Snapshot>>,
    in_flight: AtomicBool,
    pending: AtomicBool,
}

impl ReconciliationController {
    /// Create a controller that has not applied anything yet
    pub fn new(
        store: Store,
        connection: ConnectionManager,
        orchestrator: RemoteAccessOrchestrator,
        max_passes: usize,
    ) -> Self {
        Self {
            store,
            connection,
            orchestrator,
            max_passes: max_passes.max(1),
            applied: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    /// Snapshot applied by the last pass
    pub fn applied(&self) -> Option<Snapshot> {
        self.lock_applied().clone()
    }

    /// Reconcile after a change of configuration or system state
    ///
    /// Returns immediately if a pass is already running; that pass picks
    /// the change up.
    pub async fn reconcile(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
            tracing::trace!("Reconciliation in flight, coalescing trigger");
            return;
        }

        let mut passes = 0;
        loop {
            self.pending.store(false, Ordering::SeqCst);
            self.pass().await;
            passes += 1;

            if !self.pending.load(Ordering::SeqCst) {
                break;
            }
            if passes >= self.max_passes {
                // One closing pass applies the latest state; anything newer
                // stays pending for the next trigger
                self.pending.store(false, Ordering::SeqCst);
                self.pass().await;
                if self.pending.load(Ordering::SeqCst) {
                    tracing::warn!(passes, "Reconciliation did not settle, deferring to next change");
                }
                break;
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn lock_applied(&self) -> std::sync::MutexGuard<'_, Option<Snapshot>> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pass(&self) {
        let desired = Snapshot::capture(&self.store, self.connection.api_version());
        let previous = self.lock_applied().replace(desired.clone());

        if previous.as_ref() == Some(&desired) {
            return;
        }

        let was_running = previous.as_ref().is_some_and(|p| p.should_run);

        if !desired.should_run {
            if was_running {
                tracing::info!("Remote access no longer wanted, stopping");
                self.connection.disconnect();
                if let Err(e) = self.orchestrator.stop().await {
                    tracing::warn!("Failed to stop remote access: {}", e);
                }
            }
            return;
        }

        if let Some(previous) = previous.as_ref().filter(|_| was_running) {
            if previous.kind != desired.kind {
                let active = self.orchestrator.active_type().await;
                if active != RemoteAccessType::Disabled && active != desired.kind {
                    tracing::info!(from = %previous.kind, to = %desired.kind, "Remote access type changed");
                    if let Err(e) = self.orchestrator.stop().await {
                        tracing::warn!("Failed to stop previous remote access: {}", e);
                    }
                }
            }
        }

        let params_changed = previous.as_ref().map(|p| &p.params) != Some(&desired.params);
        if !was_running || params_changed {
            match desired.params.clone() {
                Some(params) => self.connection.connect(params),
                None => {
                    tracing::info!("Relay identity incomplete, waiting for credentials");
                    self.connection.disconnect();
                }
            }
        }

        if desired.kind == RemoteAccessType::Static {
            self.reconcile_static(previous.as_ref(), &desired, was_running)
                .await;
        }
    }

    async fn reconcile_static(&self, previous: Option<&Snapshot>, desired: &Snapshot, was_running: bool) {
        let wan_before = previous.is_some_and(|p| p.wan_access_enabled);
        let active = self.orchestrator.active_type().await;

        let turned_on = desired.wan_access_enabled && (!was_running || !wan_before);
        let turned_off = was_running && wan_before && !desired.wan_access_enabled;

        if turned_on && active != RemoteAccessType::Static {
            if let Err(e) = self.orchestrator.begin(RemoteAccessType::Static).await {
                tracing::error!("Failed to start static remote access: {}", e);
            }
        } else if turned_off && active == RemoteAccessType::Static {
            if let Err(e) = self.orchestrator.stop().await {
                tracing::warn!("Failed to stop static remote access: {}", e);
            }
        }
    }
}
