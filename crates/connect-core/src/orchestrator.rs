//! Remote access orchestration
//!
//! [`RemoteAccessOrchestrator`] owns "which backend, if any, is active".
//!
//! ## Guarantees
//!
//! - At most one backend is active at any instant. `begin` with a different
//!   type fully stops the current backend before starting the new one.
//! - Transitions are serialized: the active-backend slot is behind an async
//!   mutex held for the whole `begin`/`extend`/`stop`, so a later request
//!   observes the result of the earlier one. Waiters are served FIFO.
//! - `stop` with nothing active is a no-op; `extend` outside UPNP is a no-op.
//! - Runtime state (`running_type`, `error`) is written only here.
//!
//! While a UPnP backend is active a renewal task calls `extend` every
//! renewal interval. Stopping cancels that task immediately.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{RemoteAccessBackend, TransitionContext};
use crate::bus::{StatusBus, StatusEvent};
use crate::config::RemoteAccessType;
use crate::error::{Error, Result};
use crate::state::Store;
use crate::traits::AccessUrl;

/// Remote access control surface used by event dispatch and reconciliation
#[async_trait]
pub trait RemoteAccessControl: Send + Sync {
    /// Start remote access of the given type
    async fn begin(&self, kind: RemoteAccessType) -> Result<Option<AccessUrl>>;

    /// Keep lease-based remote access open
    async fn extend(&self) -> Result<()>;

    /// Stop whatever is active
    async fn stop(&self) -> Result<()>;

    /// Record a URL the relay advertised for this appliance
    async fn record_allowed_url(&self, url: AccessUrl);
}

struct ActiveBackend {
    kind: RemoteAccessType,
    url: Option<AccessUrl>,
    renewal: Option<CancellationToken>,
}

impl ActiveBackend {
    fn cancel_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
    }
}

/// Single owner of the active remote access backend
#[derive(Clone)]
pub struct RemoteAccessOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: TransitionContext,
    static_backend: Arc<dyn RemoteAccessBackend>,
    upnp_backend: Arc<dyn RemoteAccessBackend>,
    renewal_interval: Duration,
    active: Mutex<Option<ActiveBackend>>,
}

impl RemoteAccessOrchestrator {
    /// Create an orchestrator with nothing active
    ///
    /// # Parameters
    ///
    /// - `store`: Agent state; runtime state is written here
    /// - `bus`: Receives runtime status changes
    /// - `static_backend`: Backend for `STATIC`
    /// - `upnp_backend`: Backend for `UPNP`
    /// - `renewal_interval`: Cadence of UPnP lease renewal
    pub fn new(
        store: Store,
        bus: StatusBus,
        static_backend: Arc<dyn RemoteAccessBackend>,
        upnp_backend: Arc<dyn RemoteAccessBackend>,
        renewal_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: TransitionContext { store, bus },
                static_backend,
                upnp_backend,
                renewal_interval,
                active: Mutex::new(None),
            }),
        }
    }

    /// Type of the active backend
    ///
    /// Waits for an in-flight transition to finish.
    pub async fn active_type(&self) -> RemoteAccessType {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.kind)
            .unwrap_or_default()
    }

    /// URL reported by the active backend
    pub async fn current_url(&self) -> Option<AccessUrl> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .and_then(|a| a.url.clone())
    }

    fn backend(&self, kind: RemoteAccessType) -> Result<&Arc<dyn RemoteAccessBackend>> {
        match kind {
            RemoteAccessType::Static => Ok(&self.inner.static_backend),
            RemoteAccessType::Upnp => Ok(&self.inner.upnp_backend),
            RemoteAccessType::Disabled => Err(Error::Other(
                "No backend exists for DISABLED remote access".to_string(),
            )),
        }
    }

    async fn begin_locked(
        &self,
        active: &mut Option<ActiveBackend>,
        kind: RemoteAccessType,
    ) -> Result<Option<AccessUrl>> {
        if kind == RemoteAccessType::Disabled {
            self.stop_locked(active).await?;
            return Ok(None);
        }

        if active.as_ref().is_some_and(|a| a.kind == kind) {
            tracing::debug!(%kind, "Remote access already running");
            if kind == RemoteAccessType::Upnp {
                self.extend_locked(active).await?;
            }
            return Ok(active.as_ref().and_then(|a| a.url.clone()));
        }

        if let Err(e) = self.stop_locked(active).await {
            tracing::warn!("Previous backend did not stop cleanly: {}", e);
        }

        let backend = self.backend(kind)?;
        let ctx = &self.inner.ctx;
        tracing::info!(%kind, "Starting remote access");

        let url = match backend.begin(ctx).await {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(%kind, "Failed to start remote access: {}", e);
                self.set_runtime(RemoteAccessType::Disabled, Some(e.to_string()));
                return Err(e);
            }
        };

        let configured = ctx.store.remote_access().remote_access_type;
        if configured != kind {
            tracing::info!(
                %kind,
                %configured,
                "Configured type changed while starting, discarding result"
            );
            if let Err(e) = backend.stop(ctx).await {
                tracing::warn!("Failed to tear down discarded backend: {}", e);
            }
            return Ok(None);
        }

        let renewal = (kind == RemoteAccessType::Upnp).then(|| self.spawn_renewal());
        *active = Some(ActiveBackend {
            kind,
            url: url.clone(),
            renewal,
        });
        self.set_runtime(kind, None);
        Ok(url)
    }

    async fn extend_locked(&self, active: &mut Option<ActiveBackend>) -> Result<()> {
        let Some(current) = active.as_mut() else {
            return Ok(());
        };
        if current.kind != RemoteAccessType::Upnp {
            return Ok(());
        }

        match self.inner.upnp_backend.extend(&self.inner.ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The backend already released its lease
                current.cancel_renewal();
                *active = None;
                self.set_runtime(RemoteAccessType::Disabled, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Begin UPNP again when an earlier failure took it down
    ///
    /// Only applies while UPNP is configured and enabled, nothing is active,
    /// and the runtime state still carries the failure.
    async fn retry_failed_upnp(&self, active: &mut Option<ActiveBackend>) -> Result<()> {
        let store = &self.inner.ctx.store;
        let settings = store.remote_access();
        let failed = store.runtime().error.is_some();

        if settings.remote_access_type != RemoteAccessType::Upnp || !settings.upnp_enabled || !failed {
            return Ok(());
        }

        tracing::info!("Retrying UPnP remote access after an earlier failure");
        self.begin_locked(active, RemoteAccessType::Upnp).await.map(|_| ())
    }

    async fn stop_locked(&self, active: &mut Option<ActiveBackend>) -> Result<()> {
        let Some(mut current) = active.take() else {
            return Ok(());
        };

        current.cancel_renewal();
        tracing::info!(kind = %current.kind, "Stopping remote access");

        let result = self.backend(current.kind)?.stop(&self.inner.ctx).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        self.set_runtime(RemoteAccessType::Disabled, error);
        result
    }

    fn spawn_renewal(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let orchestrator = self.clone();
        let interval = self.inner.renewal_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                tracing::debug!("Renewing UPnP lease");
                if let Err(e) = orchestrator.extend().await {
                    tracing::warn!("Scheduled UPnP renewal failed: {}", e);
                    break;
                }
            }
        });

        token
    }

    fn set_runtime(&self, running_type: RemoteAccessType, error: Option<String>) {
        let store = &self.inner.ctx.store;
        let changed = store.update_runtime(|runtime| {
            runtime.running_type = running_type;
            runtime.error = error;
        });
        if changed {
            self.inner
                .ctx
                .bus
                .publish(StatusEvent::RuntimeChanged(store.remote_access_status()));
        }
    }
}

#[async_trait]
impl RemoteAccessControl for RemoteAccessOrchestrator {
    async fn begin(&self, kind: RemoteAccessType) -> Result<Option<AccessUrl>> {
        let mut active = self.inner.active.lock().await;
        self.begin_locked(&mut active, kind).await
    }

    async fn extend(&self) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        if active.is_none() {
            return self.retry_failed_upnp(&mut active).await;
        }
        self.extend_locked(&mut active).await
    }

    async fn stop(&self) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        self.stop_locked(&mut active).await
    }

    async fn record_allowed_url(&self, url: AccessUrl) {
        self.inner.ctx.store.update_runtime(|runtime| {
            if !runtime.allowed_urls.contains(&url) {
                runtime.allowed_urls.push(url);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryConfigStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        begins: AtomicUsize,
        stops: AtomicUsize,
        extends: AtomicUsize,
    }

    #[async_trait]
    impl RemoteAccessBackend for CountingBackend {
        fn kind(&self) -> RemoteAccessType {
            RemoteAccessType::Static
        }

        async fn get_url(&self, _ctx: &TransitionContext) -> Option<AccessUrl> {
            None
        }

        async fn begin(&self, _ctx: &TransitionContext) -> Result<Option<AccessUrl>> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn stop(&self, _ctx: &TransitionContext) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn extend(&self, _ctx: &TransitionContext) -> Result<()> {
            self.extends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup(
        kind: RemoteAccessType,
    ) -> (RemoteAccessOrchestrator, Store, Arc<CountingBackend>) {
        let store = Store::new(Arc::new(MemoryConfigStore::new()));
        store.load().await.unwrap();
        store
            .update_config(|c| {
                c.remote_access.remote_access_type = kind;
                c.remote_access.upnp_enabled = true;
            })
            .await
            .unwrap();
        let backend = Arc::new(CountingBackend::default());
        let orchestrator = RemoteAccessOrchestrator::new(
            store.clone(),
            StatusBus::new(8),
            backend.clone(),
            backend.clone(),
            Duration::from_secs(60),
        );
        (orchestrator, store, backend)
    }

    #[tokio::test]
    async fn stop_with_nothing_running_is_a_no_op() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Static).await;
        let before = store.runtime();

        orchestrator.stop().await.unwrap();

        assert_eq!(store.runtime(), before);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn begin_same_type_twice_starts_once() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Static).await;

        orchestrator.begin(RemoteAccessType::Static).await.unwrap();
        orchestrator.begin(RemoteAccessType::Static).await.unwrap();

        assert_eq!(backend.begins.load(Ordering::SeqCst), 1);
        assert_eq!(store.runtime().running_type, RemoteAccessType::Static);
    }

    #[tokio::test]
    async fn extend_outside_upnp_is_silent() {
        let (orchestrator, _store, backend) = setup(RemoteAccessType::Static).await;

        orchestrator.extend().await.unwrap();
        orchestrator.begin(RemoteAccessType::Static).await.unwrap();
        orchestrator.extend().await.unwrap();

        assert_eq!(backend.extends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extend_after_failure_begins_upnp_again() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Upnp).await;
        store.update_runtime(|r| r.error = Some("mapping refused by router".to_string()));

        orchestrator.extend().await.unwrap();

        assert_eq!(backend.begins.load(Ordering::SeqCst), 1);
        assert_eq!(backend.extends.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.active_type().await, RemoteAccessType::Upnp);
        assert!(store.runtime().error.is_none());
    }

    #[tokio::test]
    async fn extend_without_failure_begins_nothing() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Upnp).await;

        orchestrator.extend().await.unwrap();

        assert_eq!(backend.begins.load(Ordering::SeqCst), 0);
        assert_eq!(store.runtime().running_type, RemoteAccessType::Disabled);
    }

    #[tokio::test]
    async fn begin_disabled_stops() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Static).await;
        orchestrator.begin(RemoteAccessType::Static).await.unwrap();

        orchestrator.begin(RemoteAccessType::Disabled).await.unwrap();

        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(store.runtime().running_type, RemoteAccessType::Disabled);
    }

    #[tokio::test]
    async fn result_is_discarded_when_type_changed() {
        let (orchestrator, store, backend) = setup(RemoteAccessType::Upnp).await;

        orchestrator.begin(RemoteAccessType::Static).await.unwrap();

        assert_eq!(backend.begins.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.active_type().await, RemoteAccessType::Disabled);
        assert_eq!(store.runtime().running_type, RemoteAccessType::Disabled);
    }

    #[tokio::test]
    async fn allowed_urls_are_recorded_once() {
        let (orchestrator, store, _backend) = setup(RemoteAccessType::Static).await;
        let url = AccessUrl::wan("https://203.0.113.7:443".parse().unwrap());

        orchestrator.record_allowed_url(url.clone()).await;
        orchestrator.record_allowed_url(url.clone()).await;

        assert_eq!(store.runtime().allowed_urls, vec![url]);
    }
}
