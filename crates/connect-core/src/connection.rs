//! Relay connection management
//!
//! [`ConnectionManager`] owns the single outbound connection to the relay.
//!
//! ## Lifecycle
//!
//! ```text
//! PRE_INIT → CONNECTING → CONNECTED → PING_FAILURE   → CONNECTING
//!                                   → ERROR_RETRYING → CONNECTING
//! ```
//!
//! - Every `connect` tears down the previous connection first and starts a
//!   new *generation*. Messages and disconnects from an older generation are
//!   discarded.
//! - On disconnect the [`BackoffPolicy`] decides the retry delay. A delay
//!   schedules a one-shot reconnect that re-reads the connection parameters
//!   from the store. No delay means no timer: 401 additionally clears the
//!   stored credential, 426 stays in `ERROR_RETRYING` with a permanent error.
//! - Inbound events are handed to the [`InboundHandler`] one at a time in
//!   arrival order. A handler call that is underway when the connection is
//!   torn down runs to completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffPolicy, CODE_UNAUTHORIZED, CODE_UNKNOWN};
use crate::bus::{StatusBus, StatusEvent};
use crate::state::Store;
use crate::traits::{ConnectionParams, RelayMessage, RelayTransport, RemoteAccessEvent};

/// State of the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected and not trying to
    #[default]
    PreInit,
    /// Handshake in progress
    Connecting,
    /// Connected and receiving events
    Connected,
    /// Keepalive missed; a reconnect follows immediately
    PingFailure,
    /// Disconnected; a reconnect is scheduled unless `retry_after` is empty
    ErrorRetrying,
}

/// Connection status published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Reason of the last failure
    pub error: Option<String>,
    /// Delay until the scheduled reconnect
    pub retry_after: Option<Duration>,
}

impl ConnectionStatus {
    fn with_state(state: ConnectionState) -> Self {
        Self {
            state,
            error: None,
            retry_after: None,
        }
    }
}

/// Consumer of inbound relay events
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one event. Failures are the handler's to log.
    async fn handle(&self, event: RemoteAccessEvent);
}

/// Owner of the single relay connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn RelayTransport>,
    store: Store,
    bus: StatusBus,
    handler: Arc<dyn InboundHandler>,
    policy: BackoffPolicy,
    api_version: String,
    status: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    session: Option<CancellationToken>,
    retry: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager in `PRE_INIT`
    ///
    /// # Parameters
    ///
    /// - `transport`: Opens relay connections
    /// - `store`: Source of connection parameters for scheduled reconnects
    /// - `bus`: Receives connection status changes
    /// - `handler`: Receives inbound events
    /// - `api_version`: Version string sent with every connect
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        store: Store,
        bus: StatusBus,
        handler: Arc<dyn InboundHandler>,
        api_version: impl Into<String>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                bus,
                handler,
                policy: BackoffPolicy::new(),
                api_version: api_version.into(),
                status,
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Open a connection, replacing any existing one
    pub fn connect(&self, params: ConnectionParams) {
        let generation = self.teardown();
        let cancel = CancellationToken::new();
        self.tasks().session = Some(cancel.clone());

        tracing::info!(generation, "Connecting to relay");
        self.set_status(ConnectionStatus::with_state(ConnectionState::Connecting));

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_session(generation, params, cancel).await;
        });
    }

    /// Open a connection using the parameters currently in the store
    ///
    /// Returns `false` (and does nothing) when the identity fields are not
    /// fully populated.
    pub fn connect_from_store(&self) -> bool {
        match self.inner.store.connection_params(&self.inner.api_version) {
            Some(params) => {
                self.connect(params);
                true
            }
            None => {
                tracing::debug!("Connection parameters incomplete, not connecting");
                false
            }
        }
    }

    /// Close the connection and cancel any scheduled reconnect
    ///
    /// The last error stays visible in the status.
    pub fn disconnect(&self) {
        self.teardown();

        let mut status = self.status();
        if status.state != ConnectionState::PreInit || status.retry_after.is_some() {
            tracing::info!("Disconnected from relay");
            status.state = ConnectionState::PreInit;
            status.retry_after = None;
            self.set_status(status);
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to connection status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Whether a reconnect timer is pending
    pub fn retry_pending(&self) -> bool {
        self.tasks()
            .retry
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Version string sent with every connect
    pub fn api_version(&self) -> &str {
        &self.inner.api_version
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invalidate the current generation and stop its tasks
    fn teardown(&self) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tasks = self.tasks();
        if let Some(session) = tasks.session.take() {
            session.cancel();
        }
        if let Some(retry) = tasks.retry.take() {
            retry.abort();
        }
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    async fn run_session(
        &self,
        generation: u64,
        params: ConnectionParams,
        cancel: CancellationToken,
    ) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = self.inner.transport.open(&params) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let code = e.disconnect_code().unwrap_or(CODE_UNKNOWN);
                self.handle_disconnect(generation, code, &e.to_string()).await;
                return;
            }
        };

        if !self.is_current(generation) {
            tracing::debug!(generation, "Discarding connection opened for a stale generation");
            return;
        }

        tracing::info!(generation, "Connected to relay");
        self.set_status(ConnectionStatus::with_state(ConnectionState::Connected));

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = stream.next() => message,
            };

            if !self.is_current(generation) {
                tracing::debug!(generation, "Discarding message from stale connection");
                return;
            }

            match message {
                Some(RelayMessage::Event(event)) => {
                    self.inner.handler.handle(event).await;
                }
                Some(RelayMessage::PingTimeout) => {
                    tracing::warn!(generation, "Relay keepalive timed out, reconnecting");
                    self.set_status(ConnectionStatus {
                        state: ConnectionState::PingFailure,
                        error: Some("Relay keepalive timed out".to_string()),
                        retry_after: None,
                    });
                    self.schedule_retry(generation, Duration::ZERO);
                    return;
                }
                Some(RelayMessage::Disconnected { code, reason }) => {
                    self.handle_disconnect(generation, code, &reason).await;
                    return;
                }
                None => {
                    self.handle_disconnect(generation, CODE_UNKNOWN, "Relay stream ended")
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_disconnect(&self, generation: u64, code: u16, reason: &str) {
        if !self.is_current(generation) {
            tracing::debug!(generation, code, "Ignoring disconnect of stale connection");
            return;
        }

        let decision = self.inner.policy.decide(code, reason);
        match decision.retry_after {
            Some(delay) => {
                tracing::warn!(
                    code,
                    delay_ms = delay.as_millis() as u64,
                    "Relay disconnected: {}",
                    decision.reason
                );
                self.set_status(ConnectionStatus {
                    state: ConnectionState::ErrorRetrying,
                    error: Some(decision.reason),
                    retry_after: Some(delay),
                });
                self.schedule_retry(generation, delay);
            }
            None if code == CODE_UNAUTHORIZED => {
                tracing::error!(code, "{}", decision.reason);
                self.set_status(ConnectionStatus {
                    state: ConnectionState::PreInit,
                    error: Some(decision.reason),
                    retry_after: None,
                });
                self.inner.bus.publish(StatusEvent::CredentialInvalid);
                if let Err(e) = self.inner.store.invalidate_credential().await {
                    tracing::error!("Failed to clear rejected credential: {}", e);
                }
            }
            None => {
                tracing::error!(code, "{}", decision.reason);
                self.set_status(ConnectionStatus {
                    state: ConnectionState::ErrorRetrying,
                    error: Some(decision.reason),
                    retry_after: None,
                });
            }
        }
    }

    fn schedule_retry(&self, generation: u64, delay: Duration) {
        // Held while spawning so the timer cannot fire before its handle is stored
        let mut tasks = self.tasks();
        if !self.is_current(generation) {
            return;
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut tasks = manager.tasks();
                if !manager.is_current(generation) {
                    return;
                }
                // Detach our own handle; connect() would otherwise abort it
                tasks.retry.take();
            }
            tracing::debug!(generation, "Reconnect timer fired");
            if !manager.connect_from_store() {
                manager.set_status(ConnectionStatus {
                    state: ConnectionState::PreInit,
                    ..manager.status()
                });
            }
        });

        if let Some(previous) = tasks.retry.replace(handle) {
            previous.abort();
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            self.inner.bus.publish(StatusEvent::ConnectionChanged(status));
        }
    }
}
