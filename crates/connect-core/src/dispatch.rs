//! Inbound remote access event dispatch
//!
//! [`EventRouter`] validates control events arriving over the relay
//! connection and turns them into orchestrator calls:
//!
//! | event | action                                          |
//! |-------|-------------------------------------------------|
//! | INIT  | record advertised URL, `begin(configured type)` |
//! | ACK   | nothing                                         |
//! | PING  | `extend()`                                      |
//! | END   | `stop()`                                        |
//!
//! An event is accepted only if its API key equals the configured
//! credential. While the configured type is DISABLED every event is
//! ignored. Failures are logged and never reach the connection's read loop.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::RemoteAccessType;
use crate::connection::InboundHandler;
use crate::error::{Error, Result};
use crate::orchestrator::RemoteAccessControl;
use crate::state::Store;
use crate::traits::{RemoteAccessEvent, RemoteAccessEventType};

/// Routes relay control events to the orchestrator
pub struct EventRouter {
    store: Store,
    control: Arc<dyn RemoteAccessControl>,
}

impl EventRouter {
    /// Create a router dispatching to `control`
    pub fn new(store: Store, control: Arc<dyn RemoteAccessControl>) -> Self {
        Self { store, control }
    }

    /// Validate and dispatch one event
    ///
    /// # Returns
    ///
    /// - `Err(Error::Protocol)`: the event was not for this appliance and was dropped
    /// - `Err(_)`: the orchestrator call failed
    pub async fn on_event(&self, event: RemoteAccessEvent) -> Result<()> {
        let config = self.store.config();

        let authorized = config
            .api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty() && key == event.api_key);
        if !authorized {
            tracing::warn!(
                event_type = ?event.kind,
                "Dropping remote access event bound to a different credential"
            );
            return Err(Error::protocol(
                "Remote access event credential does not match configuration",
            ));
        }

        let kind = config.remote_access.remote_access_type;
        if kind == RemoteAccessType::Disabled {
            tracing::debug!(event_type = ?event.kind, "Remote access disabled, ignoring event");
            return Ok(());
        }

        tracing::debug!(event_type = ?event.kind, %kind, "Dispatching remote access event");
        match event.kind {
            RemoteAccessEventType::Init => {
                if let Some(url) = event.url {
                    self.control.record_allowed_url(url).await;
                }
                self.control.begin(kind).await.map(|_| ())
            }
            RemoteAccessEventType::Ack => Ok(()),
            RemoteAccessEventType::Ping => self.control.extend().await,
            RemoteAccessEventType::End => self.control.stop().await,
        }
    }
}

#[async_trait]
impl InboundHandler for EventRouter {
    async fn handle(&self, event: RemoteAccessEvent) {
        let kind = event.kind;
        if let Err(e) = self.on_event(event).await {
            tracing::warn!(event_type = ?kind, "Remote access event not applied: {}", e);
        }
    }
}
