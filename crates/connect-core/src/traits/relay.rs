// # Relay Transport Trait
//
// Defines the interface for the outbound control connection to the relay.
//
// ## Implementations
//
// - WebSocket: `connect-relay-ws` crate
//
// ## Usage
//
// ```rust,ignore
// use connect_core::traits::{RelayMessage, RelayTransport};
// use tokio_stream::StreamExt;
//
// let mut stream = transport.open(&params).await?;
// while let Some(message) = stream.next().await {
//     match message {
//         RelayMessage::Event(event) => router.on_event(event).await,
//         RelayMessage::PingTimeout => break,
//         RelayMessage::Disconnected { code, reason } => break,
//     }
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tokio_stream::Stream;
use url::Url;

/// Parameters sent on every (re)connect
///
/// Every field is required: the connection is never attempted with a
/// partially populated identity.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Relay credential (`x-api-key`)
    pub api_key: String,
    /// Hardware identity (`x-flash-guid`)
    pub flash_guid: String,
    /// Agent version (`x-unraid-api-version`)
    pub api_version: String,
    /// Appliance OS version (`x-unraid-server-version`)
    pub server_version: String,
}

impl ConnectionParams {
    /// Build parameters from identity fields
    ///
    /// Returns `None` unless every field is present and non-empty.
    pub fn from_fields(
        api_key: Option<&str>,
        flash_guid: Option<&str>,
        api_version: Option<&str>,
        server_version: Option<&str>,
    ) -> Option<Self> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Some(Self {
            api_key: present(api_key)?,
            flash_guid: present(flash_guid)?,
            api_version: present(api_version)?,
            server_version: present(server_version)?,
        })
    }

    /// `User-Agent` sent to the relay
    pub fn user_agent(&self) -> String {
        format!("unraid-api/{}", self.api_version)
    }

    /// Headers to attach to the connection request
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("x-flash-guid", self.flash_guid.clone()),
            ("x-unraid-api-version", self.api_version.clone()),
            ("x-unraid-server-version", self.server_version.clone()),
            ("User-Agent", self.user_agent()),
        ]
    }
}

// Custom Debug implementation that hides the API key
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("api_key", &"<REDACTED>")
            .field("flash_guid", &self.flash_guid)
            .field("api_version", &self.api_version)
            .field("server_version", &self.server_version)
            .finish()
    }
}

/// Kind of access URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessUrlType {
    /// Reachable from the internet
    Wan,
    /// Reachable on the local network
    Lan,
    /// Anything else the relay advertises
    Other,
}

/// A URL through which the appliance is reachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUrl {
    /// URL kind
    #[serde(rename = "type")]
    pub kind: AccessUrlType,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// IPv4 form of the URL
    #[serde(default)]
    pub ipv4: Option<Url>,
    /// IPv6 form of the URL
    #[serde(default)]
    pub ipv6: Option<Url>,
}

impl AccessUrl {
    /// Create a WAN URL
    pub fn wan(ipv4: Url) -> Self {
        Self {
            kind: AccessUrlType::Wan,
            name: Some("WAN".to_string()),
            ipv4: Some(ipv4),
            ipv6: None,
        }
    }
}

/// Remote access control-event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteAccessEventType {
    /// Relay asks us to open remote access
    Init,
    /// Acknowledgement (originates from this side)
    Ack,
    /// Keepalive while remote access is in use
    Ping,
    /// Relay asks us to close remote access
    End,
}

/// Inbound remote access control event
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccessEvent {
    /// Event type
    #[serde(rename = "type")]
    pub kind: RemoteAccessEventType,
    /// Credential the event is scoped to
    pub api_key: String,
    /// Allowed URL advertised by the relay
    #[serde(default)]
    pub url: Option<AccessUrl>,
    /// Certificate fingerprint advertised by the relay
    #[serde(default)]
    pub sha256: Option<String>,
}

impl RemoteAccessEvent {
    /// Create an event without URL or fingerprint
    pub fn new(kind: RemoteAccessEventType, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            api_key: api_key.into(),
            url: None,
            sha256: None,
        }
    }

    /// Attach an advertised URL
    pub fn with_url(mut self, url: AccessUrl) -> Self {
        self.url = Some(url);
        self
    }
}

impl fmt::Debug for RemoteAccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAccessEvent")
            .field("kind", &self.kind)
            .field("api_key", &"<REDACTED>")
            .field("url", &self.url)
            .field("sha256", &self.sha256)
            .finish()
    }
}

/// Message yielded by an open relay connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// A remote access control event
    Event(RemoteAccessEvent),
    /// Keepalive missed; the connection is considered dead
    PingTimeout,
    /// Connection closed; always the last message of a stream
    Disconnected {
        /// Disconnect code (relay code or mapped transport failure)
        code: u16,
        /// Reason reported by the relay or transport
        reason: String,
    },
}

/// Stream of messages from one relay connection
pub type RelayStream = Pin<Box<dyn Stream<Item = RelayMessage> + Send + 'static>>;

/// Trait for relay transport implementations
///
/// # Behavior
///
/// - `open()` performs the handshake and returns once the connection is up
/// - A failed handshake returns an error; relay-side rejections must carry
///   their code (see [`crate::Error::disconnect_code`])
/// - The stream yields events in arrival order and ends after a
///   [`RelayMessage::Disconnected`]
/// - Dropping the stream closes the connection (cancellation-safe)
///
/// # Forbidden
///
/// - ❌ Reconnecting internally (owned by `ConnectionManager`)
/// - ❌ Interpreting events (owned by `EventRouter`)
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a connection with the given parameters
    async fn open(&self, params: &ConnectionParams) -> Result<RelayStream, crate::Error>;
}
