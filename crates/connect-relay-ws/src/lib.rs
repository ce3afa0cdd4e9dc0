// # WebSocket Relay Transport
//
// This crate provides the outbound control connection to the relay over a
// WebSocket.
//
// ## Protocol
//
// - Identity travels as request headers on the upgrade request
// - A rejected upgrade is reported by HTTP status; the status is the
//   disconnect code (401, 426, 429, 5xx)
// - Control events arrive as JSON text frames, either bare or wrapped in
//   `{ "type": ..., "data": <event> }`
// - The relay closes with `4000 + code` to report a relay code
// - We ping on an interval; no traffic for the keepalive timeout means the
//   connection is dead
//
// Reconnecting is the connection manager's job, not this crate's: a
// stream ends after exactly one `Disconnected` or `PingTimeout`.

use async_trait::async_trait;
use connect_core::backoff::CODE_UNKNOWN;
use connect_core::traits::{
    ConnectionParams, RelayMessage, RelayStream, RelayTransport, RemoteAccessEvent,
};
use connect_core::{Error, Result};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use url::Url;

/// Default interval between keepalive pings
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Default silence after which the connection is considered dead
const DEFAULT_PING_TIMEOUT_SECS: u64 = 90;

/// First close code of the private range carrying relay codes
const RELAY_CLOSE_CODE_BASE: u16 = 4000;

/// WebSocket relay transport
#[derive(Debug, Clone)]
pub struct WsRelayTransport {
    /// Relay endpoint
    url: Url,

    /// Keepalive ping cadence
    ping_interval: Duration,

    /// Maximum silence before reporting a keepalive failure
    ping_timeout: Duration,
}

impl WsRelayTransport {
    /// Create a transport for `url` (`ws://` or `wss://`)
    ///
    /// # Errors
    ///
    /// - `Error::Config`: the URL does not parse or is not a WebSocket URL
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::config(format!("Invalid relay URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Relay URL must use ws:// or wss://, got '{}'",
                url
            )));
        }

        Ok(Self {
            url,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
        })
    }

    /// Override the keepalive timings
    pub fn with_keepalive(mut self, ping_interval: Duration, ping_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.ping_timeout = ping_timeout.max(ping_interval);
        self
    }

    fn request(&self, params: &ConnectionParams) -> Result<ClientRequestBuilder> {
        let uri: tungstenite::http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::config(e.to_string()))?;

        let request = params
            .headers()
            .into_iter()
            .fold(ClientRequestBuilder::new(uri), |request, (name, value)| {
                request.with_header(name, value)
            });
        Ok(request)
    }
}

#[async_trait]
impl RelayTransport for WsRelayTransport {
    async fn open(&self, params: &ConnectionParams) -> Result<RelayStream> {
        tracing::debug!(url = %self.url, "Opening relay WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.request(params)?)
            .await
            .map_err(handshake_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let keepalive = Keepalive {
            interval: self.ping_interval,
            timeout: self.ping_timeout,
        };
        tokio::spawn(pump(ws_stream, tx, keepalive));

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

/// Read frames until the connection ends or the consumer drops the stream
async fn pump<S>(ws_stream: S, tx: mpsc::UnboundedSender<RelayMessage>, keepalive: Keepalive)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + futures_util::Sink<Message, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (mut write, mut read) = ws_stream.split();
    let mut ticker = tokio::time::interval(keepalive.interval);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    let last = loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::debug!("Relay stream dropped, closing WebSocket");
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() >= keepalive.timeout {
                    break RelayMessage::PingTimeout;
                }
                if let Err(e) = write.send(Message::Ping(Default::default())).await {
                    break disconnected(CODE_UNKNOWN, format!("Failed to send ping: {}", e));
                }
            }
            frame = read.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_event(text.as_str()) {
                            if tx.send(RelayMessage::Event(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break close_message(frame),
                    Some(Ok(_)) => {
                        // Ping, Pong, Binary: liveness only
                    }
                    Some(Err(e)) => break disconnected(CODE_UNKNOWN, e.to_string()),
                    None => break disconnected(CODE_UNKNOWN, "Relay connection ended"),
                }
            }
        }
    };

    tracing::debug!(message = ?last, "Relay WebSocket finished");
    let _ = tx.send(last);
}

fn disconnected(code: u16, reason: impl Into<String>) -> RelayMessage {
    RelayMessage::Disconnected {
        code,
        reason: reason.into(),
    }
}

/// Map a close frame to a disconnect message
fn close_message(frame: Option<CloseFrame>) -> RelayMessage {
    match frame {
        Some(frame) => disconnected(relay_code(u16::from(frame.code)), frame.reason.to_string()),
        None => disconnected(CODE_UNKNOWN, "Relay closed the connection"),
    }
}

/// Relay code carried by a WebSocket close code
///
/// Codes in 4000–4999 carry `4000 + relay code`; other codes pass through.
pub fn relay_code(close_code: u16) -> u16 {
    if (RELAY_CLOSE_CODE_BASE..RELAY_CLOSE_CODE_BASE + 1000).contains(&close_code) {
        close_code - RELAY_CLOSE_CODE_BASE
    } else {
        close_code
    }
}

/// Map a failed upgrade to an error carrying the disconnect code
fn handshake_error(error: tungstenite::Error) -> Error {
    match error {
        tungstenite::Error::Http(response) => {
            status_error(response.status().as_u16(), "Relay rejected the connection")
        }
        other => Error::network(format!("Relay connection failed: {}", other)),
    }
}

/// Error for an HTTP status returned instead of an upgrade
pub fn status_error(status: u16, message: &str) -> Error {
    match status {
        401 => Error::auth(message),
        426 => Error::VersionRejected(message.to_string()),
        429 => Error::RateLimited(message.to_string()),
        code => Error::relay(code, message),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Frame {
    Wrapped { data: RemoteAccessEvent },
    Bare(RemoteAccessEvent),
}

/// Parse a text frame into a control event
///
/// Frames that are not control events are logged and skipped.
pub fn parse_event(text: &str) -> Option<RemoteAccessEvent> {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Wrapped { data }) | Ok(Frame::Bare(data)) => Some(data),
        Err(e) => {
            tracing::warn!("Ignoring unrecognized relay frame: {}", e);
            None
        }
    }
}
