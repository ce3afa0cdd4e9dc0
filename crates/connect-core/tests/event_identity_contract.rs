//! Architectural Contract Test: Event Identity
//!
//! This test verifies that only control events bound to the configured
//! credential reach the orchestrator.
//!
//! Constraints verified:
//! - An event with a different API key causes no orchestrator call
//! - Events are ignored while remote access is DISABLED
//! - INIT records the advertised URL and begins the configured type
//! - ACK is a no-op; PING extends; END stops
//!
//! If this test fails, someone has added:
//! - Dispatch paths that skip credential validation
//! - Backends started for a type other than the configured one

mod common;

use common::*;
use connect_core::EventRouter;
use connect_core::config::{ConnectConfig, RemoteAccessType};
use connect_core::error::Error;
use connect_core::traits::{AccessUrl, RelayMessage, RemoteAccessEvent, RemoteAccessEventType};
use connect_core::Store;
use std::time::Duration;

async fn router_for(config: ConnectConfig) -> (EventRouter, std::sync::Arc<SpyControl>) {
    let store = Store::new(TrackingConfigStore::with_config(config));
    store.load().await.expect("load succeeds");
    let spy = SpyControl::new();
    (EventRouter::new(store, spy.clone()), spy)
}

#[tokio::test]
async fn foreign_credential_makes_no_calls() {
    let (router, spy) = router_for(upnp_config()).await;

    for kind in [
        RemoteAccessEventType::Init,
        RemoteAccessEventType::Ping,
        RemoteAccessEventType::End,
    ] {
        let result = router.on_event(RemoteAccessEvent::new(kind, "someone-else")).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    assert!(spy.calls().is_empty(), "calls: {:?}", spy.calls());
}

#[tokio::test]
async fn missing_credential_rejects_everything() {
    let mut config = upnp_config();
    config.api_key = None;
    let (router, spy) = router_for(config).await;

    let result = router
        .on_event(RemoteAccessEvent::new(RemoteAccessEventType::Init, ""))
        .await;
    assert!(result.is_err());
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn disabled_type_ignores_events() {
    let mut config = upnp_config();
    config.remote_access.remote_access_type = RemoteAccessType::Disabled;
    let (router, spy) = router_for(config).await;

    router
        .on_event(RemoteAccessEvent::new(RemoteAccessEventType::Init, API_KEY))
        .await
        .expect("ignored events are not errors");
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn events_map_to_control_calls() {
    let (router, spy) = router_for(static_config(8443)).await;
    let url = AccessUrl::wan("https://203.0.113.7:8443/".parse().unwrap());

    for event in [
        RemoteAccessEvent::new(RemoteAccessEventType::Init, API_KEY).with_url(url),
        RemoteAccessEvent::new(RemoteAccessEventType::Ack, API_KEY),
        RemoteAccessEvent::new(RemoteAccessEventType::Ping, API_KEY),
        RemoteAccessEvent::new(RemoteAccessEventType::End, API_KEY),
    ] {
        router.on_event(event).await.expect("dispatch succeeds");
    }

    assert_eq!(
        spy.calls(),
        vec!["record_url", "begin:STATIC", "extend", "stop"]
    );
}

#[tokio::test]
async fn foreign_event_over_relay_changes_nothing() {
    let harness = Harness::start(upnp_config()).await;
    harness.connect().await;

    harness.transport.send(RelayMessage::Event(RemoteAccessEvent::new(
        RemoteAccessEventType::Init,
        "someone-else",
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.router.create_count(), 0);
    assert_eq!(harness.agent.status().running_type, RemoteAccessType::Disabled);
    assert!(harness.agent.store().runtime().allowed_urls.is_empty());

    // The connection survives a rejected event
    harness.transport.send(event(RemoteAccessEventType::Init));
    harness.wait_running(RemoteAccessType::Upnp).await;

    harness.stop().await.expect("clean shutdown");
}
