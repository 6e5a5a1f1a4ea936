//! End-to-end client lifecycle: reconnect draining, grace-window expiry and
//! send-failure handling, driven through the public gateway surface.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use silo_gateway::test_support::{MockSocket, RecordingMessageCenter, RecordingRegistrar, SendFailure};
use silo_gateway::{
    ActorId, ClientId, Gateway, GatewayConfig, GatewaySocket, Message, SiloAddress,
};

fn gateway_address() -> SiloAddress {
    SiloAddress::new("127.0.0.1:11111".parse().unwrap(), 1)
}

fn build_gateway(
    grace: Duration,
) -> (Gateway, Arc<RecordingMessageCenter>, Arc<RecordingRegistrar>) {
    let center = Arc::new(RecordingMessageCenter::new());
    let registrar = Arc::new(RecordingRegistrar::new());
    let config = GatewayConfig {
        gateway_sender_queues: 2,
        grace_window: grace,
        ..Default::default()
    };
    let gateway = Gateway::new(config, gateway_address(), center.clone()).expect("valid config");
    gateway.start(registrar.clone());
    (gateway, center, registrar)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn proxied_request(client: &ClientId, observer_key: u64, body: &'static [u8]) -> Message {
    Message::request(
        ActorId::grain(1),
        ActorId::client_object(client.clone(), observer_key),
        Bytes::from_static(body),
    )
}

#[tokio::test]
async fn reconnect_drains_pending_in_order() {
    let (gateway, _center, _registrar) = build_gateway(Duration::from_secs(60));
    let client = ClientId::new("x");
    let actor = ActorId::client_object(client.clone(), 1);

    let s1 = Arc::new(MockSocket::new("10.0.0.1:1"));
    gateway.record_opened_socket(s1.clone(), client.clone());
    gateway.record_proxied_grain(actor.clone(), &client);

    // Transport reports close before anything is sent.
    gateway.record_closed_socket(s1.id());

    let m1 = proxied_request(&client, 1, b"m1");
    let m2 = proxied_request(&client, 1, b"m2");
    let (id1, id2) = (m1.id, m2.id);
    assert!(gateway.try_deliver_to_proxy(m1).is_none());
    assert!(gateway.try_deliver_to_proxy(m2).is_none());

    // Nothing reaches the dead socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(s1.sent_bytes().is_empty());

    // Reconnect within the grace window; the wake-up drains both messages
    // onto the new socket, in order, exactly once.
    let s2 = Arc::new(MockSocket::new("10.0.0.1:2"));
    gateway.record_opened_socket(s2.clone(), client.clone());
    wait_until(|| s2.sent_envelopes().len() == 2).await;

    let envelopes = s2.sent_envelopes();
    assert_eq!(envelopes[0].1.id, id1);
    assert_eq!(envelopes[1].1.id, id2);
    assert_eq!(envelopes[0].1.body, b"m1");
    assert_eq!(envelopes[1].1.body, b"m2");
    assert!(s1.sent_bytes().is_empty());

    assert_eq!(gateway.stats().messages_sent, 2);
    gateway.stop().await;
}

#[tokio::test]
async fn grace_expiry_drops_client_and_reports_orphans() {
    let (gateway, center, registrar) = build_gateway(Duration::from_millis(50));
    let client = ClientId::new("y");
    let observer = ActorId::client_object(client.clone(), 1);
    let grain = ActorId::client_grain(client.clone());

    let socket = Arc::new(MockSocket::new("10.0.0.2:1"));
    gateway.record_opened_socket(socket.clone(), client.clone());
    gateway.record_proxied_grain(observer.clone(), &client);
    gateway.record_proxied_grain(grain.clone(), &client);
    assert_eq!(registrar.added(), vec![client.clone()]);
    assert_eq!(gateway.get_connected_clients(), vec![client.clone()]);

    gateway.record_closed_socket(socket.id());
    assert!(gateway.get_connected_clients().is_empty());

    // One cleanup tick after the grace window elapses.
    wait_until(|| !registrar.dropped().is_empty()).await;
    assert_eq!(registrar.dropped(), vec![client.clone()]);

    let drops = center.client_drops();
    assert_eq!(drops.len(), 1);
    let mut orphaned = drops[0].clone();
    orphaned.sort_by_key(|a| a.to_string());
    let mut expected = vec![observer.clone(), grain.clone()];
    expected.sort_by_key(|a| a.to_string());
    assert_eq!(orphaned, expected);

    // The client is gone for good: a later delivery is not accepted here.
    let stray = proxied_request(&client, 1, b"late");
    assert!(gateway.try_deliver_to_proxy(stray).is_some());

    let stats = gateway.stats();
    assert_eq!(stats.connected_clients, 0);
    assert_eq!(stats.clients_dropped, 1);
    gateway.stop().await;
}

#[tokio::test]
async fn short_write_closes_socket_and_resends_on_reconnect() {
    let (gateway, _center, _registrar) = build_gateway(Duration::from_secs(60));
    let client = ClientId::new("x");
    let actor = ActorId::client_object(client.clone(), 1);

    let s1 = Arc::new(MockSocket::new("10.0.0.3:1"));
    gateway.record_opened_socket(s1.clone(), client.clone());
    gateway.record_proxied_grain(actor.clone(), &client);

    s1.fail_next(SendFailure::Short(3));
    let m = proxied_request(&client, 1, b"payload");
    let id = m.id;
    assert!(gateway.try_deliver_to_proxy(m).is_none());

    // The failed socket is closed and the client sits disconnected with the
    // message still queued.
    wait_until(|| s1.is_closed()).await;
    assert!(gateway.get_connected_clients().is_empty());
    assert!(s1.sent_bytes().is_empty());

    let s2 = Arc::new(MockSocket::new("10.0.0.3:2"));
    gateway.record_opened_socket(s2.clone(), client.clone());
    wait_until(|| !s2.sent_envelopes().is_empty()).await;

    // The retried message is the first thing on the new socket.
    let envelopes = s2.sent_envelopes();
    assert_eq!(envelopes[0].1.id, id);
    assert_eq!(envelopes[0].1.body, b"payload");

    let stats = gateway.stats();
    assert_eq!(stats.send_failures, 1);
    assert_eq!(stats.messages_sent, 1);
    gateway.stop().await;
}

#[tokio::test]
async fn io_error_keeps_fifo_across_reconnect() {
    let (gateway, _center, _registrar) = build_gateway(Duration::from_secs(60));
    let client = ClientId::new("x");
    let actor = ActorId::client_object(client.clone(), 1);

    let s1 = Arc::new(MockSocket::new("10.0.0.4:1"));
    gateway.record_opened_socket(s1.clone(), client.clone());
    gateway.record_proxied_grain(actor.clone(), &client);

    let m1 = proxied_request(&client, 1, b"first");
    let id1 = m1.id;
    assert!(gateway.try_deliver_to_proxy(m1).is_none());
    wait_until(|| s1.sent_envelopes().len() == 1).await;

    s1.fail_next(SendFailure::Error(std::io::ErrorKind::BrokenPipe));
    let m2 = proxied_request(&client, 1, b"second");
    let m3 = proxied_request(&client, 1, b"third");
    let (id2, id3) = (m2.id, m3.id);
    assert!(gateway.try_deliver_to_proxy(m2).is_none());
    wait_until(|| s1.is_closed()).await;
    assert!(gateway.try_deliver_to_proxy(m3).is_none());

    let s2 = Arc::new(MockSocket::new("10.0.0.4:2"));
    gateway.record_opened_socket(s2.clone(), client.clone());
    wait_until(|| s2.sent_envelopes().len() == 2).await;

    let ids: Vec<u64> = s2.sent_envelopes().iter().map(|(_, e)| e.id).collect();
    assert_eq!(ids, vec![id2, id3]);
    assert_eq!(
        s1.sent_envelopes().iter().map(|(_, e)| e.id).collect::<Vec<_>>(),
        vec![id1]
    );
    gateway.stop().await;
}
