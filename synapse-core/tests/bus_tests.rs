//! End-to-end hub tests: sockets, handshake fence, balancing, GC,
//! same-process shortcut and listen-then-fallback.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use synapse_core::config::{ConnectMode, HubConfig};
use synapse_core::error::SynapseError;
use synapse_core::events::HubEvent;
use synapse_core::hub::{Hub, RoleState};
use synapse_core::balancer::FilterSpec;
use synapse_core::roots::RootRegistry;

type Captured = Arc<Mutex<Vec<Value>>>;

fn capture() -> Captured {
    Arc::new(Mutex::new(Vec::new()))
}

async fn listening_hub(name: &str) -> Hub {
    let mut cfg = HubConfig::new(name);
    cfg.port = 0;
    let hub = Hub::builder().config(cfg).build();
    hub.listen().await.unwrap();
    hub
}

fn client_cfg(name: &str, port: u16) -> HubConfig {
    let mut cfg = HubConfig::new(name);
    cfg.port = port;
    cfg.gc_interval = Duration::from_millis(150);
    cfg
}

async fn subscribe(hub: &Hub, event_type: &str, captured: &Captured) -> synapse_core::hub::SubscriptionHandle {
    let captured = captured.clone();
    hub.on(event_type, move |v: Value| {
        let captured = captured.clone();
        Box::pin(async move {
            captured.lock().await.push(v);
            Ok(())
        })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn end_to_end_over_tcp() {
    let server = listening_hub("s1").await;
    let port = server.local_addr().unwrap().port();
    let mut server_events = server.events();

    let client = Hub::builder().config(client_cfg("c1", port)).build();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    let received = capture();
    subscribe(&client, "*::ping", &received).await;
    sleep(Duration::from_millis(200)).await;

    server.emit("ping", json!({ "n": 1 })).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    {
        let got = received.lock().await;
        assert_eq!(got.as_slice(), &[json!({ "n": 1 })], "exactly one delivery");
    }

    // the serving hub announced the new listener
    let mut saw_listener = false;
    while let Ok(event) = server_events.try_recv() {
        if matches!(&event, HubEvent::NewListener { hub, .. } if hub == "c1") {
            saw_listener = true;
        }
    }
    assert!(saw_listener, "server should report the peer's registration");

    // after the client leaves, its former session no longer forwards
    client.stop().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    server.emit("ping", json!({ "n": 2 })).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(received.lock().await.len(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_replays_subscriptions_before_ready() {
    let server = listening_hub("s2").await;
    let port = server.local_addr().unwrap().port();

    let client = Hub::builder().config(client_cfg("c2", port)).build();
    let got_a = capture();
    let got_b = capture();
    // registered before the connection exists; the handshake replays them
    subscribe(&client, "*::alpha", &got_a).await;
    subscribe(&client, "*::beta", &got_b).await;

    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    // ready implies the ECHO fence round-tripped, so both ONs are applied
    server.emit("alpha", json!(1)).await.unwrap();
    server.emit("beta", json!(2)).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(got_a.lock().await.as_slice(), &[json!(1)]);
    assert_eq!(got_b.lock().await.as_slice(), &[json!(2)]);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn plain_listener_takes_precedence_over_balanced() {
    let server = listening_hub("s3").await;
    let port = server.local_addr().unwrap().port();

    let client = Hub::builder().config(client_cfg("c3", port)).build();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    let plain = capture();
    let balanced = capture();
    let plain_handle = subscribe(&client, "*::load", &plain).await;
    {
        let balanced = balanced.clone();
        client
            .on_filter(
                "*::load",
                "1",
                "f1",
                FilterSpec::Equality {
                    pointer: "/n".into(),
                },
                move |v: Value| {
                    let balanced = balanced.clone();
                    Box::pin(async move {
                        balanced.lock().await.push(v);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    // while the plain listener exists the balanced one stays silent
    server.emit("load", json!({ "n": 1 })).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(plain.lock().await.len(), 1);
    assert_eq!(balanced.lock().await.len(), 0);

    // removing the plain listener flips delivery to the balanced fallback
    plain_handle.unsubscribe().await.unwrap();
    sleep(Duration::from_millis(500)).await; // next gc cycle sends OFF

    server.emit("load", json!({ "n": 1 })).await.unwrap();
    server.emit("load", json!({ "n": 2 })).await.unwrap(); // wrong selector
    sleep(Duration::from_millis(200)).await;

    assert_eq!(plain.lock().await.len(), 1, "plain listener stays gone");
    let got = balanced.lock().await;
    assert_eq!(got.as_slice(), &[json!({ "n": 1 })], "only the matching event");

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn gc_stops_forwarding_after_unsubscribe() {
    let server = listening_hub("s4").await;
    let port = server.local_addr().unwrap().port();

    let client = Hub::builder().config(client_cfg("c4", port)).build();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    let received = capture();
    let handle = subscribe(&client, "*::tick", &received).await;
    sleep(Duration::from_millis(200)).await;

    server.emit("tick", json!(1)).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(received.lock().await.len(), 1);

    handle.unsubscribe().await.unwrap();
    sleep(Duration::from_millis(500)).await; // gc sends OFF upstream

    server.emit("tick", json!(2)).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(received.lock().await.len(), 1, "no delivery after OFF");

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_balanced_key_fails_immediately() {
    let hub = Hub::builder().name("dup").build();
    let spec = FilterSpec::Equality {
        pointer: "/k".into(),
    };
    hub.on_filter("*::x", "a", "f", spec.clone(), |_: Value| {
        Box::pin(async { Ok(()) })
    })
    .await
    .unwrap();
    let err = hub
        .on_filter("*::x", "a", "f", spec, |_: Value| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, SynapseError::DuplicateFilter(_)));
}

#[tokio::test]
async fn same_process_shortcut_skips_the_socket() {
    let roots = RootRegistry::new();

    let mut server_cfg = HubConfig::new("root");
    server_cfg.port = 0;
    let server = Hub::builder().config(server_cfg).roots(roots.clone()).build();
    server.listen().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut cfg = client_cfg("leaf", port);
    cfg.local = true;
    let client = Hub::builder().config(cfg).roots(roots).build();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.upstream_mode().await, Some(ConnectMode::Direct));

    // downstream delivery
    let received = capture();
    subscribe(&client, "*::hello", &received).await;
    sleep(Duration::from_millis(100)).await;
    server.emit("hello", json!({ "x": 1 })).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(received.lock().await.as_slice(), &[json!({ "x": 1 })]);

    // upstream delivery: client emissions arrive namespaced on the root
    let upstream = capture();
    subscribe(&server, "*::status", &upstream).await;
    client.emit("status", json!("ok")).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.lock().await.as_slice(), &[json!("ok")]);

    // balanced subscription filtered locally, no serving-side filtering
    let shard = capture();
    {
        let shard = shard.clone();
        client
            .on_filter(
                "*::work",
                "1",
                "fb",
                FilterSpec::Equality {
                    pointer: "/s".into(),
                },
                move |v: Value| {
                    let shard = shard.clone();
                    Box::pin(async move {
                        shard.lock().await.push(v);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    server.emit("work", json!({ "s": 1 })).await.unwrap();
    server.emit("work", json!({ "s": 2 })).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(shard.lock().await.as_slice(), &[json!({ "s": 1 })]);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn start_falls_back_to_client_when_endpoint_taken() {
    let first = listening_hub("first").await;
    let port = first.local_addr().unwrap().port();

    let second = Hub::builder().config(client_cfg("second", port)).build();
    second.start().await.unwrap();
    assert_eq!(second.role(), RoleState::Connected);
    timeout(Duration::from_secs(2), second.wait_ready())
        .await
        .unwrap()
        .unwrap();

    second.stop().await.unwrap();
    first.stop().await.unwrap();
}

#[tokio::test]
async fn client_retries_until_a_server_appears() {
    // reserve a port, then free it again
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let client = Hub::builder().config(client_cfg("eager", port)).build();
    let mut events = client.events();
    client.connect().await.unwrap();

    // a few failed attempts with growing backoff happen here
    sleep(Duration::from_millis(150)).await;
    assert!(!client.is_ready());

    let mut server_cfg = HubConfig::new("late");
    server_cfg.port = port;
    let server = Hub::builder().config(server_cfg).build();
    server.listen().await.unwrap();

    timeout(Duration::from_secs(3), client.wait_ready())
        .await
        .unwrap()
        .unwrap();
    // the first successful handshake is "ready", not "reconnected"
    let mut first_signal = None;
    while let Ok(event) = events.try_recv() {
        if matches!(event, HubEvent::Ready | HubEvent::Reconnected) {
            first_signal = Some(event);
            break;
        }
    }
    assert_eq!(first_signal, Some(HubEvent::Ready));

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn payload_less_events_reach_handlers_as_null() {
    let server = listening_hub("s5").await;
    let port = server.local_addr().unwrap().port();

    let client = Hub::builder().config(client_cfg("c5", port)).build();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    let received = capture();
    subscribe(&client, "*::pulse", &received).await;
    sleep(Duration::from_millis(200)).await;

    server.notify("pulse").await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(received.lock().await.as_slice(), &[Value::Null]);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}
