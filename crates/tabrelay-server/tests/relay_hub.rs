mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tabrelay_core::{CloseReason, RelayError};
use tabrelay_server::relay::{ActivityKind, ClientEvent, HubContext, HubRegistry, HubSettings, HubState, TabKey};
use tabrelay_server::provision::ProvisionState;
use tokio::sync::mpsc;

fn key() -> TabKey {
    TabKey::new("sess", "tab-1").unwrap()
}

#[tokio::test]
async fn late_joiner_gets_every_chunk_in_order() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(resource, settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Replay(Vec::new()));
    let endpoint = next_endpoint(&mut endpoints).await;

    let chunks: Vec<String> = (0..10).map(|i| format!("chunk {i}\n")).collect();
    for chunk in &chunks {
        endpoint.to_relay.send(data(chunk)).await.unwrap();
    }
    for chunk in &chunks {
        assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data(chunk)));
    }

    let (_, mut b) = hubs.attach(&key()).await.unwrap();
    let expected: Vec<Vec<u8>> = chunks.iter().map(|c| data(c)).collect();
    assert_eq!(next_event(&mut b.events).await, ClientEvent::Replay(expected));
    assert_eq!(hub.client_count().await, 2);
}

#[tokio::test]
async fn replay_keeps_only_the_newest_chunks() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(
        resource,
        HubSettings {
            idle_grace: Duration::from_secs(60),
            ..settings()
        },
    );
    let capacity = settings().replay_capacity;

    hubs.start(&key()).await.unwrap();
    let hub = hubs.get(&key()).unwrap();
    let endpoint = next_endpoint(&mut endpoints).await;

    for i in 0..capacity + 5 {
        endpoint.to_relay.send(data(&format!("{i}"))).await.unwrap();
    }
    // The last chunk landing means every earlier one has too.
    let last = format!("{}", capacity + 4);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while hub.replay_snapshot().await.last().map(Vec::as_slice) != Some(last.as_bytes()) {
        assert!(tokio::time::Instant::now() < deadline, "replay never caught up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (_, mut client) = hubs.attach(&key()).await.unwrap();
    let ClientEvent::Replay(frames) = next_event(&mut client.events).await else {
        panic!("first event must be the replay");
    };
    assert_eq!(frames.len(), capacity);
    for (i, frame) in frames.iter().enumerate() {
        assert!(is_data(frame, &format!("{}", i + 5)), "chunk {i} out of order");
    }
}

#[tokio::test]
async fn frames_queued_while_connecting_flush_in_order() {
    let (resource, mut endpoints) = FakeResource::new(true);
    let hubs = registry(resource.clone(), settings());

    let (hub, a) = hubs.attach(&key()).await.unwrap();
    assert_eq!(hub.state(), HubState::Connecting);

    for payload in ["a", "b", "c"] {
        hub.send(a.id, data(payload)).await.unwrap();
    }
    resource.open_gate();
    let mut endpoint = next_endpoint(&mut endpoints).await;
    wait_state(&hub, |s| *s == HubState::Connected).await;
    hub.send(a.id, data("d")).await.unwrap();

    for payload in ["a", "b", "c", "d"] {
        assert!(is_data(&next_upstream(&mut endpoint).await, payload));
    }
}

#[tokio::test]
async fn concurrent_starts_provision_once() {
    let (resource, _endpoints) = FakeResource::new(false);
    let hubs = registry(resource.clone(), settings());

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let hubs = hubs.clone();
        tasks.push(tokio::spawn(async move { hubs.start(&key()).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(resource.starts.load(Ordering::SeqCst), 1);
    assert_eq!(resource.connects.load(Ordering::SeqCst), 1);
    assert_eq!(
        hubs.context().coordinator.state(&key().resource_id()),
        ProvisionState::Started
    );
}

#[tokio::test]
async fn failed_client_is_removed_alone() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(resource, settings());

    let (hub, mut one) = hubs.attach(&key()).await.unwrap();
    let (_, two) = hubs.attach(&key()).await.unwrap();
    let (_, mut three) = hubs.attach(&key()).await.unwrap();
    let endpoint = next_endpoint(&mut endpoints).await;
    wait_state(&hub, |s| *s == HubState::Connected).await;
    next_event(&mut one.events).await;
    next_event(&mut three.events).await;

    // Client 2's connection is gone: every write to it fails.
    drop(two);
    endpoint.to_relay.send(data("x")).await.unwrap();

    assert_eq!(next_event(&mut one.events).await, ClientEvent::Frame(data("x")));
    assert_eq!(next_event(&mut three.events).await, ClientEvent::Frame(data("x")));
    assert_eq!(hub.client_count().await, 2);
}

#[tokio::test]
async fn slow_client_is_dropped_without_stalling_others() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(
        resource,
        HubSettings {
            client_buffer: 2,
            ..settings()
        },
    );

    let (hub, mut fast) = hubs.attach(&key()).await.unwrap();
    let (_, mut slow) = hubs.attach(&key()).await.unwrap();
    let endpoint = next_endpoint(&mut endpoints).await;
    next_event(&mut fast.events).await;

    for payload in ["1", "2", "3"] {
        endpoint.to_relay.send(data(payload)).await.unwrap();
        assert_eq!(next_event(&mut fast.events).await, ClientEvent::Frame(data(payload)));
    }
    assert_eq!(hub.client_count().await, 1);

    // The slow client keeps what fit in its buffer, then its channel ends.
    assert!(matches!(next_event(&mut slow.events).await, ClientEvent::Replay(_)));
    assert_eq!(next_event(&mut slow.events).await, ClientEvent::Frame(data("1")));
    assert_eq!(slow.events.recv().await, None);
}

#[tokio::test]
async fn end_to_end_two_clients() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(resource, settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Replay(Vec::new()));
    hubs.start(&key()).await.unwrap();
    assert_eq!(hub.state(), HubState::Connected);
    let mut endpoint = next_endpoint(&mut endpoints).await;

    endpoint.to_relay.send(data("hello\n")).await.unwrap();
    endpoint.to_relay.send(data("world\n")).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("hello\n")));
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("world\n")));

    let (_, mut b) = hubs.attach(&key()).await.unwrap();
    assert_eq!(
        next_event(&mut b.events).await,
        ClientEvent::Replay(vec![data("hello\n"), data("world\n")])
    );

    endpoint.to_relay.send(data("!\n")).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("!\n")));
    assert_eq!(next_event(&mut b.events).await, ClientEvent::Frame(data("!\n")));

    hub.detach(b.id).await;
    endpoint.to_relay.send(data("after\n")).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("after\n")));
    assert_eq!(b.events.recv().await, None);
    let snapshot = hub.replay_snapshot().await;
    assert_eq!(snapshot.last().map(Vec::as_slice), Some(b"after\n".as_slice()));

    hub.detach(a.id).await;
    assert_eq!(hub.state(), HubState::Connected);
    let closed = wait_state(&hub, HubState::is_closed).await;
    assert_eq!(closed, HubState::Closed(CloseReason::Idle));

    // The hub dropped its end of the upstream channel.
    let upstream_end = tokio::time::timeout(Duration::from_secs(2), endpoint.from_relay.recv())
        .await
        .unwrap();
    assert_eq!(upstream_end, None);
    assert!(hubs.get(&key()).is_none());
}

#[tokio::test]
async fn resize_frames_reach_upstream_but_are_never_broadcast() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(resource, settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    next_event(&mut a.events).await;
    let mut endpoint = next_endpoint(&mut endpoints).await;
    wait_state(&hub, |s| *s == HubState::Connected).await;

    let resize = tabrelay_core::frame::encode_resize(tabrelay_core::Geometry {
        columns: 120,
        rows: 40,
    })
    .unwrap();
    hub.send(a.id, resize.clone()).await.unwrap();
    assert_eq!(next_upstream(&mut endpoint).await, resize);

    endpoint.to_relay.send(resize).await.unwrap();
    endpoint.to_relay.send(data("prompt$ ")).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("prompt$ ")));
    assert_eq!(hub.replay_snapshot().await, vec![b"prompt$ ".to_vec()]);
}

#[tokio::test]
async fn unknown_client_tags_are_rejected() {
    let (resource, _endpoints) = FakeResource::new(true);
    let hubs = registry(resource, settings());
    let (hub, a) = hubs.attach(&key()).await.unwrap();

    let err = hub.send(a.id, b"9junk".to_vec()).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidFrame(_)));
    let err = hub.send(a.id, Vec::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidFrame(_)));
    let err = hub.send(a.id + 100, data("x")).await.unwrap_err();
    assert!(matches!(err, RelayError::ClientWrite(_)));
}

#[tokio::test]
async fn connect_failure_closes_hub_and_next_attach_starts_fresh() {
    let (resource, mut endpoints) = FakeResource::new(false);
    resource.fail_connect.store(true, Ordering::SeqCst);
    let hubs = registry(resource.clone(), settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    assert!(matches!(next_event(&mut a.events).await, ClientEvent::Replay(_)));
    let ClientEvent::Closed(CloseReason::UpstreamUnavailable { message }) =
        next_event(&mut a.events).await
    else {
        panic!("expected an upstream failure");
    };
    assert!(message.contains("connection refused"));
    assert_eq!(resource.wakes.load(Ordering::SeqCst), 1);
    assert_eq!(resource.connects.load(Ordering::SeqCst), 2);
    assert!(hub.state().is_closed());
    assert!(hubs.get(&key()).is_none());

    let err = hubs.start(&key()).await.unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnavailable(_)));

    resource.fail_connect.store(false, Ordering::SeqCst);
    let (fresh, _b) = hubs.attach(&key()).await.unwrap();
    assert!(!std::ptr::eq(fresh.as_ref(), hub.as_ref()));
    next_endpoint(&mut endpoints).await;
    wait_state(&fresh, |s| *s == HubState::Connected).await;
    // Provisioning already succeeded once and is not repeated.
    assert_eq!(resource.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_failure_is_reported_and_retried_later() {
    let (resource, _endpoints) = FakeResource::new(false);
    resource.fail_start.store(true, Ordering::SeqCst);
    let hubs = registry(resource.clone(), settings());

    let err = hubs.start(&key()).await.unwrap_err();
    let RelayError::UpstreamUnavailable(message) = err else {
        panic!("expected upstream unavailable, got {err:?}");
    };
    assert!(message.contains("image build failed"));
    assert_eq!(
        hubs.context().coordinator.state(&key().resource_id()),
        ProvisionState::NotStarted
    );

    resource.fail_start.store(false, Ordering::SeqCst);
    hubs.start(&key()).await.unwrap();
    assert_eq!(resource.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn teardown_notifies_clients_and_releases_resource() {
    let (resource, _endpoints) = FakeResource::new(false);
    let hubs = registry(resource.clone(), settings());

    let (hub_a, mut a) = hubs.attach(&key()).await.unwrap();
    let other = TabKey::new("sess", "tab-2").unwrap();
    let (hub_b, mut b) = hubs.attach(&other).await.unwrap();
    next_event(&mut a.events).await;
    next_event(&mut b.events).await;
    wait_state(&hub_a, |s| *s == HubState::Connected).await;
    wait_state(&hub_b, |s| *s == HubState::Connected).await;

    assert!(hubs.teardown_tab(&key()).await);
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Closed(CloseReason::TornDown));
    assert_eq!(hubs.count(), 1);

    assert_eq!(hubs.teardown_session("sess").await, 1);
    assert_eq!(next_event(&mut b.events).await, ClientEvent::Closed(CloseReason::TornDown));
    assert_eq!(hubs.count(), 0);
    assert_eq!(resource.releases.load(Ordering::SeqCst), 2);
    assert_eq!(
        hubs.context().coordinator.state(&key().resource_id()),
        ProvisionState::NotStarted
    );
}

#[tokio::test]
async fn hub_reports_activity() {
    let (resource, _endpoints) = FakeResource::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let hubs = HubRegistry::new(HubContext::new(resource, settings()).with_activity(tx));

    let (hub, a) = hubs.attach(&key()).await.unwrap();
    hub.send(a.id, data("ls\n")).await.unwrap();
    hub.detach(a.id).await;

    let kinds: Vec<ActivityKind> = [
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ]
    .into_iter()
    .map(|ev| {
        assert_eq!(ev.session_id, "sess");
        assert_eq!(ev.tab_id, "tab-1");
        ev.kind
    })
    .collect();
    assert_eq!(
        kinds,
        vec![ActivityKind::Attach, ActivityKind::Frame, ActivityKind::Detach]
    );
}

#[tokio::test(start_paused = true)]
async fn reattach_within_grace_keeps_upstream() {
    let (resource, _endpoints) = FakeResource::new(false);
    let hubs = registry(
        resource.clone(),
        HubSettings {
            idle_grace: Duration::from_secs(30),
            ..settings()
        },
    );

    let (hub, a) = hubs.attach(&key()).await.unwrap();
    hubs.start(&key()).await.unwrap();
    hub.detach(a.id).await;

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(hub.state(), HubState::Connected);
    let (same, b) = hubs.attach(&key()).await.unwrap();
    assert!(std::ptr::eq(same.as_ref(), hub.as_ref()));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(hub.state(), HubState::Connected);

    let left_at = tokio::time::Instant::now();
    hub.detach(b.id).await;
    tokio::time::advance(Duration::from_secs(31)).await;
    let closed = wait_state(&hub, HubState::is_closed).await;
    assert_eq!(closed, HubState::Closed(CloseReason::Idle));
    assert!(left_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(resource.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stalled_upstream_input_does_not_freeze_the_hub() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(
        resource,
        HubSettings {
            idle_grace: Duration::from_secs(60),
            ..settings()
        },
    );

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    next_event(&mut a.events).await;
    // Held but never read: the upstream stops taking input.
    let endpoint = next_endpoint(&mut endpoints).await;
    wait_state(&hub, |s| *s == HubState::Connected).await;

    // One frame more than the upstream channel holds.
    let writer = {
        let hub = hub.clone();
        let id = a.id;
        tokio::spawn(async move {
            for i in 0..=UPSTREAM_TEST_CAPACITY {
                hub.send(id, data(&format!("{i}"))).await?;
            }
            Ok::<_, RelayError>(())
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer.is_finished());

    endpoint.to_relay.send(data("out\n")).await.unwrap();
    assert_eq!(next_event(&mut a.events).await, ClientEvent::Frame(data("out\n")));

    let (_, mut b) = tokio::time::timeout(Duration::from_secs(1), hubs.attach(&key()))
        .await
        .expect("attach blocked behind the upstream write")
        .unwrap();
    assert_eq!(
        next_event(&mut b.events).await,
        ClientEvent::Replay(vec![data("out\n")])
    );

    // Closing the hub releases the blocked writer.
    hub.close(CloseReason::TornDown).await;
    let result = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RelayError::HubClosed)));
    drop(endpoint);
}

#[tokio::test]
async fn remote_close_disconnects_every_client() {
    let (resource, mut endpoints) = FakeResource::new(false);
    let hubs = registry(resource, settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    let (_, mut b) = hubs.attach(&key()).await.unwrap();
    next_event(&mut a.events).await;
    next_event(&mut b.events).await;
    let endpoint = next_endpoint(&mut endpoints).await;
    wait_state(&hub, |s| *s == HubState::Connected).await;

    drop(endpoint);

    for client in [&mut a, &mut b] {
        assert_eq!(
            next_event(&mut client.events).await,
            ClientEvent::Closed(CloseReason::UpstreamExited)
        );
        assert_eq!(client.events.recv().await, None);
    }
    assert_eq!(hub.state(), HubState::Closed(CloseReason::UpstreamExited));
    // Closing runs under the hub lock, so once it is free again the hub is
    // out of the registry.
    assert_eq!(hub.client_count().await, 0);
    assert!(hubs.get(&key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn attach_timeout_reports_upstream_unavailable() {
    // Connects never complete.
    let (resource, _endpoints) = FakeResource::new(true);
    let hubs = registry(resource, settings());

    let (hub, mut a) = hubs.attach(&key()).await.unwrap();
    next_event(&mut a.events).await;

    let began = tokio::time::Instant::now();
    let err = hubs.start(&key()).await.unwrap_err();
    let RelayError::UpstreamUnavailable(message) = err else {
        panic!("expected upstream unavailable, got {err:?}");
    };
    assert!(message.contains("timeout"));
    assert!(began.elapsed() >= settings().attach_timeout);

    let ClientEvent::Closed(CloseReason::UpstreamUnavailable { .. }) =
        next_event(&mut a.events).await
    else {
        panic!("attached client must learn the upstream is unavailable");
    };
    assert!(hub.state().is_closed());
}
