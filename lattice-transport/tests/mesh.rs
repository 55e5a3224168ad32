//! End-to-end mesh lifecycle tests over the in-memory transport: direct
//! delivery with dedup, relay fallback and fan-out, handshake policing,
//! session replacement, the sync plane, and teardown.

mod common;

use std::time::{Duration, Instant};

use lattice_transport::{Priority, TransportError, MSG_SNAPSHOT};

use common::{auth_payload, connect, node_id, spawn_host, wait_until, MemoryNet};

// ── Direct delivery ──────────────────────────────────────────────

#[tokio::test]
async fn direct_send_delivers_once_and_dedups() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA1, 9101, true).await;
    let b = spawn_host(&net, 0xB1, 9102, false).await;
    connect(&b, &a).await;

    let snap = [0xAA; 32];
    a.host
        .send_snapshot_to_peer(b.host.id(), &snap, MSG_SNAPSHOT, &[0x01])
        .unwrap();
    wait_until(|| b.handle.delivered_len() == 1, "snapshot delivery").await;
    {
        let delivered = b.handle.delivered.lock();
        assert_eq!(delivered[0].0, a.host.id());
        assert_eq!(delivered[0].1.mtype, MSG_SNAPSHOT);
        assert_eq!(delivered[0].1.data, vec![0x01]);
    }
    assert_eq!(a.host.metric()[&MSG_SNAPSHOT].sent, 1);
    assert_eq!(b.host.metric()[&MSG_SNAPSHOT].received, 1);

    // Let the sender record the fingerprint, then repeat: the identical
    // send inside the dedup window goes nowhere.
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.host
        .send_snapshot_to_peer(b.host.id(), &snap, MSG_SNAPSHOT, &[0x01])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(b.handle.delivered_len(), 1);
    assert_eq!(a.host.metric()[&MSG_SNAPSHOT].sent, 1);

    a.host.teardown().await;
    b.host.teardown().await;
}

#[tokio::test]
async fn sync_ring_drains_to_the_consensus_layer() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA9, 9111, true).await;
    let b = spawn_host(&net, 0xB9, 9112, false).await;
    connect(&b, &a).await;

    let b_id = b.host.id();
    a.host.offer_sync_to_peer(b_id, vec![1, 2, 3]).unwrap();
    let a_handle = a.handle.clone();
    wait_until(move || !a_handle.synced.lock().is_empty(), "sync drain").await;
    assert_eq!(a.handle.synced.lock()[0], (b_id, vec![1, 2, 3]));

    let absent = a.host.offer_sync_to_peer(node_id(0x55), vec![9]);
    assert!(matches!(absent, Err(TransportError::UnknownPeer(_))));

    a.host.teardown().await;
    b.host.teardown().await;
}

// ── Relaying ─────────────────────────────────────────────────────

#[tokio::test]
async fn relay_fallback_reaches_the_destination() {
    let net = MemoryNet::new();
    let r = spawn_host(&net, 0xE1, 9201, true).await;
    let a = spawn_host(&net, 0xA2, 9202, false).await;
    let c = spawn_host(&net, 0xC2, 9203, false).await;
    connect(&a, &r).await;
    connect(&c, &r).await;

    // No discovery has happened; the configured relayer is the fallback.
    a.host
        .send_to_peer(c.host.id(), 0x77, None, &[0xFF], Priority::Normal)
        .unwrap();
    wait_until(|| c.handle.delivered_len() >= 1, "relayed delivery").await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    {
        let delivered = c.handle.delivered.lock();
        assert_eq!(delivered.len(), 1, "exactly one copy through the single relayer");
        assert_eq!(delivered[0].0, r.host.id());
        assert_eq!(delivered[0].1.mtype, 0x77);
        assert_eq!(delivered[0].1.data, vec![0xFF]);
    }

    a.host.teardown().await;
    r.host.teardown().await;
    c.host.teardown().await;
}

#[tokio::test]
async fn discovered_relayers_fan_out_independently() {
    let net = MemoryNet::new();
    let r1 = spawn_host(&net, 0xE3, 9301, true).await;
    let r2 = spawn_host(&net, 0xE4, 9302, true).await;
    // `a` flags itself as a relayer so r1/r2 gossip their consumer lists
    // to it, which is what fills its discovery table.
    let a = spawn_host(&net, 0xA3, 9303, true).await;
    let c = spawn_host(&net, 0xC3, 9304, false).await;
    connect(&a, &r1).await;
    connect(&a, &r2).await;
    connect(&c, &r1).await;
    connect(&c, &r2).await;

    let (a_host, c_id) = (a.host.clone(), c.host.id());
    wait_until(
        move || a_host.remote_relayers().map(|m| m.get(c_id).len()) == Some(2),
        "both relayers discovered for c",
    )
    .await;

    a.host
        .send_to_peer(c.host.id(), 0x5A, None, &[0x42], Priority::Normal)
        .unwrap();
    // One logical payload, two independent relay links, two deliveries.
    wait_until(|| c.handle.delivered_len() >= 2, "fan-out deliveries").await;
    {
        let delivered = c.handle.delivered.lock();
        let mut froms: Vec<_> = delivered.iter().map(|(from, _)| *from).collect();
        froms.sort();
        assert_eq!(froms, vec![r1.host.id(), r2.host.id()]);
        assert!(delivered.iter().all(|(_, m)| m.mtype == 0x5A && m.data == vec![0x42]));
    }

    for node in [a, c, r1, r2] {
        node.host.teardown().await;
    }
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn handshake_times_out_for_a_silent_client() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA5, 9401, false).await;

    let transport = net.transport();
    let client = transport.dial(a.host.addr()).await.unwrap();
    let start = Instant::now();
    // Never authenticate; the host must cut us off at its 3 s ceiling.
    let result = client.receive().await;
    assert!(result.is_err());
    assert!(start.elapsed() >= Duration::from_millis(2500));
    assert!(start.elapsed() < Duration::from_secs(8));
    assert!(a.host.neighbors().is_empty());

    a.host.teardown().await;
}

#[tokio::test]
async fn garbage_handshake_is_rejected() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA7, 9402, false).await;

    let transport = net.transport();
    let client = transport.dial(a.host.addr()).await.unwrap();
    client.send(&[MSG_SNAPSHOT, 0x00]).await.unwrap();
    let result = client.receive().await;
    assert!(result.is_err(), "non-authentication first frame closes the stream");
    assert!(a.host.neighbors().is_empty());

    a.host.teardown().await;
}

#[tokio::test]
async fn reconnecting_peer_replaces_its_session() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA8, 9403, true).await;
    let b_id = node_id(0xB8);

    let transport = net.transport();
    let first = transport.dial(a.host.addr()).await.unwrap();
    first.send(&auth_payload(b_id, false)).await.unwrap();
    let a_host = a.host.clone();
    wait_until(move || a_host.neighbor(b_id).is_some(), "first session").await;
    let old = a.host.neighbor(b_id).unwrap();

    let second = transport.dial(a.host.addr()).await.unwrap();
    second.send(&auth_payload(b_id, false)).await.unwrap();
    let (a_host, old_session) = (a.host.clone(), old.clone());
    wait_until(
        move || {
            a_host
                .neighbor(b_id)
                .is_some_and(|current| !std::sync::Arc::ptr_eq(&current, &old_session))
        },
        "replacement session",
    )
    .await;
    assert!(old.is_closing());
    assert_eq!(a.host.neighbors().len(), 1);

    a.host.teardown().await;
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn teardown_joins_every_session() {
    let net = MemoryNet::new();
    let a = spawn_host(&net, 0xA6, 9501, true).await;
    let b = spawn_host(&net, 0xB6, 9502, false).await;
    let c = spawn_host(&net, 0xC6, 9503, false).await;
    connect(&b, &a).await;
    connect(&c, &a).await;

    // Some traffic in flight, so teardown drains a live mesh.
    a.host
        .send_to_peer(b.host.id(), 0x33, None, &[1], Priority::High)
        .unwrap();
    a.host
        .send_to_peer(c.host.id(), 0x33, None, &[2], Priority::Normal)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), a.host.teardown())
        .await
        .expect("teardown joins all sessions");
    assert!(a.host.is_closing());
    // Idempotent.
    tokio::time::timeout(Duration::from_secs(1), a.host.teardown())
        .await
        .expect("second teardown returns immediately");

    // The supervised dialers observe the drop and fail to reconnect.
    let (b_host, a_id) = (b.host.clone(), a.host.id());
    wait_until(move || b_host.neighbor(a_id).is_none(), "b loses its session").await;
    let (c_host, a_id) = (c.host.clone(), a.host.id());
    wait_until(move || c_host.neighbor(a_id).is_none(), "c loses its session").await;

    b.host.teardown().await;
    c.host.teardown().await;
}
