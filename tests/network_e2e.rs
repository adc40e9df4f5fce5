//! End-to-end scenarios over loopback TCP

use peerlink::config::NetworkConfig;
use peerlink::network::{Envelope, MessageKind, NetworkEvent, Node, Payload};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn config() -> NetworkConfig {
    NetworkConfig {
        listen_address: "127.0.0.1".into(),
        listen_port: 0,
        min_peers: 1,
        max_peers: 8,
        enable_bootstrap: false,
        upkeep_interval_secs: 3600,
        warden_decay_interval_secs: 3600,
        shutdown_grace_secs: 1,
        ..Default::default()
    }
}

/// Poll `condition` until it holds or the deadline passes
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(payload);
    buf
}

async fn connected_pair() -> (Node, Node) {
    let a = Node::start(config()).await.unwrap();
    let b = Node::start(config()).await.unwrap();
    a.table().add_peer(b.local_endpoint().clone());
    b.table().add_peer(a.local_endpoint().clone());

    tokio::join!(a.table().upkeep(), b.table().upkeep());

    let linked = eventually(|| {
        a.peer_count() == 1
            && b.peer_count() == 1
            && a.table().connected_peers().len() == 1
            && b.table().connected_peers().len() == 1
    })
    .await;
    assert!(linked, "nodes did not settle on one link");
    (a, b)
}

#[tokio::test]
async fn test_two_nodes_connect_to_each_other() {
    let (a, b) = connected_pair().await;

    let seen_by_a = a.table().connected_peers().remove(0);
    let seen_by_b = b.table().connected_peers().remove(0);
    assert_eq!(
        seen_by_a.identity.unwrap().session_id,
        b.identity().session_id
    );
    assert_eq!(
        seen_by_b.identity.unwrap().session_id,
        a.identity().session_id
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_peer_table_request_is_answered() {
    let (a, b) = connected_pair().await;
    let mut events = a.subscribe();
    let key = a.table().connected_peers().remove(0).key;

    assert!(a.table().send_to(&key, Payload::PeerTableRequest));

    let reply = timeout(WAIT, async {
        loop {
            if let Ok(NetworkEvent::Message { kind, envelope, .. }) = events.recv().await {
                if kind == MessageKind::PeerTableReply {
                    return envelope;
                }
            }
        }
    })
    .await
    .expect("no peer table reply");
    assert!(reply.ack);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_malformed_flood_gets_banned() {
    let mut cfg = config();
    cfg.min_peers = 0;
    cfg.ban_threshold = 20;
    let node = Node::start(cfg).await.unwrap();
    let mut events = node.subscribe();
    let target = node.local_endpoint().to_string();

    let mut attacker = TcpStream::connect(target.as_str()).await.unwrap();
    assert!(eventually(|| node.peer_count() == 1).await);

    let mut flood = Vec::new();
    for _ in 0..21 {
        flood.extend(frame(b"{not an envelope"));
    }
    attacker.write_all(&flood).await.unwrap();

    assert!(eventually(|| node.table().is_banned("127.0.0.1")).await);
    node.table().upkeep().await;
    assert_eq!(node.peer_count(), 0);
    assert!(node.table().connected_peers().is_empty());

    let banned = timeout(WAIT, async {
        loop {
            if let Ok(NetworkEvent::PeerBanned { address, .. }) = events.recv().await {
                return address;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(banned, "127.0.0.1");

    // A fresh connection from the banned address is closed on arrival
    let mut again = TcpStream::connect(target.as_str()).await.unwrap();
    let mut buf = [0u8; 64];
    let read = timeout(WAIT, again.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(node.peer_count(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_unannounced_traffic_is_ignored() {
    let mut cfg = config();
    cfg.min_peers = 0;
    let node = Node::start(cfg).await.unwrap();
    let mut stream = TcpStream::connect(node.local_endpoint().to_string())
        .await
        .unwrap();
    assert!(eventually(|| node.peer_count() == 1).await);

    let heartbeat = Envelope::new(1, Payload::Heartbeat { timestamp: 0 })
        .to_bytes()
        .unwrap();
    stream.write_all(&frame(&heartbeat)).await.unwrap();

    assert!(eventually(|| node.table().warden().score("127.0.0.1") == 5).await);
    assert_eq!(node.peer_count(), 1);
    assert!(node.table().connected_peers().is_empty());

    node.shutdown().await;
}
