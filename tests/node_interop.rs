//! Two-node loopback scenarios (spec.md §8, E1-E6).
//!
//! Each simulated node binds its shared UDP socket and TCP listener to a
//! distinct address in the loopback range (127.0.0.1, 127.0.0.2, ...) on
//! the fixed LCP port, which lets two nodes coexist in one test process
//! without colliding, while still dialing the one real port the protocol
//! specifies. Discovery's broadcast send itself is not exercised here
//! (loopback aliases don't form a real broadcast domain); instead these
//! tests drive the same `handle_echo`/`handle_header` receive path with a
//! direct unicast Echo, which is indistinguishable to the receiver.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lcp_node::collaborators::{DefaultFilenameSanitizer, MimeGuessSniffer};
use lcp_node::discovery::{bind_shared_socket, Discovery, PORT};
use lcp_node::identity::UserId;
use lcp_node::messaging::{bind_tcp_listener, Messaging};
use lcp_node::peer::PeerTable;
use lcp_node::persistence::json::{JsonHistoryStore, JsonPeerStore};
use lcp_node::persistence::{HistoryEntry, HistoryStore, PeerStore};
use lcp_node::wire::{Header, OpCode, Status};

struct TestNode {
    id: UserId,
    ip: Ipv4Addr,
    peers: Arc<PeerTable>,
    discovery: Arc<Discovery>,
    messaging: Arc<Messaging>,
    history_path: std::path::PathBuf,
}

impl TestNode {
    fn history(&self) -> JsonHistoryStore {
        JsonHistoryStore::new(&self.history_path)
    }
}

async fn build_node(name: &str, ip: Ipv4Addr) -> TestNode {
    let id = UserId::normalize(name);
    let dir = tempfile::tempdir().unwrap().into_path();
    let history_path = dir.join("history.json");

    let peer_store: Arc<dyn PeerStore> = Arc::new(JsonPeerStore::new(dir.join("peers.json")));
    let history: Arc<dyn HistoryStore> = Arc::new(JsonHistoryStore::new(&history_path));

    let peers = PeerTable::new(id, vec![ip, Ipv4Addr::LOCALHOST]);
    let socket = Arc::new(bind_shared_socket(ip, PORT).expect("bind udp"));
    let tcp_listener = Arc::new(bind_tcp_listener(ip, PORT).expect("bind tcp"));

    let discovery = Discovery::new(
        id,
        ip,
        Duration::from_millis(200),
        socket.clone(),
        peers.clone(),
        peer_store,
    );
    let messaging = Messaging::new(
        id,
        socket,
        tcp_listener,
        peers.clone(),
        discovery.clone(),
        history,
        dir.join("downloads"),
        Arc::new(DefaultFilenameSanitizer::default()),
        Arc::new(MimeGuessSniffer),
        1024,
    );

    discovery.spawn_broadcast_loop();
    discovery.spawn_persist_loop();
    messaging.spawn_udp_receiver();
    messaging.spawn_tcp_acceptor();
    messaging.spawn_sweeper();
    messaging.spawn_work_queue_consumer();

    TestNode {
        id,
        ip,
        peers,
        discovery,
        messaging,
        history_path,
    }
}

async fn exchange_echo(a: &TestNode, b: &TestNode) {
    let header = Header {
        from: a.id,
        to: lcp_node::identity::BROADCAST,
        op: OpCode::Echo,
        bid: 0,
        body_len: 0,
    };
    let socket = tokio::net::UdpSocket::bind((a.ip, 0)).await.unwrap();
    socket
        .send_to(&header.encode(), (b.ip, PORT))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn e1_discovery_learns_peer() {
    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 11)).await;
    let b = build_node("bob", Ipv4Addr::new(127, 0, 0, 12)).await;

    exchange_echo(&a, &b).await;

    let peers = b.discovery.get_peers().await;
    assert_eq!(peers.len(), 1);
    let peer = peers.get(&a.id).expect("alice known to bob");
    assert_eq!(peer.ip, a.ip);
}

#[tokio::test]
async fn e2_message_round_trip() {
    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 21)).await;
    let b = build_node("bob", Ipv4Addr::new(127, 0, 0, 22)).await;
    a.peers.upsert(b.id, b.ip, chrono::Utc::now()).await;

    a.messaging
        .send(b.id, "hola", Duration::from_secs(2))
        .await
        .expect("message delivered");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_history = a.history().get_conversation(a.id, b.id).unwrap();
    assert!(a_history.iter().any(
        |e| matches!(e, HistoryEntry::Message { text, .. } if text == "hola")
    ));
}

#[tokio::test]
async fn e3_dropped_header_ack_is_retried() {
    use lcp_node::wire::{Response, Status};

    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 31)).await;
    let fake_bob_ip = Ipv4Addr::new(127, 0, 0, 32);
    let fake_bob_id = UserId::normalize("bob");
    a.peers.upsert(fake_bob_id, fake_bob_ip, chrono::Utc::now()).await;

    // A hand-rolled socket standing in for bob: drops the first header it
    // sees, then ACKs every header and body after that, so A's own retry
    // logic (not a second real node) is what's under test.
    let fake_bob = tokio::net::UdpSocket::bind((fake_bob_ip, PORT)).await.unwrap();
    let mut header_count = 0usize;
    let mut body_count = 0usize;
    let responder = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let (len, src) = match tokio::time::timeout(
                Duration::from_secs(3),
                fake_bob.recv_from(&mut buf),
            )
            .await
            {
                Ok(Ok(pair)) => pair,
                _ => break,
            };
            match lcp_node::wire::classify(len) {
                lcp_node::wire::Frame::Header => {
                    header_count += 1;
                    if header_count == 1 {
                        continue; // drop the first header-ACK
                    }
                    let response = Response {
                        status: Status::Ok,
                        responder: fake_bob_id,
                    };
                    let _ = fake_bob.send_to(&response.encode(), src).await;
                }
                _ => {
                    body_count += 1;
                    let response = Response {
                        status: Status::Ok,
                        responder: fake_bob_id,
                    };
                    let _ = fake_bob.send_to(&response.encode(), src).await;
                    if body_count >= 1 {
                        break;
                    }
                }
            }
        }
        (header_count, body_count)
    });

    a.messaging
        .send(fake_bob_id, "hola", Duration::from_secs(2))
        .await
        .expect("message delivered after one retry");

    let (headers_seen, bodies_seen) = responder.await.unwrap();
    assert_eq!(headers_seen, 2, "A should have retried the header exactly once");
    assert_eq!(bodies_seen, 1, "the body should have been observed exactly once");
}

#[tokio::test]
async fn e4_broadcast_file_is_rejected() {
    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 41)).await;
    let b = build_node("bob", Ipv4Addr::new(127, 0, 0, 42)).await;
    a.peers.upsert(b.id, b.ip, chrono::Utc::now()).await;

    let header = Header {
        from: a.id,
        to: lcp_node::identity::BROADCAST,
        op: OpCode::File,
        bid: 5,
        body_len: 1024,
    };
    let socket = tokio::net::UdpSocket::bind((a.ip, 0)).await.unwrap();
    socket
        .send_to(&header.encode(), (b.ip, PORT))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .expect("a response arrives")
        .unwrap();
    let response = lcp_node::wire::Response::decode(&buf[..len]).unwrap();
    assert_eq!(response.status, Status::BadRequest);
}

#[tokio::test]
async fn e5_file_transfer_checksum_matches() {
    use sha2::{Digest, Sha256};

    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 51)).await;
    let b = build_node("bob", Ipv4Addr::new(127, 0, 0, 52)).await;
    a.peers.upsert(b.id, b.ip, chrono::Utc::now()).await;

    let payload: Vec<u8> = (0..(256 * 1024)).map(|i| (i % 251) as u8).collect();
    let expected_hash = {
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hasher.finalize()
    };

    a.messaging
        .send_file(b.id, &payload, "x.bin", Duration::from_secs(5))
        .await
        .expect("file transfer succeeds");

    // The downloads directory is node-specific; read the landed path back
    // out of b's history entry rather than guessing it.
    let history = b.history().get_conversation(a.id, b.id).unwrap();
    let file_entry = history
        .iter()
        .find_map(|e| match e {
            HistoryEntry::File { path, size, .. } => Some((path.clone(), *size)),
            _ => None,
        })
        .expect("b recorded the file transfer");

    let (path, size) = file_entry;
    assert_eq!(size, payload.len() as u64);
    let on_disk = tokio::fs::read(&path).await.expect("file landed on disk");
    assert_eq!(on_disk.len(), payload.len());
    let mut hasher = Sha256::new();
    hasher.update(&on_disk);
    assert_eq!(hasher.finalize(), expected_hash);
}

#[tokio::test]
async fn e6_offline_peer_fails_delivery_after_retries() {
    let a = build_node("alice", Ipv4Addr::new(127, 0, 0, 61)).await;
    // Simulate a peer that was once seen but is now gone: insert a peer
    // record pointing at an address nothing listens on.
    let ghost_id = UserId::normalize("ghost");
    a.peers
        .upsert(ghost_id, Ipv4Addr::new(127, 0, 0, 99), chrono::Utc::now())
        .await;

    let result = a
        .messaging
        .send(ghost_id, "are you there", Duration::from_millis(100))
        .await;
    assert!(result.is_err());
}
