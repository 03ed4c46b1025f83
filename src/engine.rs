//! Engine: lifecycle wiring for a single LCP node (spec.md §4.5).
//!
//! Grounded on the teacher's `Node` construction sequence in `main.rs`:
//! open storage, construct components, start workers.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::collaborators::{DefaultFilenameSanitizer, FileTypeSniffer, FilenameSanitizer, MimeGuessSniffer};
use crate::config::NodeConfig;
use crate::discovery::{bind_shared_socket, select_local_ip, Discovery, PORT};
use crate::error::MessagingError;
use crate::identity::UserId;
use crate::messaging::{bind_tcp_listener, Messaging};
use crate::peer::{Peer, PeerTable};
use crate::persistence::json::{JsonHistoryStore, JsonPeerStore};
use crate::persistence::{HistoryStore, PeerStore};

/// A fully wired LCP node: discovery + messaging + persistence, ready to
/// `start()`.
pub struct Engine {
    pub local_id: UserId,
    pub local_ip: Ipv4Addr,
    pub peers: Arc<PeerTable>,
    pub discovery: Arc<Discovery>,
    pub messaging: Arc<Messaging>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Builds a node from `config`, binding the shared UDP socket and the
    /// TCP listener, loading persisted peer state, and wiring Discovery +
    /// Messaging over `Arc`-shared handles. Does not yet spawn workers —
    /// call [`Engine::start`] for that.
    pub async fn new(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        Self::new_with_collaborators(
            config,
            Arc::new(DefaultFilenameSanitizer::default()),
            Arc::new(MimeGuessSniffer),
        )
        .await
    }

    pub async fn new_with_collaborators(
        config: NodeConfig,
        sanitizer: Arc<dyn FilenameSanitizer>,
        sniffer: Arc<dyn FileTypeSniffer>,
    ) -> anyhow::Result<Arc<Self>> {
        let local_id = UserId::normalize(&config.user_id);
        let (local_ip, local_ips) = select_local_ip();
        info!("selected local address {}", local_ip);

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.downloads_dir)?;

        let peer_store: Arc<dyn PeerStore> =
            Arc::new(JsonPeerStore::new(config.data_dir.join("peers.json")));
        let history: Arc<dyn HistoryStore> =
            Arc::new(JsonHistoryStore::new(config.data_dir.join("history.json")));

        let peers = PeerTable::new(local_id, local_ips);
        let loaded: std::collections::HashMap<UserId, Peer> = peer_store.load()?;
        peers.load(loaded).await;

        let socket = Arc::new(bind_shared_socket(local_ip, PORT)?);
        let tcp_listener = Arc::new(bind_tcp_listener(local_ip, PORT)?);

        let discovery = Discovery::new(
            local_id,
            local_ip,
            config.broadcast_interval,
            socket.clone(),
            peers.clone(),
            peer_store,
        );

        let messaging = Messaging::new(
            local_id,
            socket,
            tcp_listener,
            peers.clone(),
            discovery.clone(),
            history,
            config.downloads_dir,
            sanitizer,
            sniffer,
            config.queue_capacity,
        );

        Ok(Arc::new(Self {
            local_id,
            local_ip,
            peers,
            discovery,
            messaging,
            workers: tokio::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the six background workers named in spec.md §5:
    /// `disc_broadcast`, `disc_persist`, `udp_recv`, `tcp_accept`,
    /// `msg_consumer`, `pending_sweeper`.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();
        handles.push(self.discovery.spawn_broadcast_loop());
        handles.push(self.discovery.spawn_persist_loop());
        handles.push(self.messaging.spawn_udp_receiver());
        handles.push(self.messaging.spawn_tcp_acceptor());
        handles.push(self.messaging.spawn_sweeper());
        handles.push(self.messaging.spawn_work_queue_consumer());
        *self.workers.lock().await = handles;
        info!("engine started for {}", self.local_id);
    }

    /// Flips every worker's shutdown flag and waits for them to exit.
    pub async fn shutdown(&self) {
        self.discovery.shutdown_flag().store(true, Ordering::Relaxed);
        self.messaging.shutdown_flag().store(true, Ordering::Relaxed);
        let handles = self.workers.lock().await.drain(..).collect::<Vec<_>>();
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped for {}", self.local_id);
    }

    pub async fn send(&self, recipient: UserId, text: &str) -> Result<(), MessagingError> {
        self.messaging
            .send(recipient, text, Duration::from_secs(5))
            .await
    }

    pub async fn send_file(
        &self,
        recipient: UserId,
        bytes: &[u8],
        filename: &str,
    ) -> Result<(), MessagingError> {
        self.messaging
            .send_file(recipient, bytes, filename, Duration::from_secs(5))
            .await
    }

    pub async fn peers(&self) -> std::collections::HashMap<UserId, Peer> {
        self.discovery.get_peers().await
    }

    pub async fn force_discover(&self) {
        self.discovery.force_discover().await;
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Node-level TCP reachability heuristic (spec.md §6 `engine.tcp_ok`).
    pub fn tcp_ok(&self) -> bool {
        self.messaging.tcp_ok()
    }
}
