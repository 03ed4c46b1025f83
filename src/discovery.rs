//! Discovery: local IP selection, the broadcast probe loop, reply
//! handling, the persist loop, and `force_discover()` (spec.md §4.3).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::identity::{UserId, BROADCAST};
use crate::peer::PeerTable;
use crate::persistence::PeerStore;
use crate::wire::{Header, OpCode, Response, Status};

/// The LAN heuristic of spec.md §4.3: prefer an interface address whose
/// dotted prefix matches this subnet.
pub const PREFERRED_SUBNET_PREFIX: &str = "192.168.1.";

/// Fixed LCP port, shared by UDP control and TCP bulk transfer.
pub const PORT: u16 = 9990;

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Enumerates host interfaces and selects the address to bind per the
/// LAN heuristic. Returns `(selected, all_local_ips)`; `all_local_ips`
/// always includes `127.0.0.1` and is what `PeerTable` filters against.
pub fn select_local_ip() -> (Ipv4Addr, Vec<Ipv4Addr>) {
    let mut candidates = Vec::new();
    if let Ok(ifaces) = NetworkInterface::show() {
        for iface in ifaces {
            for addr in iface.addr {
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    if !v4.is_loopback() {
                        candidates.push(v4);
                    }
                }
            }
        }
    }

    let selected = candidates
        .iter()
        .find(|ip| ip.to_string().starts_with(PREFERRED_SUBNET_PREFIX))
        .or_else(|| candidates.first())
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let mut all = candidates;
    all.push(Ipv4Addr::LOCALHOST);
    (selected, all)
}

/// Binds the UDP socket shared by Discovery and Messaging, with
/// `SO_REUSEADDR` and `SO_BROADCAST` set (spec.md §4.3). Falls back to
/// `0.0.0.0` on bind failure.
pub fn bind_shared_socket(preferred_ip: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let bind = |ip: Ipv4Addr| -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_recv_buffer_size(crate::messaging::SOCKET_BUF_SIZE)?;
        socket.set_send_buffer_size(crate::messaging::SOCKET_BUF_SIZE)?;
        socket.bind(&std::net::SocketAddr::new(ip.into(), port).into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };

    let std_socket = match bind(preferred_ip) {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "bind to {} failed ({}), falling back to 0.0.0.0",
                preferred_ip, e
            );
            bind(Ipv4Addr::UNSPECIFIED)?
        }
    };
    UdpSocket::from_std(std_socket)
}

fn subnet_directed_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 255)
}

pub struct Discovery {
    local_id: UserId,
    local_ip: Ipv4Addr,
    broadcast_interval: Duration,
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    peer_store: Arc<dyn PeerStore>,
    shutdown: Arc<AtomicBool>,
    // Serializes concurrent `send_to` calls from the broadcast loop and
    // `force_discover`.
    send_lock: Mutex<()>,
}

impl Discovery {
    pub fn new(
        local_id: UserId,
        local_ip: Ipv4Addr,
        broadcast_interval: Duration,
        socket: Arc<UdpSocket>,
        peers: Arc<PeerTable>,
        peer_store: Arc<dyn PeerStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            local_ip,
            broadcast_interval,
            socket,
            peers,
            peer_store,
            shutdown: Arc::new(AtomicBool::new(false)),
            send_lock: Mutex::new(()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn get_peers(&self) -> std::collections::HashMap<UserId, crate::peer::Peer> {
        self.peers.snapshot().await
    }

    /// Synchronous re-trigger of the broadcast, for the UI's on-demand
    /// refresh button (spec.md §4.3).
    pub async fn force_discover(&self) {
        self.broadcast_once().await;
    }

    async fn broadcast_once(&self) {
        let header = Header {
            from: self.local_id,
            to: BROADCAST,
            op: OpCode::Echo,
            bid: 0,
            body_len: 0,
        };
        let bytes = header.encode();
        let targets = [
            subnet_directed_broadcast(self.local_ip),
            Ipv4Addr::new(255, 255, 255, 255),
        ];
        let _guard = self.send_lock.lock().await;
        for target in targets {
            let addr = (target, PORT);
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                warn!("broadcast send to {} failed: {}", target, e);
            }
        }
    }

    /// Worker B: the recurring broadcast loop.
    pub fn spawn_broadcast_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.broadcast_interval);
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                interval.tick().await;
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                this.broadcast_once().await;
            }
            debug!("disc_broadcast worker exiting");
        })
    }

    /// Worker P: the recurring persist loop.
    pub fn spawn_persist_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_INTERVAL);
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                interval.tick().await;
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let snapshot = this.peers.snapshot().await;
                if let Err(e) = this.peer_store.save(&snapshot) {
                    warn!("peer snapshot save failed: {}", e);
                }
            }
            debug!("disc_persist worker exiting");
        })
    }

    /// Called by Messaging's UDP receiver for an Echo header (op=0):
    /// upserts the sender and replies `OK` with the local id.
    pub async fn handle_echo(&self, from: UserId, src_ip: Ipv4Addr) {
        self.peers.upsert(from, src_ip, Utc::now()).await;
        let response = Response {
            status: Status::Ok,
            responder: self.local_id,
        };
        let _guard = self.send_lock.lock().await;
        if let Err(e) = self
            .socket
            .send_to(&response.encode(), (src_ip, PORT))
            .await
        {
            warn!("echo reply to {} failed: {}", src_ip, e);
        }
    }

    /// Called by Messaging's UDP receiver for an unmatched `OK` Response
    /// (no ACK waiter claims it): associates the responder with the
    /// packet's source IP.
    pub async fn handle_unmatched_response(&self, responder: UserId, src_ip: Ipv4Addr) {
        if responder == self.local_id {
            // Own broadcast echoed back; never insert self (invariant 10).
            return;
        }
        if self.peers.get(&responder).await.is_none() {
            info!("discovered new peer {} at {}", responder, src_ip);
        }
        self.peers.upsert(responder, src_ip, Utc::now()).await;
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn peers_handle(&self) -> Arc<PeerTable> {
        self.peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_broadcast_sets_last_octet_to_255() {
        let ip: Ipv4Addr = "192.168.1.42".parse().unwrap();
        assert_eq!(subnet_directed_broadcast(ip), "192.168.1.255".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn handle_unmatched_response_never_inserts_self() {
        let local_id = UserId::normalize("alice");
        let peers = PeerTable::new(local_id, vec![Ipv4Addr::LOCALHOST]);
        let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        let store: Arc<dyn PeerStore> = Arc::new(NoopPeerStore);
        let disc = Discovery::new(
            local_id,
            Ipv4Addr::LOCALHOST,
            DEFAULT_BROADCAST_INTERVAL,
            socket,
            peers,
            store,
        );
        disc.handle_unmatched_response(local_id, "127.0.0.1".parse().unwrap())
            .await;
        assert!(disc.get_peers().await.is_empty());
    }

    struct NoopPeerStore;
    impl PeerStore for NoopPeerStore {
        fn load(&self) -> Result<std::collections::HashMap<UserId, crate::peer::Peer>, crate::error::PersistError> {
            Ok(std::collections::HashMap::new())
        }
        fn save(&self, _snapshot: &std::collections::HashMap<UserId, crate::peer::Peer>) -> Result<(), crate::error::PersistError> {
            Ok(())
        }
    }
}
