//! Peer records and the shared, lock-guarded peer table.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::identity::UserId;

/// A peer is reachable (online) if it has been heard from within this
/// many seconds.
pub const ONLINE_WINDOW_SECS: i64 = 20;

/// A record of one reachable (or recently-reachable) node on the LAN.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub last_seen: DateTime<Utc>,
    pub tcp_ok: bool,
    /// Diagnostics only — does not participate in any invariant.
    pub first_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            last_seen: now,
            tcp_ok: false,
            first_seen: now,
        }
    }

    /// `now - last_seen <= 20s`.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).num_seconds() <= ONLINE_WINDOW_SECS
    }
}

/// In-memory `UserId -> Peer` mapping, guarded by an async lock.
///
/// Invariants (spec.md §3): the local id never appears; entries whose
/// `ip` matches a local interface address are filtered on load; `last_seen`
/// is monotonic non-decreasing per entry.
pub struct PeerTable {
    local_id: UserId,
    local_ips: Vec<Ipv4Addr>,
    inner: RwLock<HashMap<UserId, Peer>>,
}

impl PeerTable {
    pub fn new(local_id: UserId, local_ips: Vec<Ipv4Addr>) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            local_ips,
            inner: RwLock::new(HashMap::new()),
        })
    }

    /// Seeds the table from a loaded snapshot, dropping any entry that is
    /// the local id or shares a local interface IP.
    pub async fn load(&self, snapshot: HashMap<UserId, Peer>) {
        let mut guard = self.inner.write().await;
        for (id, peer) in snapshot {
            if self.is_self(&id, &peer) {
                continue;
            }
            guard.insert(id, peer);
        }
    }

    fn is_self(&self, id: &UserId, peer: &Peer) -> bool {
        *id == self.local_id || self.local_ips.contains(&peer.ip)
    }

    /// Inserts or refreshes a peer's `last_seen`. Never updates the local
    /// id or a local-interface IP, and never lets `last_seen` move
    /// backwards.
    pub async fn upsert(&self, id: UserId, ip: Ipv4Addr, now: DateTime<Utc>) {
        if id == self.local_id || self.local_ips.contains(&ip) {
            return;
        }
        let mut guard = self.inner.write().await;
        match guard.get_mut(&id) {
            Some(existing) => {
                existing.ip = ip;
                if now > existing.last_seen {
                    existing.last_seen = now;
                }
            }
            None => {
                guard.insert(id, Peer::new(ip, now));
            }
        }
    }

    pub async fn set_tcp_ok(&self, id: &UserId, ok: bool) {
        let mut guard = self.inner.write().await;
        if let Some(peer) = guard.get_mut(id) {
            peer.tcp_ok = ok;
        }
    }

    pub async fn get(&self, id: &UserId) -> Option<Peer> {
        self.inner.read().await.get(id).cloned()
    }

    /// Returns a consistent snapshot, already filtered of self/local-IP
    /// duplicates (the invariant also enforced at write time, kept here
    /// as defense against a future caller forgetting to).
    pub async fn snapshot(&self) -> HashMap<UserId, Peer> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(id, peer)| !self.is_self(id, peer))
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn local_ips(&self) -> &[Ipv4Addr] {
        &self.local_ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<PeerTable> {
        PeerTable::new(
            UserId::normalize("alice"),
            vec!["192.168.1.10".parse().unwrap()],
        )
    }

    #[tokio::test]
    async fn self_id_never_enters_table() {
        let t = table();
        t.upsert(UserId::normalize("alice"), "10.0.0.5".parse().unwrap(), Utc::now())
            .await;
        assert!(t.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn local_ip_duplicates_are_filtered() {
        let t = table();
        t.upsert(
            UserId::normalize("shadow"),
            "192.168.1.10".parse().unwrap(),
            Utc::now(),
        )
        .await;
        assert!(t.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_refreshes_last_seen_monotonically() {
        let t = table();
        let t0 = Utc::now();
        t.upsert(UserId::normalize("bob"), "10.0.0.2".parse().unwrap(), t0)
            .await;
        let earlier = t0 - chrono::Duration::seconds(30);
        t.upsert(UserId::normalize("bob"), "10.0.0.2".parse().unwrap(), earlier)
            .await;
        let peer = t.get(&UserId::normalize("bob")).await.unwrap();
        assert_eq!(peer.last_seen, t0);
    }

    #[tokio::test]
    async fn online_window_is_twenty_seconds() {
        let now = Utc::now();
        let mut peer = Peer::new("10.0.0.2".parse().unwrap(), now - chrono::Duration::seconds(19));
        assert!(peer.is_online(now));
        peer.last_seen = now - chrono::Duration::seconds(21);
        assert!(!peer.is_online(now));
    }
}
