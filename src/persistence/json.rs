//! Default JSON-file persistence: peer snapshot + append-only history log.
//!
//! `save` is crash-safe: write to a sibling temp file, then atomically
//! `rename` over the destination (spec.md §4.2). This generalizes the
//! teacher's `BanList::save`/`load` shape (`net/connection.rs`), which
//! writes its serialized file directly — this crate's spec requires
//! crash-safety, so the temp-file-then-rename step is added on top.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{load_id, store_id, HistoryEntry, HistoryStore, PeerStore};
use crate::error::PersistError;
use crate::identity::UserId;
use crate::peer::Peer;

fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), PersistError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    ip: std::net::Ipv4Addr,
    last_seen: DateTime<Utc>,
    tcp_ok: bool,
    first_seen: DateTime<Utc>,
}

impl From<&Peer> for PeerRecord {
    fn from(p: &Peer) -> Self {
        Self {
            ip: p.ip,
            last_seen: p.last_seen,
            tcp_ok: p.tcp_ok,
            first_seen: p.first_seen,
        }
    }
}

impl From<PeerRecord> for Peer {
    fn from(r: PeerRecord) -> Self {
        Peer {
            ip: r.ip,
            last_seen: r.last_seen,
            tcp_ok: r.tcp_ok,
            first_seen: r.first_seen,
        }
    }
}

/// File-backed `PeerStore`. One JSON object keyed by the peer's display
/// name (spec.md §6).
pub struct JsonPeerStore {
    path: PathBuf,
}

impl JsonPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PeerStore for JsonPeerStore {
    fn load(&self) -> Result<HashMap<UserId, Peer>, PersistError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(HashMap::new());
        }
        let raw: HashMap<String, PeerRecord> = serde_json::from_slice(&data)?;
        Ok(raw
            .into_iter()
            .map(|(id, rec)| (load_id(&id), Peer::from(rec)))
            .collect())
    }

    fn save(&self, snapshot: &HashMap<UserId, Peer>) -> Result<(), PersistError> {
        let raw: HashMap<String, PeerRecord> = snapshot
            .iter()
            .map(|(id, peer)| (store_id(*id), PeerRecord::from(peer)))
            .collect();
        let bytes = serde_json::to_vec_pretty(&raw)?;
        atomic_write(&self.path, &bytes)
    }
}

/// File-backed `HistoryStore`. The whole log is a single JSON array;
/// appends read-modify-atomically-rewrite, which is adequate at LAN-chat
/// scale (spec.md makes no durability-under-concurrent-writers demand
/// beyond crash-safety of a single writer).
pub struct JsonHistoryStore {
    path: PathBuf,
    // Serializes concurrent appends from the messaging work-queue
    // consumer and the file-transfer receiver.
    lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<HistoryEntry>, PersistError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_all(&self, entries: &[HistoryEntry]) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        atomic_write(&self.path, &bytes)
    }

    fn append(&self, entry: HistoryEntry) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = self.read_all()?;
        entries.push(entry);
        self.write_all(&entries)
    }
}

impl HistoryStore for JsonHistoryStore {
    fn append_message(
        &self,
        from: UserId,
        to: Option<UserId>,
        text: String,
        ts: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        self.append(HistoryEntry::Message {
            from: store_id(from),
            to: to.map(store_id),
            text,
            ts,
        })
    }

    fn append_file(
        &self,
        from: UserId,
        to: UserId,
        filename: String,
        size: u64,
        path: PathBuf,
        ts: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        self.append(HistoryEntry::File {
            from: store_id(from),
            to: store_id(to),
            filename,
            size,
            path,
            ts,
        })
    }

    fn get_conversation(&self, a: UserId, b: UserId) -> Result<Vec<HistoryEntry>, PersistError> {
        let a_name = store_id(a);
        let b_name = store_id(b);
        let all = self.read_all()?;
        Ok(all
            .into_iter()
            .filter(|entry| match entry {
                HistoryEntry::Message { from, to, .. } => {
                    let participants_match = (*from == a_name && to.as_deref() == Some(b_name.as_str()))
                        || (*from == b_name && to.as_deref() == Some(a_name.as_str()));
                    let is_global_touch = to.is_none() && (*from == a_name || *from == b_name);
                    participants_match || is_global_touch
                }
                HistoryEntry::File { from, to, .. } => {
                    (*from == a_name && *to == b_name) || (*from == b_name && *to == a_name)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserId;

    #[test]
    fn peer_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPeerStore::new(dir.path().join("peers.json"));
        let mut snapshot = HashMap::new();
        snapshot.insert(
            UserId::normalize("bob"),
            Peer::new("192.168.1.20".parse().unwrap(), Utc::now()),
        );
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&UserId::normalize("bob")));
    }

    #[test]
    fn peer_store_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPeerStore::new(dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn history_appends_and_queries_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("history.json"));
        let alice = UserId::normalize("alice");
        let bob = UserId::normalize("bob");
        store
            .append_message(alice, Some(bob), "hola".into(), Utc::now())
            .unwrap();
        store
            .append_message(bob, Some(alice), "hey".into(), Utc::now())
            .unwrap();
        let carol = UserId::normalize("carol");
        store
            .append_message(carol, Some(bob), "unrelated".into(), Utc::now())
            .unwrap();

        let convo = store.get_conversation(alice, bob).unwrap();
        assert_eq!(convo.len(), 2);
    }

    #[test]
    fn history_save_is_atomic_write_then_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = JsonHistoryStore::new(&path);
        store
            .append_message(UserId::normalize("a"), None, "x".into(), Utc::now())
            .unwrap();
        // no leftover temp file after a successful append
        assert!(!path.with_extension("tmp").exists());
        assert!(path.exists());
    }
}
