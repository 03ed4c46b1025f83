//! Persistence ports consumed by the core (spec.md §4.2).
//!
//! The core only depends on these traits; `json` ships a default
//! file-backed implementation so the crate is runnable standalone, but a
//! caller is free to swap in anything else (a database, an in-memory
//! store for tests, ...).

pub mod json;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::PersistError;
use crate::identity::UserId;
use crate::peer::Peer;

/// One entry in the append-only conversation history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum HistoryEntry {
    Message {
        from: UserId_,
        /// `None` encodes the `"*global*"` broadcast recipient of spec.md §3.
        to: Option<UserId_>,
        text: String,
        ts: DateTime<Utc>,
    },
    File {
        from: UserId_,
        to: UserId_,
        filename: String,
        size: u64,
        path: PathBuf,
        ts: DateTime<Utc>,
    },
}

/// `UserId` is not itself serde-friendly (it deliberately exposes only a
/// byte view), so persistence stores the UTF-8 display form, matching
/// spec.md §6 ("UserIds are stored as the UTF-8 decoding of their
/// non-null prefix") and reconstitutes it via `UserId::normalize` on load.
pub type UserId_ = String;

pub(crate) fn store_id(id: UserId) -> UserId_ {
    id.display_name()
}

pub(crate) fn load_id(s: &str) -> UserId {
    UserId::normalize(s)
}

/// `PeerStore.load()` / `.save()` (spec.md §4.2).
pub trait PeerStore: Send + Sync {
    fn load(&self) -> Result<HashMap<UserId, Peer>, PersistError>;
    fn save(&self, snapshot: &HashMap<UserId, Peer>) -> Result<(), PersistError>;
}

/// `HistoryStore.appendMessage` / `.appendFile` / `.getConversation` (spec.md §4.2).
pub trait HistoryStore: Send + Sync {
    fn append_message(
        &self,
        from: UserId,
        to: Option<UserId>,
        text: String,
        ts: DateTime<Utc>,
    ) -> Result<(), PersistError>;

    fn append_file(
        &self,
        from: UserId,
        to: UserId,
        filename: String,
        size: u64,
        path: PathBuf,
        ts: DateTime<Utc>,
    ) -> Result<(), PersistError>;

    /// Ordered entries between `a` and `b` (or global broadcasts touching
    /// either), oldest first.
    fn get_conversation(&self, a: UserId, b: UserId) -> Result<Vec<HistoryEntry>, PersistError>;
}
