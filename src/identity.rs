//! The 20-byte `UserId` and its normalization rules.

use std::fmt;

/// Fixed-width node identity. Always exactly 20 bytes on the wire and
/// across the API; equality is byte-equality on this form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId([u8; 20]);

/// Length in bytes of every `UserId`, on the wire and in memory.
pub const USER_ID_LEN: usize = 20;

/// Sentinel id used for broadcast-addressed headers: 20 bytes of `0xFF`.
pub const BROADCAST: UserId = UserId([0xFF; USER_ID_LEN]);

impl UserId {
    /// Normalizes an arbitrary textual id: right-pad with `0x00` if short,
    /// truncate if long. This is the only sanctioned way to build a
    /// `UserId` from user input.
    pub fn normalize(raw: &str) -> Self {
        let bytes = raw.as_bytes();
        let mut buf = [0u8; USER_ID_LEN];
        let n = bytes.len().min(USER_ID_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    /// Builds a `UserId` from an already 20-byte array, e.g. as read off
    /// the wire. No further normalization is applied.
    pub fn from_raw(bytes: [u8; USER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; USER_ID_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST
    }

    /// Strips the trailing `0x00` padding and decodes the remaining
    /// prefix as UTF-8 (lossily, matching spec.md §6's "UTF-8 decoding of
    /// the non-null prefix").
    pub fn display_name(&self) -> String {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != 0x00)
            .map(|i| i + 1)
            .unwrap_or(0);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({:?})", self.display_name())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::normalize(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::normalize(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pads_short_ids() {
        let id = UserId::normalize("bob");
        assert_eq!(id.as_bytes().len(), USER_ID_LEN);
        assert_eq!(&id.as_bytes()[..3], b"bob");
        assert!(id.as_bytes()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn normalize_truncates_long_ids() {
        let long = "a".repeat(40);
        let id = UserId::normalize(&long);
        assert_eq!(id.as_bytes().len(), USER_ID_LEN);
        assert!(id.as_bytes().iter().all(|&b| b == b'a'));
    }

    #[test]
    fn display_name_strips_padding() {
        let id = UserId::normalize("alice");
        assert_eq!(id.display_name(), "alice");
    }

    #[test]
    fn broadcast_is_all_ff() {
        assert_eq!(BROADCAST.as_bytes(), &[0xFFu8; 20]);
        assert!(BROADCAST.is_broadcast());
    }

    #[test]
    fn equality_is_byte_equality() {
        assert_eq!(UserId::normalize("bob"), UserId::normalize("bob"));
        assert_ne!(UserId::normalize("bob"), UserId::normalize("bobby"));
    }
}
