//! Error taxonomy for the LCP engine.
//!
//! Each subsystem gets its own `thiserror` enum rather than one crate-wide
//! type, following the per-module convention the rest of this codebase
//! inherited from its teacher.

use std::net::SocketAddr;
use thiserror::Error;

use crate::identity::UserId;

/// Errors from packing/unpacking the fixed-width LCP wire frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short for {frame}: got {got} bytes, need {want}")]
    TooShort {
        frame: &'static str,
        got: usize,
        want: usize,
    },
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("unknown status byte {0}")]
    UnknownStatus(u8),
    #[error("body length mismatch: header declared {declared}, body carried {actual}")]
    BodyLenMismatch { declared: u64, actual: u64 },
}

/// Errors surfaced to callers of `Messaging::send` / `send_file`.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("recipient {0} is not in the peer table")]
    UnknownPeer(UserId),

    #[error("no reply from {peer} for body {bid} after {attempts} attempts")]
    Timeout {
        peer: SocketAddr,
        bid: u8,
        attempts: u32,
    },

    #[error("delivery to {peer} failed after exhausting retries")]
    DeliveryFailed { peer: SocketAddr },

    #[error("file transfer to {peer} failed after the UDP handshake: {reason}")]
    TransferFailed { peer: SocketAddr, reason: String },

    #[error("peer rejected the request (status={0:?})")]
    BadRequest(crate::wire::Status),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the persistence ports (peer snapshot + history log).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
