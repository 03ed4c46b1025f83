//! LCP wire codec: fixed-width, little-endian, no implicit padding.
//!
//! # Frame sizes
//!
//! | Frame   | Bytes | Layout                                              |
//! |---------|-------|------------------------------------------------------|
//! | Header  | 50    | `from[20] ‖ to[20] ‖ op[1] ‖ bid[1] ‖ len[8 LE]`       |
//! | Response| 25    | `status[1] ‖ responder[20] ‖ reserved[4]`             |
//! | Body    | 1+N   | `bid[1] ‖ payload[N]`                                 |
//!
//! Open Question 1 (spec.md §9): the LCP v1.0 document reserves a second
//! 50-byte tail for a 100-byte header. This crate implements the 50-byte
//! frame with no reserved tail; `HEADER_LEN` is the single constant a
//! future revision would need to change.

use crate::error::WireError;
use crate::identity::{UserId, USER_ID_LEN};

/// Length of a Header frame on the wire.
pub const HEADER_LEN: usize = 2 * USER_ID_LEN + 1 + 1 + 8;
/// Length of a Response frame on the wire.
pub const RESPONSE_LEN: usize = 1 + USER_ID_LEN + 4;

const _: () = assert!(HEADER_LEN == 50);
const _: () = assert!(RESPONSE_LEN == 25);

/// Operation carried by a Header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Echo = 0,
    Message = 1,
    File = 2,
}

impl OpCode {
    pub fn from_u8(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(OpCode::Echo),
            1 => Ok(OpCode::Message),
            2 => Ok(OpCode::File),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Status byte carried by a Response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    BadRequest = 1,
    InternalError = 2,
}

impl Status {
    pub fn from_u8(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(Status::Ok),
            1 => Ok(Status::BadRequest),
            2 => Ok(Status::InternalError),
            other => Err(WireError::UnknownStatus(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A 50-byte Header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub from: UserId,
    pub to: UserId,
    pub op: OpCode,
    pub bid: u8,
    pub body_len: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..USER_ID_LEN].copy_from_slice(self.from.as_bytes());
        buf[USER_ID_LEN..2 * USER_ID_LEN].copy_from_slice(self.to.as_bytes());
        buf[2 * USER_ID_LEN] = self.op.as_u8();
        buf[2 * USER_ID_LEN + 1] = self.bid;
        buf[2 * USER_ID_LEN + 2..].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != HEADER_LEN {
            return Err(WireError::TooShort {
                frame: "header",
                got: buf.len(),
                want: HEADER_LEN,
            });
        }
        let mut from = [0u8; USER_ID_LEN];
        from.copy_from_slice(&buf[0..USER_ID_LEN]);
        let mut to = [0u8; USER_ID_LEN];
        to.copy_from_slice(&buf[USER_ID_LEN..2 * USER_ID_LEN]);
        let op = OpCode::from_u8(buf[2 * USER_ID_LEN])?;
        let bid = buf[2 * USER_ID_LEN + 1];
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[2 * USER_ID_LEN + 2..]);
        let body_len = u64::from_le_bytes(len_bytes);
        Ok(Header {
            from: UserId::from_raw(from),
            to: UserId::from_raw(to),
            op,
            bid,
            body_len,
        })
    }
}

/// A 25-byte Response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub responder: UserId,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0] = self.status.as_u8();
        buf[1..1 + USER_ID_LEN].copy_from_slice(self.responder.as_bytes());
        // remaining 4 bytes are reserved, left as zero
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != RESPONSE_LEN {
            return Err(WireError::TooShort {
                frame: "response",
                got: buf.len(),
                want: RESPONSE_LEN,
            });
        }
        let status = Status::from_u8(buf[0])?;
        let mut responder = [0u8; USER_ID_LEN];
        responder.copy_from_slice(&buf[1..1 + USER_ID_LEN]);
        Ok(Response {
            status,
            responder: UserId::from_raw(responder),
        })
    }
}

/// The on-wire body of a Message operation: `bid ‖ payload`. The leading
/// `bid` must match the `bid` of the Header it correlates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub bid: u8,
    pub payload: Vec<u8>,
}

impl MessageBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.bid);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::TooShort {
                frame: "body",
                got: 0,
                want: 1,
            });
        }
        Ok(MessageBody {
            bid: buf[0],
            payload: buf[1..].to_vec(),
        })
    }
}

/// Classifies a raw UDP datagram by length, per spec.md §3: 25 bytes is a
/// Response, 50 bytes is a Header, anything else is dropped by the
/// receiver (not an error at this layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Response,
    Header,
    Unknown,
}

pub fn classify(len: usize) -> Frame {
    match len {
        RESPONSE_LEN => Frame::Response,
        HEADER_LEN => Frame::Header,
        _ => Frame::Unknown,
    }
}
