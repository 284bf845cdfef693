//! The keepalive program.
//!
//! Keepalive frames are plain one-way `MESSAGE` frames with an empty payload
//! and serial `0`. Either side may send `PING`, the other side answers with
//! `PONG`.
use super::{Header, Message, MessageType, Status};

/// "keep" in ASCII.
pub(crate) const PROGRAM: u32 = 0x6b65_6570;
pub(crate) const VERSION: u32 = 1;

pub(crate) const PROC_PING: u32 = 1;
pub(crate) const PROC_PONG: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keepalive {
    Ping,
    Pong,
}

const fn header(procedure: u32) -> Header {
    Header {
        program: PROGRAM,
        version: VERSION,
        procedure,
        serial: 0,
        kind: MessageType::Message,
        status: Status::Ok,
    }
}

pub(crate) fn ping() -> Message {
    Message::new(header(PROC_PING), Vec::new())
}

pub(crate) fn pong() -> Message {
    Message::new(header(PROC_PONG), Vec::new())
}

/// Classifies a received frame. Returns `None` for anything that is not a
/// well-formed keepalive frame.
pub(crate) fn classify(header: &Header) -> Option<Keepalive> {
    if header.program != PROGRAM || header.version != VERSION || header.kind != MessageType::Message {
        return None;
    }
    match header.procedure {
        PROC_PING => Some(Keepalive::Ping),
        PROC_PONG => Some(Keepalive::Pong),
        _ => None,
    }
}

/// Returns `true` for any frame of the keepalive program, even a malformed one.
pub(crate) fn is_keepalive(header: &Header) -> bool {
    header.program == PROGRAM
}
