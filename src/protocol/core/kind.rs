use core::fmt;

use crate::error::ProtocolError;

/// The kind of a frame, carried in the `type` word of every header.
///
/// The `*WithFds` kinds are wire-only: they tell the peer that an fd count
/// precedes the payload and that descriptors follow the bytes. Callers build
/// plain [`Call`](`MessageType::Call`) or [`Reply`](`MessageType::Reply`)
/// messages and the codec upgrades them when descriptors are attached.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum MessageType {
    /// A request expecting (or not) a reply with the same serial.
    Call = 0,
    /// The answer to a previous call.
    Reply = 1,
    /// An unsolicited event pushed by the server.
    Message = 2,
    /// A chunk of data (or a control frame) belonging to a stream.
    Stream = 3,
    /// A reply followed by out-of-band file descriptors.
    ReplyWithFds = 4,
    /// A call followed by out-of-band file descriptors.
    CallWithFds = 5,
}

impl MessageType {
    pub(crate) const ALL: [MessageType; 6] = [
        MessageType::Call,
        MessageType::Reply,
        MessageType::Message,
        MessageType::Stream,
        MessageType::ReplyWithFds,
        MessageType::CallWithFds,
    ];

    /// Returns `true` if an fd count word precedes the payload.
    pub const fn carries_fds(self) -> bool {
        matches!(self, MessageType::ReplyWithFds | MessageType::CallWithFds)
    }

    /// Returns `true` for both reply kinds.
    pub const fn is_reply(self) -> bool {
        matches!(self, MessageType::Reply | MessageType::ReplyWithFds)
    }

    /// The kind to put on the wire for a message carrying `nfds` descriptors.
    pub(crate) fn with_fds(self, nfds: usize) -> Result<Self, ProtocolError> {
        match (self, nfds) {
            (kind, 0) => Ok(kind),
            (MessageType::Call | MessageType::CallWithFds, _) => Ok(MessageType::CallWithFds),
            (MessageType::Reply | MessageType::ReplyWithFds, _) => Ok(MessageType::ReplyWithFds),
            (kind, _) => Err(ProtocolError::FdsNotAllowed(kind)),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Call => "CALL",
            MessageType::Reply => "REPLY",
            MessageType::Message => "MESSAGE",
            MessageType::Stream => "STREAM",
            MessageType::ReplyWithFds => "REPLY_WITH_FDS",
            MessageType::CallWithFds => "CALL_WITH_FDS",
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        MessageType::ALL
            .into_iter()
            .find(|k| *k as u32 == value)
            .ok_or(ProtocolError::UnknownType(value))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
