use std::{fmt, io};

use thiserror::Error;

use crate::protocol::{Message, MessageType};

/// Why a connection was closed.
///
/// The first reason recorded wins: a connection dying of a transport error
/// while the application is closing it still reports [`CloseReason::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// A transport or framing error.
    Error,
    /// The peer hung up.
    Eof,
    /// The peer stopped answering keepalive pings.
    Keepalive,
    /// The application asked for it.
    Client,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            CloseReason::Error => "error",
            CloseReason::Eof => "end of file",
            CloseReason::Keepalive => "keepalive timeout",
            CloseReason::Client => "closed by client",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed or unexpected frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The length word is smaller than a header or larger than the limit.
    #[error("frame length {0} out of range")]
    BadLength(u32),
    /// An outgoing message does not fit in a frame.
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("unknown message status {0}")]
    UnknownStatus(u32),
    /// More descriptors than a frame may carry.
    #[error("{count} file descriptors exceed the limit of {max}")]
    TooManyFds { count: usize, max: usize },
    /// Descriptors attached to a kind that cannot carry them.
    #[error("{0} messages cannot carry file descriptors")]
    FdsNotAllowed(MessageType),
    /// The transport cannot pass descriptors.
    #[error("transport does not support passing file descriptors")]
    FdPassingUnsupported,
    /// The frame ended before the decoder was done with it.
    #[error("truncated frame")]
    Truncated,
}

/// An `ERROR` status returned by the server.
///
/// The payload is the program-specific encoding of the error and is left
/// for the caller to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("remote error from program {program:#x} version {version} procedure {procedure} (serial {serial})")]
pub struct RemoteError {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub serial: u32,
    pub payload: Vec<u8>,
}

impl From<Message> for RemoteError {
    fn from(msg: Message) -> Self {
        let Message { header, payload, .. } = msg;
        Self {
            program: header.program,
            version: header.version,
            procedure: header.procedure,
            serial: header.serial,
            payload,
        }
    }
}

/// Errors surfaced to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection is closed, or was closed while the call was pending.
    #[error("connection closed: {0}")]
    Closed(CloseReason),
    /// The server answered with an `ERROR` status.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A frame could not be encoded or was rejected by the decoder.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The call is not valid as submitted.
    #[error("invalid call: {0}")]
    InvalidCall(&'static str),
    /// Connecting or configuring the transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the close reason if this error means the connection is gone.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Error::Closed(reason) => Some(*reason),
            _ => None,
        }
    }
}
