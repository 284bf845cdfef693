pub(crate) mod core;
pub(crate) mod keepalive;

use std::{
    fmt,
    os::fd::{AsRawFd, OwnedFd},
};

pub use self::core::*;

/// Size of the big-endian length word that prefixes every frame.
pub const LEN_SIZE: usize = 4;

/// Size of the fixed header following the length word.
pub const HEADER_SIZE: usize = 24;

/// Size of the fd count word of the `*WithFds` kinds.
pub const NFDS_SIZE: usize = 4;

/// Largest payload accepted by default.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest frame accepted by default, length word included.
pub const MAX_FRAME: usize = MAX_PAYLOAD + LEN_SIZE;

/// Largest number of descriptors a single frame may carry by default.
pub const MAX_FDS: usize = 32;

/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  total length (incl. itself)                  |
/// +---------------------------------------------------------------+
/// |                            program                            |
/// +---------------------------------------------------------------+
/// |                            version                            |
/// +---------------------------------------------------------------+
/// |                           procedure                           |
/// +---------------------------------------------------------------+
/// |                             serial                            |
/// +---------------------------------------------------------------+
/// |                              type                             |
/// +---------------------------------------------------------------+
/// |                             status                            |
/// +---------------------------------------------------------------+
/// |               fd count (only for *_WITH_FDS types)            |
/// +---------------------------------------------------------------+
/// ~                            payload                            ~
/// +---------------------------------------------------------------+
/// ```
///
/// All words are unsigned 32-bit big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub serial: u32,
    pub kind: MessageType,
    pub status: Status,
}

impl Header {
    /// Header of a plain call with status `Ok`.
    pub const fn call(program: u32, version: u32, procedure: u32, serial: u32) -> Self {
        Self {
            program,
            version,
            procedure,
            serial,
            kind: MessageType::Call,
            status: Status::Ok,
        }
    }

    /// Header of a stream frame.
    pub const fn stream(program: u32, version: u32, procedure: u32, serial: u32, status: Status) -> Self {
        Self {
            program,
            version,
            procedure,
            serial,
            kind: MessageType::Stream,
            status,
        }
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// The triple replies and stream frames are matched on.
    pub const fn key(&self) -> CallKey {
        CallKey {
            program: self.program,
            version: self.version,
            serial: self.serial,
        }
    }

    #[cfg(test)]
    pub(crate) fn rand() -> Self {
        use rand::{Rng, seq::IndexedRandom};

        let mut rng = rand::rng();
        Self {
            program: rng.random(),
            version: rng.random(),
            procedure: rng.random(),
            serial: rng.random(),
            kind: *MessageType::ALL.choose(&mut rng).unwrap_or(&MessageType::Call),
            status: *[Status::Ok, Status::Error, Status::Continue]
                .choose(&mut rng)
                .unwrap_or(&Status::Ok),
        }
    }
}

/// Identity of an in-flight call or stream on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub program: u32,
    pub version: u32,
    pub serial: u32,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}/{}", self.program, self.version, self.serial)
    }
}

/// One logical protocol message.
///
/// Descriptors are owned by the message: they are closed when the message
/// is dropped, once sent, or handed to the receiver of a reply.
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn new(header: Header, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            payload: payload.into(),
            fds: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fds = fds;
        self
    }

    /// Takes the descriptors out of the message.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    #[cfg(test)]
    pub(crate) fn rand() -> Self {
        use rand::Rng;

        let mut rng = rand::rng();
        let len = rng.random_range(0..=256);
        let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let header = Header::rand();
        // Descriptor kinds are reserved to the codec.
        let kind = match header.kind {
            MessageType::CallWithFds => MessageType::Call,
            MessageType::ReplyWithFds => MessageType::Reply,
            k => k,
        };
        Self::new(header.with_kind(kind), payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fds: Vec<i32> = self.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload", &self.payload.len())
            .field("fds", &fds)
            .finish()
    }
}
