use std::{io, os::fd::OwnedFd};

use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    buffers::reader::HasReader,
    codec::{
        Limits, RCodec, RpcCodec,
        frame::{FrameBody, body_len},
    },
    error::ProtocolError,
    protocol::{LEN_SIZE, Message},
    transport::{Transport, read_nonblocking},
};

/// Failures that leave the incoming byte stream unusable.
#[derive(Debug, Error)]
pub(crate) enum InputError {
    #[error("end of file while reading a frame")]
    Eof,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum Phase {
    /// Reading the length word.
    Length,
    /// Reading the rest of the frame.
    Body,
    /// Bytes are in, descriptors are still arriving.
    Fds { body: FrameBody, fds: Vec<OwnedFd> },
}

/// Resumable decoder for the incoming side of a connection.
///
/// Every read may stop short when the socket runs dry. The decoder keeps its
/// position across calls so that the next owner of the socket picks up
/// exactly where the previous one left.
pub(crate) struct Input {
    buffer: Vec<u8>,
    offset: usize,
    phase: Phase,
    limits: Limits,
}

impl Input {
    pub(crate) fn new(limits: Limits) -> Self {
        Self {
            buffer: vec![0; LEN_SIZE],
            offset: 0,
            phase: Phase::Length,
            limits,
        }
    }

    /// Returns `true` if a frame is partially received.
    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> bool {
        self.offset != 0 || !matches!(self.phase, Phase::Length)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.buffer.resize(LEN_SIZE, 0);
        self.offset = 0;
        self.phase = Phase::Length;
    }

    /// Fills the buffer. Returns `false` if the socket ran dry first.
    fn fill<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<bool, InputError> {
        while self.offset < self.buffer.len() {
            match read_nonblocking(transport, &mut self.buffer[self.offset..])? {
                Some(0) => return Err(InputError::Eof),
                Some(n) => self.offset += n,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Advances the decoder as far as the socket allows.
    ///
    /// Returns `Ok(None)` when the socket would block before a full message
    /// is available. Frames with an unknown type or status are dropped
    /// without tearing the stream down, since their length is still valid.
    pub(crate) fn advance<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Option<Message>, InputError> {
        loop {
            match &mut self.phase {
                Phase::Length => {
                    if !self.fill(transport)? {
                        return Ok(None);
                    }
                    let mut prefix = [0u8; LEN_SIZE];
                    prefix.copy_from_slice(&self.buffer);
                    let len = body_len(prefix, &self.limits)?;
                    self.buffer.clear();
                    self.buffer.resize(len, 0);
                    self.offset = 0;
                    self.phase = Phase::Body;
                }
                Phase::Body => {
                    if !self.fill(transport)? {
                        return Ok(None);
                    }
                    let mut reader = self.buffer.as_slice().reader();
                    let res: Result<FrameBody, ProtocolError> = RpcCodec::new().read(&mut reader);
                    let body = match res {
                        Ok(body) => body,
                        Err(e @ (ProtocolError::UnknownType(_) | ProtocolError::UnknownStatus(_))) => {
                            warn!(error = %e, bytes = self.buffer.len(), "dropping frame");
                            self.reset();
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if body.nfds > self.limits.max_fds {
                        return Err(ProtocolError::TooManyFds {
                            count: body.nfds,
                            max: self.limits.max_fds,
                        }
                        .into());
                    }
                    if body.nfds > 0 && !transport.has_pass_fd() {
                        return Err(ProtocolError::FdPassingUnsupported.into());
                    }
                    let nfds = body.nfds;
                    self.phase = Phase::Fds {
                        body,
                        fds: Vec::with_capacity(nfds),
                    };
                }
                Phase::Fds { body, fds } => {
                    while fds.len() < body.nfds {
                        match transport.recv_fd() {
                            Ok(fd) => fds.push(fd),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let header = body.header;
                    let payload = std::mem::take(&mut body.payload);
                    let fds = std::mem::take(fds);
                    self.reset();
                    trace!(?header, bytes = payload.len(), fds = fds.len(), "frame received");
                    return Ok(Some(Message::new(header, payload).with_fds(fds)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::{fd::AsFd, unix::net::UnixStream},
    };

    use super::*;
    use crate::protocol::{Header, MessageType, Status};

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn input_partial() {
        let (mut peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());

        let header = Header::call(1, 2, 3, 4).with_kind(MessageType::Reply);
        let frame = Message::new(header, vec![5; 10]).encode().unwrap();

        // 1. Nothing to read
        assert!(input.advance(&mut sock).unwrap().is_none());
        assert!(!input.in_progress());

        // 2. Byte by byte
        for b in &frame[..frame.len() - 1] {
            peer.write_all(std::slice::from_ref(b)).unwrap();
            assert!(input.advance(&mut sock).unwrap().is_none());
            assert!(input.in_progress());
        }
        peer.write_all(&frame[frame.len() - 1..]).unwrap();
        let msg = input.advance(&mut sock).unwrap().unwrap();
        assert_eq!(msg.header, header);
        assert_eq!(msg.payload, vec![5; 10]);
        assert!(!input.in_progress());
    }

    #[test]
    fn input_back_to_back() {
        let (mut peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());

        for serial in 0..3 {
            let header = Header::call(1, 1, 1, serial).with_kind(MessageType::Reply);
            peer.write_all(&Message::new(header, vec![]).encode().unwrap()).unwrap();
        }

        for serial in 0..3 {
            let msg = input.advance(&mut sock).unwrap().unwrap();
            assert_eq!(msg.header.serial, serial);
        }
        assert!(input.advance(&mut sock).unwrap().is_none());
    }

    #[test]
    fn input_errors() {
        // 1. Length out of range
        let (mut peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());
        peer.write_all(&8u32.to_be_bytes()).unwrap();
        assert!(matches!(
            input.advance(&mut sock),
            Err(InputError::Protocol(ProtocolError::BadLength(8)))
        ));

        // 2. End of file
        let (peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());
        drop(peer);
        assert!(matches!(input.advance(&mut sock), Err(InputError::Eof)));
    }

    #[test]
    fn input_unknown_type_skipped() {
        let (mut peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());

        let mut bad = Message::new(Header::call(1, 1, 1, 1), vec![1, 2]).encode().unwrap();
        bad[20..24].copy_from_slice(&77u32.to_be_bytes());
        peer.write_all(&bad).unwrap();
        let good = Header::call(1, 1, 1, 2).with_kind(MessageType::Message);
        peer.write_all(&Message::new(good, vec![]).encode().unwrap()).unwrap();

        let msg = input.advance(&mut sock).unwrap().unwrap();
        assert_eq!(msg.header, good);
    }

    #[test]
    fn input_with_fds() {
        let (mut peer, mut sock) = pair();
        let mut input = Input::new(Limits::default());

        let (passed, _kept) = UnixStream::pair().unwrap();
        let header = Header::call(1, 1, 1, 9).with_kind(MessageType::Reply).with_status(Status::Ok);
        let msg = Message::new(header, vec![1]).with_fds(vec![OwnedFd::from(passed.try_clone().unwrap())]);
        peer.write_all(&msg.encode().unwrap()).unwrap();

        // Bytes are in, the descriptor is not
        assert!(input.advance(&mut sock).unwrap().is_none());
        assert!(input.in_progress());

        Transport::send_fd(&mut peer, passed.as_fd()).unwrap();
        let msg = input.advance(&mut sock).unwrap().unwrap();
        assert_eq!(msg.header.kind, MessageType::ReplyWithFds);
        assert_eq!(msg.fds.len(), 1);
    }
}
