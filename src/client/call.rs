use std::{io, os::fd::AsFd};

use tracing::trace;

use crate::{
    error::{Error, ProtocolError},
    protocol::{CallKey, Message, Status},
    sync::event::{self, Notifier, Waiter},
    transport::{Transport, write_nonblocking},
};

pub(crate) type CallId = u64;

/// Progress of a queued call.
///
/// ```text
///   Sending ──(bytes + fds out, expects reply)──► AwaitingReply ──► Complete
///      │                                                               ▲
///      └────────────(bytes + fds out, no reply)────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallMode {
    Sending,
    AwaitingReply,
    Complete,
}

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flushed {
    /// Bytes and descriptors are all out, carrying the frame size.
    Done(usize),
    /// The socket refused more data.
    Blocked,
}

pub(crate) struct Call {
    pub(crate) id: CallId,
    /// The outgoing message, replaced by the reply on completion.
    pub(crate) msg: Message,
    buffer: Vec<u8>,
    offset: usize,
    fds_sent: usize,
    pub(crate) mode: CallMode,
    pub(crate) expects_reply: bool,
    pub(crate) non_blocking: bool,
    /// A thread is parked on this call and must be woken on completion.
    pub(crate) has_thread: bool,
    done: Notifier,
}

impl Call {
    /// Validates and encodes `msg`.
    pub(crate) fn new(
        id: CallId,
        msg: Message,
        expects_reply: bool,
        non_blocking: bool,
        max_frame: usize,
    ) -> Result<(Self, Waiter), Error> {
        if expects_reply && non_blocking {
            return Err(Error::InvalidCall("a non-blocking call cannot expect a reply"));
        }
        if expects_reply && !msg.payload.is_empty() && msg.header.status == Status::Continue {
            return Err(Error::InvalidCall(
                "a call expecting a reply cannot carry data with a CONTINUE status",
            ));
        }

        let mut buffer = msg.encode()?;
        if buffer.len() > max_frame {
            return Err(ProtocolError::TooLarge(buffer.len()).into());
        }

        // An empty stream call has nothing to send, it only waits.
        let mode = if msg.payload.is_empty() && expects_reply && msg.header.status == Status::Continue {
            buffer.clear();
            CallMode::AwaitingReply
        } else {
            CallMode::Sending
        };

        let (done, waiter) = event::new();
        let call = Self {
            id,
            msg,
            buffer,
            offset: 0,
            fds_sent: 0,
            mode,
            expects_reply,
            non_blocking,
            has_thread: false,
            done,
        };
        Ok((call, waiter))
    }

    pub(crate) fn key(&self) -> CallKey {
        self.msg.header.key()
    }

    /// Pushes the remaining bytes, then the remaining descriptors.
    pub(crate) fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<Flushed> {
        while self.offset < self.buffer.len() {
            match write_nonblocking(transport, &self.buffer[self.offset..])? {
                Some(n) => self.offset += n,
                None => return Ok(Flushed::Blocked),
            }
        }

        while self.fds_sent < self.msg.fds.len() {
            match transport.send_fd(self.msg.fds[self.fds_sent].as_fd()) {
                Ok(()) => self.fds_sent += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flushed::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let bytes = self.buffer.len();
        trace!(id = self.id, key = %self.key(), bytes, "call sent");
        self.buffer = Vec::new();
        self.msg.fds.clear();
        self.mode = if self.expects_reply {
            CallMode::AwaitingReply
        } else {
            CallMode::Complete
        };
        Ok(Flushed::Done(bytes))
    }

    /// Installs the reply and marks the call complete.
    pub(crate) fn complete(&mut self, reply: Message) {
        self.msg = reply;
        self.mode = CallMode::Complete;
    }

    /// Wakes the thread waiting on this call.
    pub(crate) fn signal(&self) {
        if self.done.notify().is_err() {
            trace!(id = self.id, "call waiter already gone");
        }
    }

    pub(crate) fn into_message(self) -> Message {
        self.msg
    }
}

/// Calls in submission order.
#[derive(Default)]
pub(crate) struct CallQueue {
    calls: Vec<Call>,
}

impl CallQueue {
    pub(crate) fn push(&mut self, call: Call) {
        debug_assert!(self.calls.iter().all(|c| c.id != call.id));
        self.calls.push(call);
    }

    /// Removes and returns every call matching `pred`, keeping the order of
    /// both the removed and the remaining calls.
    pub(crate) fn remove_where<F>(&mut self, mut pred: F) -> Vec<Call>
    where
        F: FnMut(&Call) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.calls.len());
        for call in self.calls.drain(..) {
            if pred(&call) {
                removed.push(call);
            } else {
                kept.push(call);
            }
        }
        self.calls = kept;
        removed
    }

    pub(crate) fn remove(&mut self, id: CallId) -> Option<Call> {
        let idx = self.calls.iter().position(|c| c.id == id)?;
        Some(self.calls.remove(idx))
    }

    pub(crate) fn get(&self, id: CallId) -> Option<&Call> {
        self.calls.iter().find(|c| c.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: CallId) -> Option<&mut Call> {
        self.calls.iter_mut().find(|c| c.id == id)
    }

    /// First call in order matching `pred`.
    pub(crate) fn find_mut<F>(&mut self, pred: F) -> Option<&mut Call>
    where
        F: FnMut(&&mut Call) -> bool,
    {
        self.calls.iter_mut().find(pred)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Call> {
        self.calls.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Call> {
        self.calls.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}
