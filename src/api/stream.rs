use tracing::{debug, trace};

use super::client::Client;
use crate::{
    error::{Error, RemoteError},
    protocol::{CallKey, Header, Message, Status},
};

/// Result of [`Stream::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// One packet of data, in arrival order.
    Data(Vec<u8>),
    /// The server finished the stream and every packet was read.
    Eof,
    /// Nothing buffered yet. Only returned by non-blocking reads.
    Empty,
}

/// A bidirectional data stream sharing the connection with ordinary calls.
///
/// Incoming packets are buffered as they arrive, whichever thread reads
/// them off the socket. Dropping the stream unregisters it: later packets
/// for it are discarded.
pub struct Stream {
    client: Client,
    key: CallKey,
    procedure: u32,
}

impl Stream {
    pub(crate) fn new(client: Client, key: CallKey, procedure: u32) -> Self {
        Self { client, key, procedure }
    }

    pub fn key(&self) -> CallKey {
        self.key
    }

    /// Header of the call opening the stream on the server.
    pub fn header(&self) -> Header {
        Header::call(self.key.program, self.key.version, self.procedure, self.key.serial)
    }

    fn frame(&self, status: Status, payload: Vec<u8>) -> Message {
        let header = Header::stream(
            self.key.program,
            self.key.version,
            self.procedure,
            self.key.serial,
            status,
        );
        Message::new(header, payload)
    }

    /// Sends one packet of data, blocking until it is on the wire.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        let msg = self.frame(Status::Continue, data.into());
        self.client.send_no_reply(msg)
    }

    /// Reads the next packet.
    ///
    /// A blocking read waits until a packet, the end of the stream or an
    /// error arrives. A non-blocking read drives the socket once if nobody
    /// else is doing it, then returns [`StreamRead::Empty`] if still nothing
    /// is buffered.
    pub fn recv(&self, nonblock: bool) -> Result<StreamRead, Error> {
        let shared = &self.client.shared;
        let mut state = shared.lock();
        let mut pumped = false;
        loop {
            let stream = state
                .streams
                .get_mut(&self.key)
                .ok_or(Error::InvalidCall("stream is not registered"))?;
            if let Some(data) = stream.pop() {
                trace!(key = %self.key, bytes = data.len(), "stream data read");
                return Ok(StreamRead::Data(data));
            }
            if let Some(err) = stream.error() {
                return Err(err.clone().into());
            }
            if stream.is_eof() {
                return Ok(StreamRead::Eof);
            }

            if nonblock {
                if pumped {
                    return Ok(StreamRead::Empty);
                }
                shared.pump(&mut state)?;
                pumped = true;
                continue;
            }
            // Completes as soon as anything arrives for this stream.
            shared.call_blocking(&mut state, self.frame(Status::Continue, Vec::new()), true)?;
        }
    }

    /// Tells the server no more data is coming and waits for its final
    /// status. Does nothing if the server already ended the stream.
    pub fn finish(&self) -> Result<(), Error> {
        let shared = &self.client.shared;
        let mut state = shared.lock();
        if let Some(stream) = state.streams.get(&self.key) {
            if let Some(err) = stream.error() {
                return Err(err.clone().into());
            }
            if stream.is_finished() {
                debug!(key = %self.key, "stream already finished by server");
                return Ok(());
            }
        }

        let reply = shared.call_blocking(&mut state, self.frame(Status::Ok, Vec::new()), true)?;
        if reply.header.status == Status::Error {
            return Err(RemoteError::from(reply).into());
        }
        Ok(())
    }

    /// Aborts the stream and waits for the server to acknowledge it.
    pub fn abort(&self) -> Result<(), Error> {
        let shared = &self.client.shared;
        let mut state = shared.lock();
        if state.streams.get(&self.key).is_some_and(|s| s.is_finished()) {
            return Ok(());
        }
        shared.call_blocking(&mut state, self.frame(Status::Error, Vec::new()), true)?;
        debug!(key = %self.key, "stream aborted");
        Ok(())
    }

    /// Returns `true` once the server finished the stream and every packet
    /// was read.
    pub fn is_eof(&self) -> bool {
        self.client
            .shared
            .lock()
            .streams
            .get(&self.key)
            .is_some_and(|s| s.is_eof())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.client.shared.lock().streams.remove(&self.key);
        trace!(key = %self.key, "stream closed");
    }
}
