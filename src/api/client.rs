//! The user-facing connection handle.
//!
//! A [`Client`] is one connection shared by any number of threads. Each
//! `send_*` call queues a message and drives the socket itself when nobody
//! else is doing it, so no background thread is needed. See
//! [`register_async_io`](`Client::register_async_io`) for the case where
//! unsolicited traffic must be serviced while no call is in flight.
#[cfg(feature = "stats")]
use std::sync::atomic::Ordering;
use std::{
    io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    sync::Arc,
    thread,
    time::Duration,
};

#[cfg(feature = "tls")]
use rustls::ClientConfig;
use tracing::debug;

use super::stream::Stream;
use crate::{
    client::{EventHandler, Outcome, Shared, StreamState},
    codec::Limits,
    error::{CloseReason, Error, RemoteError},
    protocol::{CallKey, MAX_FDS, MAX_FRAME, Message, Status},
    transport::{self, Address, Transport},
};

/// Result of [`Client::send_non_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The message is entirely on the wire.
    Sent,
    /// The message is queued and will be sent by whichever thread drives the
    /// socket next.
    Queued,
}

/// A connection multiplexing calls, events and streams from many threads.
///
/// # Cloning
///
/// `Client` is cheaply cloneable (uses [`Arc`] internally). All clones share
/// the same connection. The connection is closed when the last clone is
/// dropped, or earlier through [`close()`](`Client::close`).
///
/// # Examples
///
/// ```no_run
/// # use netrpc::{Address, Header, Message};
/// # fn example() -> Result<(), netrpc::Error> {
/// let client = netrpc::client(Address::Unix("/run/app.sock".into())).build()?;
///
/// let header = Header::call(0x2000_8086, 1, 1, client.next_serial());
/// let reply = client.send_with_reply(Message::new(header, vec![]))?;
/// println!("{} bytes", reply.payload.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<Shared>,
}

impl Client {
    /// Sends a call and blocks until its reply arrives.
    ///
    /// Replies with an `ERROR` status are returned as
    /// [`Error::Remote`](`crate::Error::Remote`).
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`]: the connection is closed or closed while waiting
    /// - [`Error::Remote`]: the server answered with an error
    /// - [`Error::Protocol`]: the message does not fit in a frame
    pub fn send_with_reply(&self, msg: Message) -> Result<Message, Error> {
        let mut state = self.shared.lock();
        let reply = self.shared.call_blocking(&mut state, msg, true)?;
        if reply.header.status == Status::Error {
            return Err(RemoteError::from(reply).into());
        }
        Ok(reply)
    }

    /// Sends a message and blocks until it is on the wire.
    pub fn send_no_reply(&self, msg: Message) -> Result<(), Error> {
        let mut state = self.shared.lock();
        self.shared.call_blocking(&mut state, msg, false).map(|_| ())
    }

    /// Sends a message without ever blocking.
    ///
    /// Whatever cannot be written right away stays queued and is sent by
    /// the next thread driving the socket, or by the async I/O watcher.
    pub fn send_non_block(&self, msg: Message) -> Result<SendStatus, Error> {
        let mut state = self.shared.lock();
        match self.shared.call(&mut state, msg, false, true)? {
            Outcome::Complete(_) => Ok(SendStatus::Sent),
            Outcome::Queued => Ok(SendStatus::Queued),
        }
    }

    /// Routes unsolicited `MESSAGE` frames of `program`/`version` to
    /// `handler`, replacing any previous handler.
    pub fn register_program<H>(&self, program: u32, version: u32, handler: H)
    where
        H: EventHandler,
    {
        debug!(program, version, "program registered");
        self.shared
            .lock()
            .programs
            .insert((program, version), Arc::new(handler));
    }

    /// Returns `true` if a handler was registered.
    pub fn unregister_program(&self, program: u32, version: u32) -> bool {
        self.shared.lock().programs.remove(&(program, version)).is_some()
    }

    /// Registers a stream under a fresh serial.
    ///
    /// The stream receives the `STREAM` frames sent by the server for
    /// `program`/`version` and the serial of [`Stream::header`]. The call
    /// opening the stream on the server is sent by the caller with that
    /// header.
    pub fn open_stream(&self, program: u32, version: u32, procedure: u32) -> Stream {
        let key = CallKey {
            program,
            version,
            serial: self.next_serial(),
        };
        self.shared.lock().streams.insert(key, StreamState::default());
        debug!(%key, procedure, "stream opened");
        Stream::new(self.clone(), key, procedure)
    }

    /// Starts probing the peer every `interval` of silence. After `count`
    /// silent intervals the connection is closed with
    /// [`CloseReason::Keepalive`].
    pub fn start_keepalive(&self, interval: Duration, count: u32) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if !state.is_open() {
            return Err(state.closed_error());
        }
        state.keepalive.start(interval, count, quanta::Instant::now());
        debug!(?interval, count, "keepalive started");
        // The buck holder may be sleeping with no deadline.
        self.shared.wake()?;
        Ok(())
    }

    pub fn stop_keepalive(&self) {
        self.shared.lock().keepalive.stop();
    }

    pub fn keepalive_enabled(&self) -> bool {
        self.shared.lock().keepalive.is_enabled()
    }

    /// Sets the function called once when the connection closes, with the
    /// connection mutex released.
    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        self.shared.lock().set_close_callback(Some(Box::new(cb)));
    }

    /// Closes the connection.
    ///
    /// Every pending call fails with [`Error::Closed`]. Closing twice is a
    /// no-op. When another thread is driving the socket the close completes
    /// on that thread.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().is_open()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lock().close_reason()
    }

    /// A serial number not yet used on this connection.
    pub fn next_serial(&self) -> u32 {
        self.shared.next_serial()
    }

    /// Number of calls queued on the connection.
    pub fn pending_calls(&self) -> usize {
        self.shared.lock().pending_calls()
    }

    /// Starts a watcher thread that drives the socket whenever no caller
    /// does.
    ///
    /// Events, stream data, keepalive and queued non-blocking sends are then
    /// serviced with no call in flight. The watcher stops when the
    /// connection closes, and keeps it alive until then.
    pub fn register_async_io(&self) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if !state.is_open() {
            return Err(state.closed_error());
        }
        if state.async_io {
            return Ok(());
        }
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("netrpc-io".to_string())
            .spawn(move || shared.watch())?;
        state.async_io = true;
        Ok(())
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.shared.info.local_addr.as_deref()
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.shared.info.remote_addr.as_deref()
    }

    /// Returns `true` if descriptors can be attached to messages.
    pub fn has_pass_fd(&self) -> bool {
        self.shared.info.has_pass_fd
    }

    pub fn is_encrypted(&self) -> bool {
        self.shared.info.encrypted
    }

    /// The socket descriptor. Only valid while the connection is open.
    pub fn raw_fd(&self) -> RawFd {
        self.shared.info.fd
    }

    /// Duplicates the socket descriptor, with close-on-exec set.
    pub fn dup_fd(&self) -> Result<OwnedFd, Error> {
        // The socket cannot be closed while the mutex is held.
        let state = self.shared.lock();
        if state.is_closed() {
            return Err(state.closed_error());
        }
        // SAFETY: the descriptor is open, `fcntl` does not touch memory.
        let fd = unsafe { libc::fcntl(self.shared.info.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `fd` is a fresh descriptor nobody else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Retrieves the connection counters.
    #[cfg(feature = "stats")]
    pub fn get_stats(&self) -> ClientStats {
        let stats = &self.shared.stats;
        ClientStats {
            calls_sent: stats.calls_sent.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            replies_dropped: stats.replies_dropped.load(Ordering::Relaxed),
            events_dropped: stats.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the connection counters.
///
/// Returned by [`Client::get_stats`] when the `stats` feature is enabled.
#[cfg(feature = "stats")]
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ClientStats {
    /// Messages fully written to the socket.
    pub calls_sent: usize,
    /// Bytes written, framing included.
    pub bytes_sent: usize,
    /// Frames decoded from the socket.
    pub frames_received: usize,
    /// Payload bytes received.
    pub bytes_received: usize,
    /// Replies matching no pending call.
    pub replies_dropped: usize,
    /// Events for programs without a handler.
    pub events_dropped: usize,
}

enum Target {
    Address(Address),
    Transport(Box<dyn Transport>),
}

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    target: Target,
    max_frame: usize,
    max_fds: usize,
    keepalive: Option<(Duration, u32)>,
    #[cfg(feature = "tls")]
    hostname: Option<String>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<ClientConfig>>,
}

impl ClientBuilder {
    fn new(target: Target) -> Self {
        Self {
            target,
            max_frame: MAX_FRAME,
            max_fds: MAX_FDS,
            keepalive: None,
            #[cfg(feature = "tls")]
            hostname: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Sets the largest frame accepted in either direction, length word
    /// included.
    ///
    /// Default: 16 MiB + 4 bytes
    #[must_use]
    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Sets the largest number of descriptors a received frame may carry.
    ///
    /// Default: 32
    #[must_use]
    pub fn max_fds(mut self, max_fds: usize) -> Self {
        self.max_fds = max_fds;
        self
    }

    /// Starts keepalive right after connecting.
    ///
    /// Default: disabled
    #[must_use]
    pub fn keepalive(mut self, interval: Duration, count: u32) -> Self {
        self.keepalive = Some((interval, count));
        self
    }

    /// Sets the name the server certificate is checked against. Defaults to
    /// the host of the address.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Encrypts the connection. Only valid with [`Address::Tcp`].
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Connects and returns the client.
    pub fn build(self) -> Result<Client, Error> {
        let transport = match self.target {
            #[cfg(feature = "tls")]
            Target::Address(address) if self.tls.is_some() => {
                let config = self.tls.clone().ok_or(Error::InvalidCall("missing TLS configuration"))?;
                transport::connect_tls(&address, config, self.hostname.as_deref())?
            }
            Target::Address(address) => transport::connect(&address)?,
            Target::Transport(transport) => transport,
        };

        let limits = Limits {
            max_frame: self.max_frame,
            max_fds: self.max_fds,
        };
        let client = Client {
            shared: Arc::new(Shared::new(transport, limits)?),
        };
        if let Some((interval, count)) = self.keepalive {
            client.start_keepalive(interval, count)?;
        }
        Ok(client)
    }
}

/// Creates a builder connecting to `address`.
pub fn client(address: Address) -> ClientBuilder {
    ClientBuilder::new(Target::Address(address))
}

/// Creates a builder over an already connected transport.
pub fn client_over<T>(transport: T) -> ClientBuilder
where
    T: Transport,
{
    ClientBuilder::new(Target::Transport(Box::new(transport)))
}
