//! Connection core: many threads, one socket, no I/O thread.
//!
//! Every thread submitting a call queues it under the connection mutex.
//! Whoever finds the socket free takes "the buck" and drives I/O for
//! *everybody*: it writes queued calls in order, reads frames and routes
//! them, and wakes the threads whose replies arrived. Once its own call is
//! done it hands the buck to another waiting thread, or releases it.
//!
//! ```text
//!   thread A          thread B          thread C
//!      │ submit           │                 │
//!      │ take buck        │ submit          │
//!      ├─ poll ◄──────────┤ wake            │
//!      │ write B          │ (parked)        │
//!      │ read  B reply ───┼──► signal ──►   │
//!      │                  │ returns         │ submit
//!      ├─ poll ◄──────────┼─────────────────┤ wake
//!      │ read  A reply    │                 │ (parked)
//!      │ pass the buck ───┼─────────────────┼──► signal
//!      │ returns          │                 │ takes buck, polls
//! ```
//!
//! The socket is never touched without the buck, and the buck holder does
//! its I/O with the mutex released so that other threads can keep queueing.
mod call;
mod input;
mod keepalive;
mod router;
mod stream;

#[cfg(feature = "stats")]
use std::sync::atomic::AtomicUsize;
use std::{
    collections::HashMap,
    io::{self, Write},
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use parking_lot::{Condvar, Mutex, MutexGuard};
use quanta::Instant;
use tracing::{debug, error, trace, warn};

pub(crate) use self::call::{Call, CallId, CallMode, Flushed};
use self::{
    call::CallQueue,
    input::{Input, InputError},
    keepalive::{KeepAlive, Trigger},
    router::Event,
};
pub use self::router::EventHandler;
pub(crate) use self::stream::StreamState;
use crate::{
    codec::Limits,
    error::{CloseReason, Error, ProtocolError},
    protocol::{CallKey, Message},
    transport::Transport,
};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

pub(crate) type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

/// How a submitted call left the event loop.
pub(crate) enum Outcome {
    /// The call is done, carrying the reply or the sent message.
    Complete(Message),
    /// The call stays queued and will be finished by another thread.
    Queued,
}

enum Step {
    Continue,
    Complete(Message),
    /// One non-blocking pass is over.
    Yield,
    Closed,
}

#[derive(Debug, Default)]
struct Readiness {
    readable: bool,
    writable: bool,
    hangup: bool,
}

/// Everything only the buck holder may touch.
struct Io {
    transport: Box<dyn Transport>,
    poll: Poll,
    events: Events,
    input: Input,
}

impl Io {
    fn poll(&mut self, write: bool, timeout: Option<Duration>) -> io::Result<Readiness> {
        let interest = if write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        // Re-arming also reports readiness that is already pending.
        let fd = self.transport.as_raw_fd();
        self.poll.registry().reregister(&mut SourceFd(&fd), SOCKET, interest)?;

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let mut ready = Readiness::default();
        for event in self.events.iter() {
            match event.token() {
                SOCKET => {
                    ready.readable |= event.is_readable();
                    ready.writable |= event.is_writable();
                    ready.hangup |= event.is_read_closed() || event.is_write_closed() || event.is_error();
                }
                WAKER => trace!("event loop woken up"),
                _ => {}
            }
        }
        Ok(ready)
    }
}

/// Connection state guarded by the connection mutex.
pub(crate) struct State {
    /// `None` while the buck holder owns it, or once closed.
    io: Option<Io>,
    calls: CallQueue,
    /// Completed calls whose threads have not picked them up yet.
    delivered: Vec<Call>,
    pub(crate) programs: HashMap<(u32, u32), Arc<dyn EventHandler>>,
    pub(crate) streams: HashMap<CallKey, StreamState>,
    pub(crate) keepalive: KeepAlive,
    have_the_buck: bool,
    want_close: bool,
    closed: bool,
    close_reason: Option<CloseReason>,
    close_cb: Option<CloseCallback>,
    next_id: CallId,
    pub(crate) async_io: bool,
    limits: Limits,
}

impl State {
    /// The socket is up and nobody asked to close it.
    pub(crate) fn is_open(&self) -> bool {
        !self.closed && !self.want_close
    }

    /// The socket is gone.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::Closed(self.close_reason.unwrap_or(CloseReason::Client))
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn set_close_callback(&mut self, cb: Option<CloseCallback>) {
        self.close_cb = cb;
    }

    /// Records `reason` unless one is already known, and requests a close.
    fn mark_close(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        self.want_close = true;
    }

    fn next_id(&mut self) -> CallId {
        self.next_id += 1;
        self.next_id
    }

    /// Queues a one-way message nobody waits for.
    fn queue_detached(&mut self, msg: Message) {
        let id = self.next_id();
        match Call::new(id, msg, false, true, self.limits.max_frame) {
            Ok((call, _)) => self.calls.push(call),
            Err(e) => warn!(error = %e, "failed to queue detached call"),
        }
    }

    /// Takes every completed call out of the queue but `this`, waking their
    /// threads.
    fn remove_done(&mut self, this: Option<CallId>) {
        let done = self
            .calls
            .remove_where(|c| c.mode == CallMode::Complete && Some(c.id) != this);
        for call in done {
            if call.has_thread {
                trace!(id = call.id, key = %call.key(), "waking call");
                call.signal();
                self.delivered.push(call);
            } else {
                trace!(id = call.id, key = %call.key(), "detached call finished");
            }
        }
    }

    fn take_delivered(&mut self, id: CallId) -> Option<Call> {
        let pos = self.delivered.iter().position(|c| c.id == id)?;
        Some(self.delivered.swap_remove(pos))
    }
}

/// Static facts about the transport, captured at connect time.
#[derive(Debug, Clone)]
pub(crate) struct Info {
    pub(crate) fd: RawFd,
    pub(crate) local_addr: Option<String>,
    pub(crate) remote_addr: Option<String>,
    pub(crate) has_pass_fd: bool,
    pub(crate) encrypted: bool,
}

#[cfg(feature = "stats")]
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) calls_sent: AtomicUsize,
    pub(crate) bytes_sent: AtomicUsize,
    pub(crate) frames_received: AtomicUsize,
    pub(crate) bytes_received: AtomicUsize,
    pub(crate) replies_dropped: AtomicUsize,
    pub(crate) events_dropped: AtomicUsize,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    /// Signalled whenever the buck is released.
    idle: Condvar,
    /// Interrupts the buck holder's poll.
    waker: Waker,
    serial: AtomicU32,
    pub(crate) info: Info,
    #[cfg(feature = "stats")]
    pub(crate) stats: Stats,
}

impl Shared {
    /// Takes over a connected transport, switching it to non-blocking mode.
    pub(crate) fn new(transport: Box<dyn Transport>, limits: Limits) -> io::Result<Self> {
        transport.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let fd = transport.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOCKET, Interest::READABLE)?;

        let info = Info {
            fd,
            local_addr: transport.local_addr(),
            remote_addr: transport.remote_addr(),
            has_pass_fd: transport.has_pass_fd(),
            encrypted: transport.is_encrypted(),
        };
        debug!(fd, remote = ?info.remote_addr, encrypted = info.encrypted, "connection ready");

        let io = Io {
            transport,
            poll,
            events: Events::with_capacity(8),
            input: Input::new(limits),
        };
        let state = State {
            io: Some(io),
            calls: CallQueue::default(),
            delivered: Vec::new(),
            programs: HashMap::new(),
            streams: HashMap::new(),
            keepalive: KeepAlive::new(),
            have_the_buck: false,
            want_close: false,
            closed: false,
            close_reason: None,
            close_cb: None,
            next_id: 0,
            async_io: false,
            limits,
        };

        Ok(Self {
            state: Mutex::new(state),
            idle: Condvar::new(),
            waker,
            serial: AtomicU32::new(1),
            info,
            #[cfg(feature = "stats")]
            stats: Stats::default(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    pub(crate) fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Pokes the buck holder so that it re-reads the connection state.
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Queues `msg` and drives the connection until the call is done.
    ///
    /// A blocking call only returns [`Outcome::Complete`] or an error. A
    /// non-blocking call returns [`Outcome::Queued`] as soon as it would
    /// have to wait for the socket.
    pub(crate) fn call(
        &self,
        state: &mut MutexGuard<'_, State>,
        msg: Message,
        expects_reply: bool,
        non_blocking: bool,
    ) -> Result<Outcome, Error> {
        if !state.is_open() {
            return Err(state.closed_error());
        }

        if !msg.fds.is_empty() {
            if !self.info.has_pass_fd {
                return Err(ProtocolError::FdPassingUnsupported.into());
            }
            if msg.fds.len() > state.limits.max_fds {
                return Err(ProtocolError::TooManyFds {
                    count: msg.fds.len(),
                    max: state.limits.max_fds,
                }
                .into());
            }
        }

        let id = state.next_id();
        let (mut call, waiter) = Call::new(id, msg, expects_reply, non_blocking, state.limits.max_frame)?;
        call.has_thread = true;
        trace!(id, key = %call.key(), expects_reply, non_blocking, "call queued");
        state.calls.push(call);

        if state.have_the_buck {
            if let Err(e) = self.wake() {
                state.calls.remove(id);
                return Err(e.into());
            }
            if non_blocking {
                if let Some(call) = state.calls.get_mut(id) {
                    call.has_thread = false;
                }
                return Ok(Outcome::Queued);
            }

            let woke = MutexGuard::unlocked(state, || waiter.wait());

            if let Some(call) = state.take_delivered(id) {
                return Ok(Outcome::Complete(call.into_message()));
            }
            if woke.is_err() || state.calls.get(id).is_none() {
                state.calls.remove(id);
                return Err(state.closed_error());
            }
            trace!(id, "buck received");
        } else {
            state.have_the_buck = true;
            trace!(id, "buck taken");
        }

        let Some(io) = state.io.take() else {
            state.calls.remove(id);
            state.have_the_buck = false;
            self.idle.notify_all();
            return Err(state.closed_error());
        };
        self.run(state, io, Some(id), !non_blocking)
    }

    /// [`call`](`Self::call`) for a blocking call.
    pub(crate) fn call_blocking(
        &self,
        state: &mut MutexGuard<'_, State>,
        msg: Message,
        expects_reply: bool,
    ) -> Result<Message, Error> {
        match self.call(state, msg, expects_reply, false)? {
            Outcome::Complete(msg) => Ok(msg),
            Outcome::Queued => unreachable!("blocking calls run to completion"),
        }
    }

    /// Runs one non-blocking pass of the event loop if nobody else is
    /// driving the socket.
    pub(crate) fn pump(&self, state: &mut MutexGuard<'_, State>) -> Result<(), Error> {
        if !state.is_open() {
            return Err(state.closed_error());
        }
        if state.have_the_buck {
            return Ok(());
        }
        let Some(io) = state.io.take() else {
            return Err(state.closed_error());
        };
        state.have_the_buck = true;
        self.run(state, io, None, false).map(|_| ())
    }

    fn run(
        &self,
        state: &mut MutexGuard<'_, State>,
        mut io: Io,
        this: Option<CallId>,
        block: bool,
    ) -> Result<Outcome, Error> {
        loop {
            match self.step(state, &mut io, this, block) {
                Step::Continue => {}
                Step::Complete(msg) => {
                    self.pass_the_buck(state, io, this);
                    return Ok(Outcome::Complete(msg));
                }
                Step::Yield => {
                    if let Some(call) = this.and_then(|id| state.calls.get_mut(id)) {
                        call.has_thread = false;
                    }
                    self.pass_the_buck(state, io, this);
                    return Ok(Outcome::Queued);
                }
                Step::Closed => {
                    if let Some(id) = this {
                        state.calls.remove(id);
                    }
                    state.have_the_buck = false;
                    self.close_locked(state, Some(io));
                    return Err(state.closed_error());
                }
            }
        }
    }

    /// One iteration of the event loop.
    fn step(&self, state: &mut MutexGuard<'_, State>, io: &mut Io, this: Option<CallId>, block: bool) -> Step {
        let cached = io.transport.has_cached_data();
        let timeout = if cached || state.want_close || !block {
            Some(Duration::ZERO)
        } else {
            state.keepalive.timeout(Instant::now())
        };
        let want_write = io.transport.wants_write() || state.calls.iter().any(|c| c.mode == CallMode::Sending);

        let polled = MutexGuard::unlocked(state, || io.poll(want_write, timeout));
        let mut ready = match polled {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "poll failed");
                state.mark_close(CloseReason::Error);
                return Step::Closed;
            }
        };

        match state.keepalive.trigger(Instant::now()) {
            Trigger::Idle => {}
            Trigger::Ping(ping) => {
                debug!(missed = state.keepalive.missed(), "sending keepalive ping");
                state.queue_detached(ping);
                ready.writable = true;
            }
            Trigger::Dead => {
                warn!("no keepalive response from peer, closing connection");
                state.mark_close(CloseReason::Keepalive);
            }
        }
        ready.readable |= cached;

        let mut fatal = None;
        if ready.writable && !state.want_close {
            if let Err(e) = self.handle_output(state, io) {
                error!(error = %e, "write failed");
                fatal = Some(CloseReason::Error);
            }
        }

        let mut events = Vec::new();
        if ready.readable && fatal.is_none() && !state.want_close {
            match self.handle_input(state, io, &mut events) {
                Ok(()) => {}
                Err(InputError::Eof) => {
                    debug!("peer closed the connection");
                    fatal = Some(CloseReason::Eof);
                }
                Err(e) => {
                    error!(error = %e, "read failed");
                    fatal = Some(CloseReason::Error);
                }
            }
        }
        if let Some(reason) = fatal {
            state.mark_close(reason);
        }

        if !events.is_empty() {
            MutexGuard::unlocked(state, || events.into_iter().for_each(Event::deliver));
        }

        state.remove_done(this);

        if let Some(id) = this {
            if state.calls.get(id).is_some_and(|c| c.mode == CallMode::Complete) {
                if let Some(call) = state.calls.remove(id) {
                    trace!(id, "call complete");
                    return Step::Complete(call.into_message());
                }
            }
        }

        if state.want_close {
            return Step::Closed;
        }
        if ready.hangup {
            debug!("socket hung up");
            state.mark_close(CloseReason::Eof);
            return Step::Closed;
        }
        if !block {
            return Step::Yield;
        }
        Step::Continue
    }

    /// Writes queued calls in submission order until the socket is full.
    fn handle_output(&self, state: &mut State, io: &mut Io) -> io::Result<()> {
        match io.transport.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }

        for call in state.calls.iter_mut().filter(|c| c.mode == CallMode::Sending) {
            match call.flush(&mut *io.transport)? {
                Flushed::Done(_bytes) => {
                    #[cfg(feature = "stats")]
                    {
                        self.stats.calls_sent.fetch_add(1, Ordering::Relaxed);
                        self.stats.bytes_sent.fetch_add(_bytes, Ordering::Relaxed);
                    }
                }
                Flushed::Blocked => break,
            }
        }
        Ok(())
    }

    /// Reads and routes frames until the socket runs dry.
    fn handle_input(&self, state: &mut State, io: &mut Io, events: &mut Vec<Event>) -> Result<(), InputError> {
        while let Some(msg) = io.input.advance(&mut *io.transport)? {
            #[cfg(feature = "stats")]
            {
                self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_received.fetch_add(msg.payload.len(), Ordering::Relaxed);
            }
            if let Some(event) = self.dispatch(state, msg) {
                events.push(event);
            }
        }
        Ok(())
    }

    /// Hands the socket to the next parked thread, or releases it.
    fn pass_the_buck(&self, state: &mut MutexGuard<'_, State>, io: Io, this: Option<CallId>) {
        if state.want_close {
            state.have_the_buck = false;
            self.close_locked(state, Some(io));
            return;
        }

        state.io = Some(io);
        if let Some(next) = state.calls.iter().find(|c| c.has_thread && Some(c.id) != this) {
            trace!(id = next.id, "passing the buck");
            next.signal();
            return;
        }

        state.have_the_buck = false;
        trace!("buck released");
        self.idle.notify_all();
    }

    /// Tears the connection down: purges the queue, which wakes every parked
    /// thread with an error, and runs the close callback once.
    fn close_locked(&self, state: &mut MutexGuard<'_, State>, io: Option<Io>) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.want_close = true;
        let reason = *state.close_reason.get_or_insert(CloseReason::Client);

        drop(io);
        state.io = None;
        state.keepalive.stop();
        let purged = state.calls.remove_where(|_| true);
        debug!(%reason, purged = purged.len(), "connection closed");
        drop(purged);
        self.idle.notify_all();

        if let Some(cb) = state.close_cb.take() {
            MutexGuard::unlocked(state, || cb(reason));
        }
    }

    /// Requests a close. The buck holder, if any, finishes it.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if !state.is_open() {
            return;
        }
        debug!("close requested");
        state.mark_close(CloseReason::Client);

        if state.have_the_buck {
            if let Err(e) = self.wake() {
                warn!(error = %e, "failed to wake the event loop");
            }
            return;
        }
        let io = state.io.take();
        self.close_locked(&mut state, io);
    }

    /// Body of the async I/O watcher thread.
    ///
    /// Whenever nobody drives the socket, it takes the buck for one blocking
    /// pass of the event loop, then hands it over like any caller would.
    pub(crate) fn watch(self: Arc<Self>) {
        debug!("async I/O watcher started");
        let mut state = self.state.lock();
        loop {
            while state.have_the_buck && !state.closed {
                self.idle.wait(&mut state);
            }
            let Some(mut io) = state.io.take() else {
                break;
            };
            state.have_the_buck = true;

            match self.step(&mut state, &mut io, None, true) {
                Step::Closed => {
                    state.have_the_buck = false;
                    self.close_locked(&mut state, Some(io));
                    break;
                }
                _ => self.pass_the_buck(&mut state, io, None),
            }
        }
        state.async_io = false;
        debug!("async I/O watcher stopped");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.mark_close(CloseReason::Client);
            let io = state.io.take();
            self.close_locked(&mut state, io);
        }
    }
}
