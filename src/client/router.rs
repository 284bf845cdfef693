#[cfg(feature = "stats")]
use std::sync::atomic::Ordering;
use std::sync::Arc;

use quanta::Instant;
use tracing::{debug, trace, warn};

use super::{CallMode, Shared, State};
use crate::{
    error::RemoteError,
    protocol::{
        CallKey, Header, Message, MessageType, Status,
        keepalive::{self, Keepalive},
    },
};

/// Receiver of unsolicited `MESSAGE` frames for one program.
///
/// Handlers run on whichever thread is driving the socket, with the
/// connection mutex released. They may queue non-blocking sends but must not
/// wait for a reply on the same connection: the socket is not serviced until
/// the handler returns.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, msg: Message);
}

impl<F> EventHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn handle_event(&self, msg: Message) {
        self(msg)
    }
}

/// An event ready to be handed to its program.
pub(crate) struct Event {
    handler: Arc<dyn EventHandler>,
    msg: Message,
}

impl Event {
    pub(crate) fn deliver(self) {
        self.handler.handle_event(self.msg);
    }
}

impl Shared {
    /// Routes one incoming frame. Returns the event to deliver once the
    /// mutex is released, if any.
    pub(super) fn dispatch(&self, state: &mut State, mut msg: Message) -> Option<Event> {
        state.keepalive.received(Instant::now());
        let header = msg.header;

        if keepalive::is_keepalive(&header) {
            match keepalive::classify(&header) {
                Some(Keepalive::Ping) => {
                    debug!("keepalive ping received, answering");
                    state.queue_detached(keepalive::pong());
                }
                Some(Keepalive::Pong) => trace!("keepalive pong received"),
                None => warn!(?header, "malformed keepalive frame"),
            }
            return None;
        }

        match header.kind {
            MessageType::Reply | MessageType::ReplyWithFds => {
                self.dispatch_reply(state, msg);
                None
            }
            MessageType::Message => self.dispatch_event(state, msg),
            MessageType::Stream => {
                let payload = std::mem::take(&mut msg.payload);
                dispatch_stream(state, header, payload);
                None
            }
            MessageType::Call | MessageType::CallWithFds => {
                warn!(
                    program = header.program,
                    version = header.version,
                    procedure = header.procedure,
                    serial = header.serial,
                    "unexpected call from server, dropping"
                );
                None
            }
        }
    }

    fn dispatch_reply(&self, state: &mut State, msg: Message) {
        let key = msg.header.key();
        let call = state.calls.find_mut(|c| {
            c.expects_reply
                && c.mode == CallMode::AwaitingReply
                && c.msg.header.kind != MessageType::Stream
                && c.key() == key
        });
        match call {
            Some(call) => {
                trace!(id = call.id, %key, status = %msg.header.status, "reply matched");
                call.complete(msg);
            }
            None => {
                warn!(%key, procedure = msg.header.procedure, "unexpected reply, dropping");
                #[cfg(feature = "stats")]
                self.stats.replies_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn dispatch_event(&self, state: &mut State, msg: Message) -> Option<Event> {
        let header = msg.header;
        match state.programs.get(&(header.program, header.version)) {
            Some(handler) => {
                trace!(program = header.program, procedure = header.procedure, "event received");
                Some(Event {
                    handler: handler.clone(),
                    msg,
                })
            }
            None => {
                debug!(
                    program = header.program,
                    version = header.version,
                    procedure = header.procedure,
                    "no handler for event, dropping"
                );
                #[cfg(feature = "stats")]
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// Feeds a stream frame to its stream and wakes the stream calls waiting
/// on it.
fn dispatch_stream(state: &mut State, header: Header, payload: Vec<u8>) {
    let key = header.key();
    let Some(stream) = state.streams.get_mut(&key) else {
        debug!(%key, "frame for unknown stream, dropping");
        return;
    };

    match header.status {
        Status::Continue => {
            stream.push(payload);
            // Readers wait with a CONTINUE status, a pending finish or
            // abort keeps waiting for the final status.
            complete_waiting(state, key, &header, &[], true);
        }
        Status::Ok => {
            stream.finish();
            if complete_waiting(state, key, &header, &payload, false) == 0 {
                debug!(%key, "stream finished by server");
            }
        }
        Status::Error => {
            stream.fail(RemoteError {
                program: header.program,
                version: header.version,
                procedure: header.procedure,
                serial: header.serial,
                payload: payload.clone(),
            });
            complete_waiting(state, key, &header, &payload, false);
        }
    }
}

fn complete_waiting(state: &mut State, key: CallKey, header: &Header, payload: &[u8], readers_only: bool) -> usize {
    let mut woken = 0;
    for call in state.calls.iter_mut().filter(|c| {
        c.expects_reply
            && c.mode == CallMode::AwaitingReply
            && c.msg.header.kind == MessageType::Stream
            && c.key() == key
            && (!readers_only || c.msg.header.status == Status::Continue)
    }) {
        trace!(id = call.id, %key, status = %header.status, "stream call completed");
        call.complete(Message::new(*header, payload));
        woken += 1;
    }
    woken
}
