//! One-shot wakeups between the thread driving the socket and the threads
//! parked on their calls.
//!
//! A [`Notifier`] lives inside a queued call and a [`Waiter`] stays with the
//! thread that submitted it. Signals are sticky: one raised before the
//! waiter goes to sleep is not lost. Dropping either side hangs up the pair,
//! which is how a purged call tells its thread that the connection is gone.
//!
//! ```text
//!             notify()                 drop(Notifier)
//!   IDLE ──────────────► SIGNALLED      IDLE ──────────► HUNG UP
//!    ▲                       │
//!    └────── wait() ─────────┘
//! ```
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use event_listener::{Event, IntoNotification, Listener};
use thiserror::Error;

/// The other end of the pair was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the other end of the call signal was dropped")]
pub(crate) struct HungUp;

const SIGNALLED: u8 = 0b01;
const HUNG_UP: u8 = 0b10;

struct Slot {
    event: Event,
    flags: AtomicU8,
}

impl Slot {
    /// Consumes a pending signal. A signal raised right before the notifier
    /// went away still counts.
    fn take(&self) -> Option<Result<(), HungUp>> {
        let flags = self.flags.fetch_and(!SIGNALLED, Ordering::AcqRel);
        if flags & SIGNALLED != 0 {
            Some(Ok(()))
        } else if flags & HUNG_UP != 0 {
            Some(Err(HungUp))
        } else {
            None
        }
    }

    fn hang_up(&self) {
        self.flags.fetch_or(HUNG_UP, Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }
}

pub(crate) fn new() -> (Notifier, Waiter) {
    let slot = Arc::new(Slot {
        event: Event::new(),
        flags: AtomicU8::new(0),
    });
    (Notifier(slot.clone()), Waiter(slot))
}

/// Raising side, owned by the queued call.
pub(crate) struct Notifier(Arc<Slot>);

impl Notifier {
    pub(crate) fn notify(&self) -> Result<(), HungUp> {
        let flags = self.0.flags.fetch_or(SIGNALLED, Ordering::AcqRel);
        if flags & HUNG_UP != 0 {
            return Err(HungUp);
        }
        self.0.event.notify(1.additional().relaxed());
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.hang_up();
    }
}

/// Parking side, owned by the submitting thread.
pub(crate) struct Waiter(Arc<Slot>);

impl Waiter {
    /// Blocks the calling thread until signalled or hung up.
    pub(crate) fn wait(&self) -> Result<(), HungUp> {
        loop {
            if let Some(res) = self.0.take() {
                return res;
            }
            // Re-check once registered, the signal may have landed in between.
            let listener = self.0.event.listen();
            if let Some(res) = self.0.take() {
                return res;
            }
            listener.wait();
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.hang_up();
    }
}
