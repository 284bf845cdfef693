//! netrpc: a multi-threaded RPC client transport. One socket, many callers,
//! no I/O thread.
//!
//! A single connection carries synchronous calls, one-way and non-blocking
//! sends, unsolicited server events, bidirectional data streams and
//! keepalive pings, for any number of threads at once. There is no
//! dedicated reader thread: whichever caller finds the socket idle drives it
//! on behalf of everybody, then hands it over to the next waiting caller.
//!
//! # Overview
//!
//! ```text
//!  CALLERS                                                     User code
//! ┌──────────┐ ┌──────────┐ ┌──────────────┐ ┌──────────┐
//! │ call #1  │ │ call #2  │ │ non-blocking │ │ stream   │
//! └────┬─────┘ └────┬─────┘ └──────┬───────┘ └────┬─────┘
//!      ▼            ▼              ▼              ▼
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!  CONNECTION                                                netrpc
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Call queue (FIFO send):  [#1][#2][nb][stream]               │
//! │                                                              │
//! │  Buck holder (one caller at a time):                         │
//! │    poll ─► write queued calls ─► read frames ─► route        │
//! │                                                     │        │
//! │         ┌──────────────┬──────────────┬─────────────┤        │
//! │         ▼              ▼              ▼             ▼        │
//! │      REPLY          MESSAGE        STREAM       keepalive    │
//! │   wake the call   run handler    buffer data   answer PING   │
//! └───────────┬──────────────────────────────────────────────────┘
//!             ▼ Unix / TCP / TLS / ssh tunnel
//! ```
//!
//! Calls are *sent* in submission order but *complete* in the order their
//! replies arrive. A thread waiting for a reply sleeps on its own call and
//! is woken either with its reply or with the socket, when the previous
//! owner is done with it.
//!
//! # Wire format
//!
//! Every frame starts with a big-endian `u32` holding the total frame length
//! (itself included), followed by the 24-byte [`Header`] and the payload.
//! Frames of the `*_WITH_FDS` kinds carry a descriptor count before the
//! payload, and the descriptors travel out of band over the UNIX socket.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use netrpc::{Address, Header, Message, MessageType};
//!
//! fn main() -> Result<(), netrpc::Error> {
//!     let client = netrpc::client(Address::Unix("/run/app/sock".into()))
//!         .keepalive(Duration::from_secs(5), 5)
//!         .build()?;
//!
//!     // Server events for program 0x2000_8086
//!     client.register_program(0x2000_8086, 1, |msg: Message| {
//!         println!("event {}", msg.header.procedure);
//!     });
//!     client.register_async_io()?;
//!
//!     // A call and its reply
//!     let header = Header::call(0x2000_8086, 1, 66, client.next_serial());
//!     let reply = client.send_with_reply(Message::new(header, vec![]))?;
//!     assert_eq!(reply.header.kind, MessageType::Reply);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! [`Error`] tells apart a closed connection (with its [`CloseReason`]), an
//! error returned by the server ([`RemoteError`]) and a local protocol
//! violation ([`ProtocolError`]). Transport failures and keepalive timeouts
//! close the connection and fail every pending call; everything else only
//! fails the offending call.
//!
//! # Features
//!
//! - `tls`: TLS over TCP through `rustls`
//! - `stats`: connection counters through [`Client::get_stats`]
mod api;
mod buffers;
mod client;
mod codec;
mod error;
mod protocol;
mod sync;
pub mod transport;

pub use api::*;
pub use client::EventHandler;
pub use error::{CloseReason, Error, ProtocolError, RemoteError};
pub use protocol::{CallKey, HEADER_SIZE, Header, MAX_FDS, MAX_FRAME, MAX_PAYLOAD, Message, MessageType, Status};
pub use transport::{Address, Transport};
