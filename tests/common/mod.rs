#![allow(dead_code)]

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    thread,
    time::{Duration, Instant},
};

use netrpc::{Client, Header, Message, MessageType, Status};
use tracing_subscriber::EnvFilter;

pub const PROGRAM: u32 = 0x2000_8086;
pub const VERSION: u32 = 1;
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The server side of a connection, driven by the test.
pub struct Peer {
    pub sock: UnixStream,
}

impl Peer {
    /// Reads one frame, panicking on timeout.
    pub fn recv(&mut self) -> Message {
        self.try_recv().expect("peer read failed")
    }

    /// Reads one frame, `None` once the client is gone.
    pub fn try_recv(&mut self) -> Option<Message> {
        let mut len = [0u8; 4];
        self.sock.read_exact(&mut len).ok()?;
        let total = u32::from_be_bytes(len) as usize;
        let mut frame = len.to_vec();
        frame.resize(total, 0);
        self.sock.read_exact(&mut frame[4..]).ok()?;
        let (msg, _nfds) = Message::decode(&frame).ok()?;
        Some(msg)
    }

    pub fn send(&mut self, msg: &Message) {
        self.sock.write_all(&msg.encode().unwrap()).unwrap();
    }

    /// Answers `call` with the same program, procedure and serial.
    pub fn reply(&mut self, call: &Header, status: Status, payload: impl Into<Vec<u8>>) {
        let header = call.with_kind(MessageType::Reply).with_status(status);
        self.send(&Message::new(header, payload));
    }
}

/// A client connected to a scripted peer.
pub fn pair() -> (Client, Peer) {
    init();
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs.set_read_timeout(Some(TIMEOUT)).unwrap();
    let client = netrpc::client_over(ours).build().unwrap();
    (client, Peer { sock: theirs })
}

pub fn call(client: &Client, procedure: u32, payload: impl Into<Vec<u8>>) -> Message {
    Message::new(Header::call(PROGRAM, VERSION, procedure, client.next_serial()), payload)
}

/// Polls `cond` until it holds, panicking after [`TIMEOUT`].
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < TIMEOUT, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}
