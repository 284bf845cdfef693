mod common;

use std::{thread, time::Duration};

use common::{PROGRAM, VERSION, pair, wait_until};
use netrpc::{Error, Header, Message, MessageType, Status, StreamRead};

const PROC: u32 = 20;

fn frame(serial: u32, status: Status, payload: &[u8]) -> Message {
    Message::new(Header::stream(PROGRAM, VERSION, PROC, serial, status), payload)
}

#[test]
fn stream_download() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;

    let server = thread::spawn(move || {
        // Open call, then the data
        let open = peer.recv();
        assert_eq!(open.header.kind, MessageType::Call);
        assert_eq!(open.header.serial, serial);
        peer.reply(&open.header, Status::Ok, vec![]);

        peer.send(&frame(serial, Status::Continue, b"abc"));
        peer.send(&frame(serial, Status::Continue, b"de"));
        peer.send(&frame(serial, Status::Continue, b""));
        peer
    });

    client.send_with_reply(Message::new(stream.header(), vec![])).unwrap();

    assert_eq!(stream.recv(false).unwrap(), StreamRead::Data(b"abc".to_vec()));
    assert_eq!(stream.recv(false).unwrap(), StreamRead::Data(b"de".to_vec()));
    assert_eq!(stream.recv(false).unwrap(), StreamRead::Eof);
    assert!(stream.is_eof());

    // Finishing a stream the server already ended sends nothing
    stream.finish().unwrap();
    server.join().unwrap();
}

// Data arriving with nobody waiting is buffered.
#[test]
fn stream_buffered() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;

    peer.send(&frame(serial, Status::Continue, b"x"));
    peer.send(&frame(serial, Status::Continue, b"y"));

    // 1. Non-blocking reads drive the socket themselves
    let mut got = Vec::new();
    wait_until(|| match stream.recv(true).unwrap() {
        StreamRead::Data(d) => {
            got.extend(d);
            got.len() == 2
        }
        StreamRead::Empty => false,
        StreamRead::Eof => panic!("unexpected end of stream"),
    });
    assert_eq!(got, b"xy");
    assert_eq!(stream.recv(true).unwrap(), StreamRead::Empty);
    assert!(client.is_open());
}

#[test]
fn stream_upload() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;

    let server = thread::spawn(move || {
        for chunk in [&b"one"[..], b"two"] {
            let msg = peer.recv();
            assert_eq!(msg.header.kind, MessageType::Stream);
            assert_eq!(msg.header.status, Status::Continue);
            assert_eq!(msg.header.serial, serial);
            assert_eq!(msg.payload, chunk);
        }

        // Finish, acknowledged by the server
        let fin = peer.recv();
        assert_eq!(fin.header.status, Status::Ok);
        peer.send(&frame(serial, Status::Ok, b""));
        peer
    });

    stream.send(b"one".to_vec()).unwrap();
    stream.send(b"two".to_vec()).unwrap();
    stream.finish().unwrap();
    server.join().unwrap();
}

#[test]
fn stream_error() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;

    let reader = {
        thread::spawn(move || {
            let first = stream.recv(false);
            let second = stream.recv(false);
            (first, second)
        })
    };
    wait_until(|| client.pending_calls() == 1);

    peer.send(&frame(serial, Status::Continue, b"partial"));
    peer.send(&frame(serial, Status::Error, b"disk full"));

    let (first, second) = reader.join().unwrap();
    assert_eq!(first.unwrap(), StreamRead::Data(b"partial".to_vec()));
    match second {
        Err(Error::Remote(e)) => assert_eq!(e.payload, b"disk full"),
        r => panic!("unexpected {r:?}"),
    }
    assert!(client.is_open());
}

#[test]
fn stream_abort() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;

    let server = thread::spawn(move || {
        let abort = peer.recv();
        assert_eq!(abort.header.kind, MessageType::Stream);
        assert_eq!(abort.header.status, Status::Error);
        peer.send(&frame(serial, Status::Error, b""));
        peer
    });

    stream.abort().unwrap();
    server.join().unwrap();
}

#[test]
fn stream_dropped() {
    let (client, mut peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);
    let serial = stream.key().serial;
    drop(stream);

    // Frames for a dropped stream are ignored
    client.register_async_io().unwrap();
    peer.send(&frame(serial, Status::Continue, b"late"));
    thread::sleep(Duration::from_millis(50));
    assert!(client.is_open());
}

#[test]
fn stream_closed() {
    let (client, peer) = pair();
    let stream = client.open_stream(PROGRAM, VERSION, PROC);

    let reader = thread::spawn(move || stream.recv(false));
    wait_until(|| client.pending_calls() == 1);
    drop(peer);

    assert!(matches!(reader.join().unwrap(), Err(Error::Closed(_))));
}
