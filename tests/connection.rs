//! Connection lifecycle and scheduling behaviour across worker reactors.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use snar::codec::LengthPrefixCodec;
use snar::{Reactor, ReactorHandle, TcpConnection, TcpServer};

fn spawn_reactor() -> (ReactorHandle, JoinHandle<()>) {
    let (tx, rx) = channel();
    let thread = std::thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor construction");
        tx.send(reactor.handle()).expect("publish handle");
        reactor.run();
    });
    (rx.recv().expect("reactor handle"), thread)
}

#[test]
fn force_close_after_drops_the_connection_on_schedule() {
    let (controller, thread) = spawn_reactor();
    let server = TcpServer::new(
        &controller,
        "127.0.0.1:0".parse().unwrap(),
        "delayed-close",
        false,
    )
    .unwrap();
    server.set_reactor_count(1);
    server.set_on_message(Arc::new(|conn, buf, _ts| {
        buf.consume_all();
        conn.force_close_after(Duration::from_millis(50));
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let start = Instant::now();
    client.write_all(b"bye").unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(45));

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn stop_read_pauses_message_delivery_until_start_read() {
    let (controller, thread) = spawn_reactor();
    let server = TcpServer::new(
        &controller,
        "127.0.0.1:0".parse().unwrap(),
        "paused",
        false,
    )
    .unwrap();
    server.set_reactor_count(1);
    let (conn_tx, conn_rx) = channel::<Arc<TcpConnection>>();
    server.set_on_connect(Arc::new(move |conn| {
        if conn.is_connected() {
            conn.stop_read();
            conn_tx.send(conn.clone()).unwrap();
        }
    }));
    let (msg_tx, msg_rx) = channel();
    server.set_on_message(Arc::new(move |_conn, buf, _ts| {
        msg_tx.send(buf.take_all_string()).unwrap();
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    client.write_all(b"ping").unwrap();

    assert_eq!(
        Err(RecvTimeoutError::Timeout),
        msg_rx.recv_timeout(Duration::from_millis(200)),
        "message delivered while reads were paused"
    );

    conn.start_read();
    assert_eq!(
        "ping",
        msg_rx.recv_timeout(Duration::from_secs(5)).unwrap()
    );

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn connections_are_dealt_round_robin_across_workers() {
    let (controller, thread) = spawn_reactor();
    let server = TcpServer::new(
        &controller,
        "127.0.0.1:0".parse().unwrap(),
        "rr",
        false,
    )
    .unwrap();
    server.set_reactor_count(2);
    let (tx, rx) = channel();
    server.set_on_connect(Arc::new(move |conn| {
        if conn.is_connected() {
            tx.send(std::thread::current().id()).unwrap();
        }
    }));
    server.start().unwrap();

    let _a = TcpStream::connect(server.local_addr()).unwrap();
    let _b = TcpStream::connect(server.local_addr()).unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(first, second, "both connections landed on one worker");

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn length_prefixed_frames_survive_the_socket() {
    let codec = LengthPrefixCodec::default();

    let (controller, thread) = spawn_reactor();
    let server = TcpServer::new(
        &controller,
        "127.0.0.1:0".parse().unwrap(),
        "framed",
        false,
    )
    .unwrap();
    server.set_reactor_count(1);
    server.set_on_message(Arc::new(move |conn, buf, _ts| loop {
        match codec.decode(buf) {
            Ok(Some(frame)) => codec.send(conn, &frame),
            Ok(None) => break,
            Err(_) => {
                conn.force_close();
                break;
            }
        }
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut wire = snar::Buffer::new();
    codec.encode(b"first", &mut wire);
    codec.encode(b"second", &mut wire);
    let bytes = wire.take_all();
    // Split mid-frame so the server sees a partial header or body.
    client.write_all(&bytes[..7]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(&bytes[7..]).unwrap();

    let mut echoed = vec![0; bytes.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(bytes, echoed);

    server.stop();
    controller.quit();
    thread.join().unwrap();
}
