//! HTTP server behaviour against real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use snar::http::{HttpServer, Status};
use snar::{Reactor, ReactorHandle};

fn spawn_reactor() -> (ReactorHandle, JoinHandle<()>) {
    let (tx, rx) = channel();
    let thread = std::thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor construction");
        tx.send(reactor.handle()).expect("publish handle");
        reactor.run();
    });
    (rx.recv().expect("reactor handle"), thread)
}

fn hello_server(controller: &ReactorHandle) -> HttpServer {
    let server = HttpServer::new(
        controller,
        "127.0.0.1:0".parse().unwrap(),
        "http-test",
        false,
    )
    .expect("bind");
    server.set_reactor_count(1);
    server.set_http_callback(Arc::new(|request, response| {
        response.set_status(Status::Ok);
        response.set_content_type("text/plain");
        response.set_body(format!("path={}", request.path()));
    }));
    server
}

fn read_until_eof(stream: &mut TcpStream) -> String {
    let mut out = String::new();
    stream.read_to_string(&mut out).expect("read");
    out
}

#[test]
fn keep_alive_connection_serves_consecutive_requests() {
    let (controller, thread) = spawn_reactor();
    let server = hello_server(&controller);
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for path in ["/x", "/y"] {
        client
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: h\r\n\r\n").as_bytes())
            .unwrap();
        let expected = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: Keep-Alive\r\n\
             Content-Type: text/plain\r\n\r\npath={path}"
        );
        let mut body = vec![0; expected.len()];
        client.read_exact(&mut body).unwrap();
        assert_eq!(expected, String::from_utf8(body).unwrap());
    }

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn http_1_0_without_keep_alive_closes_after_the_response() {
    let (controller, thread) = spawn_reactor();
    let server = hello_server(&controller);
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
        .write_all(b"GET /old HTTP/1.0\r\nHost: h\r\n\r\n")
        .unwrap();

    let response = read_until_eof(&mut client);
    assert_eq!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\npath=/old",
        response
    );

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn bad_version_gets_400_and_a_shutdown() {
    let (controller, thread) = spawn_reactor();
    let server = hello_server(&controller);
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"GET /x HTTP/9.9\r\n\r\n").unwrap();

    let response = read_until_eof(&mut client);
    assert_eq!("HTTP/1.1 400 Bad Request\r\n\r\n", response);

    server.stop();
    controller.quit();
    thread.join().unwrap();
}

#[test]
fn post_body_reaches_the_callback() {
    let (controller, thread) = spawn_reactor();
    let server = HttpServer::new(
        &controller,
        "127.0.0.1:0".parse().unwrap(),
        "http-post",
        false,
    )
    .unwrap();
    server.set_reactor_count(1);
    server.set_http_callback(Arc::new(|request, response| {
        response.set_status(Status::Ok);
        response.set_body(request.body().to_vec());
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
        .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world")
        .unwrap();

    let expected = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: Keep-Alive\r\n\r\nhello world";
    let mut body = vec![0; expected.len()];
    client.read_exact(&mut body).unwrap();
    assert_eq!(expected, String::from_utf8(body).unwrap());

    server.stop();
    controller.quit();
    thread.join().unwrap();
}
