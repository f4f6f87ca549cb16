// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.x server over the TCP listener server.
//!
//! Each connection carries an [`HttpContext`] in its context slot. Arriving
//! bytes feed the decoder; a completed request is handed to the application
//! callback as `(request, &mut response)`, the response is serialised into
//! the output buffer, and the keep-alive decision picks between leaving the
//! connection open and shutting it down. Undecodable input gets
//! `400 Bad Request` and a shutdown.

use std::fmt;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

use crate::buffer::Buffer;
use crate::reactor::{ReactorHandle, ReactorInit};
use crate::server::{TcpConnection, TcpServer};

use super::{HttpContext, HttpRequest, HttpResponse, Status, Version};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Application request handler: fill in `response` for `request`.
pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

/// An HTTP/1.x server.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use snar::http::{HttpServer, Status};
/// # use snar::Reactor;
/// # fn main() -> std::io::Result<()> {
/// let mut reactor = Reactor::new()?;
/// let server = HttpServer::new(
///     &reactor.handle(),
///     "127.0.0.1:8080".parse().unwrap(),
///     "hello",
///     false,
/// )?;
/// server.set_http_callback(Arc::new(|_request, response| {
///     response.set_status(Status::Ok);
///     response.set_content_type("text/plain");
///     response.set_body("hello\n");
/// }));
/// server.set_reactor_count(4);
/// server.start()?;
/// reactor.run();
/// # Ok(())
/// # }
/// ```
pub struct HttpServer {
    server: Arc<TcpServer>,
    callback: Arc<Mutex<HttpCallback>>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Binds an HTTP server on `addr`; answers 404 until a callback is set.
    pub fn new(
        controller: &ReactorHandle,
        addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<Self> {
        let server = TcpServer::new(controller, addr, name, reuse_port)?;
        let callback: Arc<Mutex<HttpCallback>> =
            Arc::new(Mutex::new(Arc::new(default_http_callback)));

        server.set_on_connect(Arc::new(|conn| {
            if conn.is_connected() {
                conn.set_context(HttpContext::new());
            }
        }));
        let cb = callback.clone();
        server.set_on_message(Arc::new(move |conn, buf, ts| {
            let callback = cb.lock().unwrap().clone();
            on_message(&callback, conn, buf, ts);
        }));

        Ok(Self { server, callback })
    }

    /// Replaces the request handler.
    pub fn set_http_callback(&self, callback: HttpCallback) {
        *self.callback.lock().unwrap() = callback;
    }

    /// Number of worker reactors; see [`TcpServer::set_reactor_count`].
    pub fn set_reactor_count(&self, count: usize) {
        self.server.set_reactor_count(count);
    }

    /// Per-worker init callback; see [`TcpServer::set_reactor_init`].
    pub fn set_reactor_init(&self, init: ReactorInit) {
        self.server.set_reactor_init(init);
    }

    /// Starts serving. Idempotent.
    pub fn start(&self) -> Result<()> {
        self.server.start()
    }

    /// Stops accepting and joins the workers.
    pub fn stop(&self) {
        self.server.stop();
    }

    /// Actual listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// The underlying TCP server.
    pub fn tcp_server(&self) -> &Arc<TcpServer> {
        &self.server
    }
}

/// 404 for everything, closing the connection.
fn default_http_callback(_request: &HttpRequest, response: &mut HttpResponse) {
    response.set_status(Status::NotFound);
    response.set_close_connection(true);
}

fn on_message(callback: &HttpCallback, conn: &Arc<TcpConnection>, buf: &mut Buffer, ts: Instant) {
    conn.with_context(|slot| {
        let Some(ctx) = slot.as_mut().and_then(|any| any.downcast_mut::<HttpContext>()) else {
            warn!(conn = %conn.name(), "connection without http context");
            conn.shutdown();
            return;
        };
        if let Err(err) = ctx.parse(buf, ts) {
            warn!(conn = %conn.name(), %err, "bad request");
            conn.send(BAD_REQUEST);
            conn.shutdown();
            return;
        }
        if ctx.is_done() {
            on_request(callback, conn, ctx.request());
            ctx.reset();
        }
    });
}

fn on_request(callback: &HttpCallback, conn: &Arc<TcpConnection>, request: &HttpRequest) {
    // HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    let connection = request.header("Connection");
    let close = connection.is_some_and(|value| value.eq_ignore_ascii_case("close"))
        || (request.version() == Some(Version::H1_0)
            && !connection.is_some_and(|value| value.eq_ignore_ascii_case("keep-alive")));

    let mut response = HttpResponse::new(close);
    callback(request, &mut response);

    let mut out = Buffer::new();
    response.append_to(&mut out);
    conn.send_buffer(&mut out);
    if response.close_connection() {
        conn.shutdown();
    }
}
