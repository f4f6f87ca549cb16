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

//! Listener server: acceptor + worker pool + connection map.
//!
//! The server runs its acceptor on the controller reactor and deals each
//! accepted connection out to the worker pool round-robin. The connection
//! map is the single strong owner of every live connection and is mutated
//! only on the controller reactor; removal posts destruction back to the
//! connection's worker so teardown never races a callback.

use std::collections::HashMap;
use std::fmt;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::net::TcpStream;
use tracing::{info, warn};

use crate::net::socket;
use crate::reactor::{ReactorHandle, ReactorInit, ReactorPool};

use super::acceptor::Acceptor;
use super::connection::{
    default_on_connect, default_on_message, ConnectionCallback, ConnectionHooks,
    HighWaterCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
    DEFAULT_HIGH_WATER_MARK,
};

/// A TCP server embedding applications drive purely through callbacks.
///
/// Configure with the `set_*` methods before [`start`](Self::start); the
/// callbacks in effect when a connection is accepted stay with it for its
/// whole life.
pub struct TcpServer {
    weak_self: Weak<TcpServer>,
    controller: ReactorHandle,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<ReactorPool>,
    reactor_count: AtomicU64,
    reactor_init: Mutex<Option<ReactorInit>>,
    on_connect: Mutex<ConnectionCallback>,
    on_message: Mutex<MessageCallback>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_high_water: Mutex<Option<(HighWaterCallback, usize)>>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Binds the listening socket on the controller reactor.
    ///
    /// Failing to bind is fatal at startup and surfaces here; nothing is
    /// accepted until [`start`](Self::start).
    pub fn new(
        controller: &ReactorHandle,
        addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<Arc<Self>> {
        let acceptor = Acceptor::new(controller, addr, reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();
        Ok(Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            controller: controller.clone(),
            name: name.to_owned(),
            ip_port,
            acceptor,
            pool: Mutex::new(ReactorPool::new(controller.clone(), name)),
            reactor_count: AtomicU64::new(0),
            reactor_init: Mutex::new(None),
            on_connect: Mutex::new(Arc::new(default_on_connect)),
            on_message: Mutex::new(Arc::new(default_on_message)),
            on_write_complete: Mutex::new(None),
            on_high_water: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        }))
    }

    /// Server name, used as the prefix of every connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound listening address, formatted `ip:port`.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Actual listening address (useful after binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Number of worker reactors to start. Zero keeps all connections on
    /// the controller reactor. Must be called before `start`.
    pub fn set_reactor_count(&self, count: usize) {
        self.reactor_count.store(count as u64, Ordering::SeqCst);
    }

    /// Callback run on each worker thread right after its reactor exists.
    pub fn set_reactor_init(&self, init: ReactorInit) {
        *self.reactor_init.lock().unwrap() = Some(init);
    }

    /// Connection up/down callback.
    pub fn set_on_connect(&self, callback: ConnectionCallback) {
        *self.on_connect.lock().unwrap() = callback;
    }

    /// Message callback, fired with the connection's input buffer.
    pub fn set_on_message(&self, callback: MessageCallback) {
        *self.on_message.lock().unwrap() = callback;
    }

    /// Output-buffer-drained callback.
    pub fn set_on_write_complete(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.lock().unwrap() = Some(callback);
    }

    /// Backpressure callback plus the output-buffer size that triggers it.
    pub fn set_on_high_water(&self, callback: HighWaterCallback, mark: usize) {
        *self.on_high_water.lock().unwrap() = Some((callback, mark));
    }

    /// Starts the worker pool and begins accepting. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(server = %self.name, addr = %self.ip_port, "starting");

        let count = self.reactor_count.load(Ordering::SeqCst) as usize;
        let init = self.reactor_init.lock().unwrap().clone();
        self.pool.lock().unwrap().start(count, init)?;

        let server = self.weak_self.clone();
        self.acceptor.set_on_accept(Box::new(move |stream, peer| {
            if let Some(server) = server.upgrade() {
                server.new_connection(stream, peer);
            }
        }));

        let acceptor = self.acceptor.clone();
        self.controller.run_in_reactor(move || acceptor.listen());
        Ok(())
    }

    /// Stops accepting and joins the worker reactors.
    ///
    /// Handles to stopped workers must not be used for new work; live
    /// connections are torn down with their reactors.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.name, "stopping");
        let acceptor = self.acceptor.clone();
        self.controller.run_in_reactor(move || acceptor.close());
        self.pool.lock().unwrap().stop();
    }

    /// Number of live connections in the map.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Accept handler; runs on the controller reactor.
    fn new_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(%err, "dropping accepted socket without local address");
                return;
            }
        };
        socket::set_keepalive(&stream, true);

        let worker = self.pool.lock().unwrap().next();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(conn = %name, %peer_addr, "new connection");

        let server = self.weak_self.clone();
        let hooks = ConnectionHooks {
            on_connect: self.on_connect.lock().unwrap().clone(),
            on_message: self.on_message.lock().unwrap().clone(),
            on_write_complete: self.on_write_complete.lock().unwrap().clone(),
            on_high_water: self
                .on_high_water
                .lock()
                .unwrap()
                .as_ref()
                .map(|(callback, _)| callback.clone()),
            close_hook: Arc::new(move |conn| {
                if let Some(server) = server.upgrade() {
                    server.remove_connection(conn);
                }
            }),
        };
        let high_water_mark = self
            .on_high_water
            .lock()
            .unwrap()
            .as_ref()
            .map_or(DEFAULT_HIGH_WATER_MARK, |&(_, mark)| mark);

        let conn = TcpConnection::new(
            worker.clone(),
            name.clone(),
            stream,
            local_addr,
            peer_addr,
            hooks,
            high_water_mark,
        );
        self.connections.lock().unwrap().insert(name, conn.clone());
        worker.run_in_reactor(move || conn.established());
    }

    /// Close hook target: erase from the map on the controller reactor,
    /// then post destruction on the connection's worker.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let Some(server) = self.weak_self.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.controller.run_in_reactor(move || {
            info!(conn = %conn.name(), "removing connection");
            server.connections.lock().unwrap().remove(conn.name());
            let worker = conn.reactor().clone();
            let conn = conn.clone();
            worker.enqueue(move || conn.connect_destroyed());
        });
    }
}
