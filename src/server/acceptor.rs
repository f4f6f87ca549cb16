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

//! Accepting side of a listener server.
//!
//! The acceptor owns the listening socket and a read-interested channel on
//! the controller reactor. Its read callback drains `accept` until the
//! socket would block, handing each new stream to the server.
//!
//! Fd exhaustion gets the idle-fd treatment: a spare fd to `/dev/null` is
//! held from construction; on `EMFILE` it is closed, the pending connection
//! is accepted and immediately dropped, and the spare is re-opened. Without
//! this the readable listener would spin forever on a full fd table.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::net::socket;
use crate::reactor::{Channel, EventHandler, ReactorHandle, Ready};

const IDLE_FD_PATH: &str = "/dev/null";

/// Callback invoked with each accepted stream and its peer address.
pub(crate) type AcceptCallback = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

struct AcceptorInner {
    listener: TcpListener,
    channel: Channel,
    idle_fd: Option<File>,
}

/// Listening channel on the controller reactor.
pub(crate) struct Acceptor {
    weak_self: Weak<Acceptor>,
    reactor: ReactorHandle,
    local_addr: SocketAddr,
    listening: AtomicBool,
    on_accept: Mutex<Option<AcceptCallback>>,
    inner: Mutex<AcceptorInner>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Binds a listening socket; does not yet register for events.
    pub(crate) fn new(
        reactor: &ReactorHandle,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Self>> {
        let listener = socket::bind_listener(addr, reuse_port)?;
        let local_addr = listener.local_addr()?;
        let idle_fd = File::open(IDLE_FD_PATH)?;
        Ok(Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            reactor: reactor.clone(),
            local_addr,
            listening: AtomicBool::new(false),
            on_accept: Mutex::new(None),
            inner: Mutex::new(AcceptorInner {
                listener,
                channel: Channel::new(reactor.clone()),
                idle_fd: Some(idle_fd),
            }),
        }))
    }

    pub(crate) fn set_on_accept(&self, callback: AcceptCallback) {
        *self.on_accept.lock().unwrap() = Some(callback);
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers the listening channel read-interested. Controller-reactor
    /// thread only; at most once.
    pub(crate) fn listen(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<dyn EventHandler> = self.weak_self.clone();
        let token = self.reactor.attach(weak);
        let mut inner = self.inner.lock().unwrap();
        let AcceptorInner { listener, channel, .. } = &mut *inner;
        if let Err(err) = channel.register(listener, token, Ready::READABLE) {
            error!(%err, "couldn't register listening channel");
            return;
        }
        info!(addr = %self.local_addr, "listening");
    }

    /// Deregisters the listening channel. Controller-reactor thread only.
    pub(crate) fn close(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let AcceptorInner { listener, channel, .. } = &mut *inner;
        if let Err(err) = channel.remove(listener) {
            warn!(%err, "couldn't deregister listening channel");
        }
    }

    fn drain_exhausted_fd(&self, inner: &mut AcceptorInner) {
        inner.idle_fd.take();
        match inner.listener.accept() {
            Ok((stream, peer)) => {
                warn!(%peer, "out of file descriptors, dropping connection");
                drop(stream);
            }
            Err(err) => warn!(%err, "accept retry during fd exhaustion"),
        }
        match File::open(IDLE_FD_PATH) {
            Ok(file) => inner.idle_fd = Some(file),
            Err(err) => error!(%err, "couldn't re-open idle fd"),
        }
    }
}

impl EventHandler for Acceptor {
    fn handle_read(&self, _ts: Instant) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.listener.accept() {
                Ok((stream, peer)) => {
                    let mut on_accept = self.on_accept.lock().unwrap();
                    match on_accept.as_mut() {
                        Some(callback) => callback(stream, peer),
                        None => drop(stream),
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if socket::is_fd_exhaustion(&err) => {
                    error!("accept: process out of file descriptors");
                    self.drain_exhausted_fd(&mut inner);
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_error(&self) {
        error!(addr = %self.local_addr, "error event on listening channel");
    }
}
