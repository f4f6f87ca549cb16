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

//! Per-connection state machine.
//!
//! A [`TcpConnection`] couples a non-blocking stream with a channel on its
//! owner worker reactor and two buffers: reads land in the input buffer
//! before the message callback sees them, writes drain from the output
//! buffer whenever the stream accepts more.
//!
//! ```text
//!  Connecting --established()--> Connected --shutdown()--> Disconnecting
//!      |                             |                          |
//!      |                       force_close()              output drained
//!      |                             v                          v
//!      +----------------------> Disconnected <-----------------+
//! ```
//!
//! Strong ownership lives in the server's connection map; the reactor's
//! channel table holds only a weak handler reference, and destruction is
//! posted as a task on the owner reactor after map removal, so no in-flight
//! callback can observe a dangling connection.
//!
//! Every method suffixed `_in_reactor` (and every event callback) runs on
//! the owner reactor's thread; the public entry points forward there.

use std::any::Any;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::reactor::{Channel, EventHandler, ReactorHandle, Ready};

/// Output-buffer size at which the application is told to slow down.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Fired when a connection is established and again when it goes down;
/// distinguish with [`TcpConnection::is_connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired with the input buffer whenever bytes arrive; the callback consumes
/// what it can and leaves the rest buffered.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;

/// Fired once the output buffer has fully drained to the socket.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired when the output buffer crosses the high-water mark upward, with its
/// size at that moment.
pub type HighWaterCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal hook back to the owning server's connection map.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Callback bundle handed to every new connection by its server.
pub(crate) struct ConnectionHooks {
    pub(crate) on_connect: ConnectionCallback,
    pub(crate) on_message: MessageCallback,
    pub(crate) on_write_complete: Option<WriteCompleteCallback>,
    pub(crate) on_high_water: Option<HighWaterCallback>,
    pub(crate) close_hook: CloseCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnState {
    fn name(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Disconnected => "Disconnected",
        }
    }
}

struct Inner {
    stream: TcpStream,
    channel: Channel,
    state: ConnState,
    reading: bool,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
}

/// One accepted TCP connection, owned by a single worker reactor.
pub struct TcpConnection {
    weak_self: Weak<TcpConnection>,
    reactor: ReactorHandle,
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    hooks: ConnectionHooks,
    inner: Mutex<Inner>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state().name())
            .finish_non_exhaustive()
    }
}

impl TcpConnection {
    pub(crate) fn new(
        reactor: ReactorHandle,
        name: String,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        hooks: ConnectionHooks,
        high_water_mark: usize,
    ) -> Arc<Self> {
        debug!(name = %name, %peer_addr, "connection created");
        let channel = Channel::new(reactor.clone());
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            reactor,
            name,
            local_addr,
            peer_addr,
            hooks,
            inner: Mutex::new(Inner {
                stream,
                channel,
                state: ConnState::Connecting,
                reading: true,
                input: Buffer::new(),
                output: Buffer::new(),
                high_water_mark,
            }),
            context: Mutex::new(None),
        })
    }

    /// Name the owning server registered this connection under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local address of the accepted socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address of the accepted socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Owner reactor of this connection.
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// True between `established` and the close path.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Enables or disables Nagle's algorithm on the socket.
    pub fn set_tcp_nodelay(&self, on: bool) {
        let inner = self.inner.lock().unwrap();
        if let Err(err) = inner.stream.set_nodelay(on) {
            warn!(conn = %self.name, %err, "couldn't set TCP_NODELAY");
        }
    }

    /// Replaces the output-buffer size that triggers the high-water callback.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.inner.lock().unwrap().high_water_mark = mark;
    }

    /// Stores an application payload on the connection, replacing any
    /// previous one.
    pub fn set_context<T: Any + Send>(&self, context: T) {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    /// Grants access to the application payload slot.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.context.lock().unwrap())
    }

    /// Sends bytes to the peer.
    ///
    /// On the owner thread the bytes go straight to the socket (or output
    /// buffer); from any other thread a copy rides a task to the owner
    /// reactor, so concurrent senders are serialised in task order.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.reactor.is_in_reactor_thread() {
            self.send_in_reactor(data);
        } else {
            let Some(conn) = self.weak_self.upgrade() else {
                return;
            };
            let owned = data.to_vec();
            self.reactor.run_in_reactor(move || conn.send_in_reactor(&owned));
        }
    }

    /// Sends the readable region of `buf` and consumes it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.reactor.is_in_reactor_thread() {
            self.send_in_reactor(buf.peek());
            buf.consume_all();
        } else {
            let Some(conn) = self.weak_self.upgrade() else {
                return;
            };
            let owned = buf.take_all();
            self.reactor.run_in_reactor(move || conn.send_in_reactor(&owned));
        }
    }

    /// Closes the write half once the output buffer has drained.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::Connected {
                return;
            }
            inner.state = ConnState::Disconnecting;
        }
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        self.reactor.run_in_reactor(move || conn.shutdown_in_reactor());
    }

    /// Drops the connection without waiting for pending output.
    pub fn force_close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::Connected && inner.state != ConnState::Disconnecting {
                return;
            }
            inner.state = ConnState::Disconnecting;
        }
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        self.reactor.enqueue(move || conn.close_in_reactor());
    }

    /// Like [`force_close`](Self::force_close), delayed by `delay`.
    ///
    /// The timer holds only a weak reference, so a connection that closes by
    /// itself in the meantime is not kept alive for the kill shot.
    pub fn force_close_after(&self, delay: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::Connected && inner.state != ConnState::Disconnecting {
                return;
            }
            inner.state = ConnState::Disconnecting;
        }
        let weak = self.weak_self.clone();
        self.reactor.run_after(delay, move || {
            if let Some(conn) = weak.upgrade() {
                conn.force_close();
            }
        });
    }

    /// Re-enables read interest after [`stop_read`](Self::stop_read).
    pub fn start_read(&self) {
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        self.reactor.run_in_reactor(move || conn.set_reading_in_reactor(true));
    }

    /// Pauses read interest, applying backpressure to the peer.
    pub fn stop_read(&self) {
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        self.reactor.run_in_reactor(move || conn.set_reading_in_reactor(false));
    }

    /// Registers the channel and fires the connect callback. Runs on the
    /// owner reactor, at most once.
    pub(crate) fn established(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Connecting {
            return;
        }
        inner.state = ConnState::Connected;
        let weak: Weak<dyn EventHandler> = self.weak_self.clone();
        let token = self.reactor.attach(weak);
        let Inner { stream, channel, .. } = &mut *inner;
        if let Err(err) = channel.register(stream, token, Ready::READABLE) {
            error!(conn = %self.name, %err, "couldn't register connection channel");
            drop(inner);
            self.close_in_reactor();
            return;
        }
        drop(inner);
        trace!(conn = %self.name, "connection established");
        if let Some(conn) = self.weak_self.upgrade() {
            (self.hooks.on_connect)(&conn);
        }
    }

    /// Final teardown, posted to the owner reactor after map removal.
    pub(crate) fn connect_destroyed(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        // Server shutdown can get here without the close path having run.
        if inner.state == ConnState::Connected {
            inner.state = ConnState::Disconnected;
            let Inner { stream, channel, .. } = &mut *inner;
            let _ = channel.set_interest(stream, Ready::empty());
            drop(inner);
            if let Some(conn) = self.weak_self.upgrade() {
                (self.hooks.on_connect)(&conn);
            }
            inner = self.inner.lock().unwrap();
        }
        let Inner { stream, channel, .. } = &mut *inner;
        if let Err(err) = channel.remove(stream) {
            warn!(conn = %self.name, %err, "couldn't remove connection channel");
        }
        debug!(conn = %self.name, "connection destroyed");
    }

    fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    fn send_in_reactor(&self, data: &[u8]) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Disconnected {
            warn!(conn = %self.name, "disconnected, giving up writing");
            return;
        }

        let mut nwrote = 0;
        let mut fault = false;
        let mut write_complete = false;
        let mut high_water = None;

        // Direct write only when nothing is queued, to keep bytes ordered.
        if !inner.channel.is_writing() && inner.output.readable_bytes() == 0 {
            match inner.stream.write(data) {
                Ok(n) => {
                    nwrote = n;
                    write_complete = n == data.len();
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    error!(conn = %self.name, %err, "connection write failed");
                    if matches!(
                        err.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault && remaining > 0 {
            let old_len = inner.output.readable_bytes();
            if old_len + remaining >= inner.high_water_mark && old_len < inner.high_water_mark {
                high_water = Some(old_len + remaining);
            }
            inner.output.append(&data[nwrote..]);
            if !inner.channel.is_writing() {
                let want = if inner.reading {
                    Ready::READABLE | Ready::WRITABLE
                } else {
                    Ready::WRITABLE
                };
                let Inner { stream, channel, .. } = &mut *inner;
                if let Err(err) = channel.set_interest(stream, want) {
                    error!(conn = %self.name, %err, "couldn't enable write interest");
                }
            }
        }
        drop(inner);

        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        if write_complete {
            if let Some(callback) = &self.hooks.on_write_complete {
                let callback = callback.clone();
                self.reactor.enqueue(move || callback(&conn));
            }
        } else if let Some(size) = high_water {
            if let Some(callback) = &self.hooks.on_high_water {
                let callback = callback.clone();
                self.reactor.enqueue(move || callback(&conn, size));
            }
        }
    }

    fn shutdown_in_reactor(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let inner = self.inner.lock().unwrap();
        if !inner.channel.is_writing() {
            if let Err(err) = inner.stream.shutdown(Shutdown::Write) {
                if err.kind() != ErrorKind::NotConnected {
                    warn!(conn = %self.name, %err, "couldn't shut down write half");
                }
            }
        }
    }

    fn set_reading_in_reactor(&self, on: bool) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if inner.reading == on || inner.state != ConnState::Connected {
            return;
        }
        inner.reading = on;
        let mut want = if on { Ready::READABLE } else { Ready::empty() };
        if inner.channel.is_writing() {
            want |= Ready::WRITABLE;
        }
        let Inner { stream, channel, .. } = &mut *inner;
        if let Err(err) = channel.set_interest(stream, want) {
            error!(conn = %self.name, %err, "couldn't update read interest");
        }
    }

    /// The close path: disable interest, announce the drop, hand the
    /// connection back to the server. Runs at most once.
    fn close_in_reactor(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Connected && inner.state != ConnState::Disconnecting {
            return;
        }
        trace!(conn = %self.name, state = inner.state.name(), "closing");
        inner.state = ConnState::Disconnected;
        let Inner { stream, channel, .. } = &mut *inner;
        if let Err(err) = channel.set_interest(stream, Ready::empty()) {
            warn!(conn = %self.name, %err, "couldn't disable channel interest");
        }
        drop(inner);

        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        (self.hooks.on_connect)(&conn);
        // Must be last: the server schedules destruction from here.
        (self.hooks.close_hook)(&conn);
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(&self, ts: Instant) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Disconnected {
            return;
        }

        let mut total = 0;
        let mut peer_closed = false;
        let mut fatal = None;
        {
            let Inner { stream, input, .. } = &mut *inner;
            // Edge-triggered readiness: drain until the socket would block.
            loop {
                match input.fill_from(stream) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => total += n,
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }
        }

        if total > 0 {
            let mut input = std::mem::take(&mut inner.input);
            drop(inner);
            let Some(conn) = self.weak_self.upgrade() else {
                return;
            };
            (self.hooks.on_message)(&conn, &mut input, ts);
            self.inner.lock().unwrap().input = input;
        } else {
            drop(inner);
        }

        if let Some(err) = fatal {
            error!(conn = %self.name, %err, "connection read failed");
            self.handle_error();
            self.close_in_reactor();
        } else if peer_closed {
            self.close_in_reactor();
        }
    }

    fn handle_write(&self) {
        debug_assert!(self.reactor.is_in_reactor_thread());
        let mut inner = self.inner.lock().unwrap();
        if !inner.channel.is_writing() {
            trace!(conn = %self.name, "connection is down, no more writing");
            return;
        }

        let mut drained = false;
        {
            let Inner {
                stream,
                channel,
                state,
                reading,
                output,
                ..
            } = &mut *inner;
            while output.readable_bytes() > 0 {
                match stream.write(output.peek()) {
                    Ok(0) => break,
                    Ok(n) => output.consume(n),
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => {
                        error!(conn = %self.name, %err, "connection write failed");
                        break;
                    }
                }
            }
            if output.readable_bytes() == 0 {
                drained = true;
                let want = if *reading {
                    Ready::READABLE
                } else {
                    Ready::empty()
                };
                if let Err(err) = channel.set_interest(stream, want) {
                    error!(conn = %self.name, %err, "couldn't disable write interest");
                }
                if *state == ConnState::Disconnecting {
                    if let Err(err) = stream.shutdown(Shutdown::Write) {
                        if err.kind() != ErrorKind::NotConnected {
                            warn!(conn = %self.name, %err, "couldn't shut down write half");
                        }
                    }
                }
            }
        }
        drop(inner);

        if drained {
            if let Some(callback) = &self.hooks.on_write_complete {
                let Some(conn) = self.weak_self.upgrade() else {
                    return;
                };
                let callback = callback.clone();
                self.reactor.enqueue(move || callback(&conn));
            }
        }
    }

    fn handle_close(&self) {
        self.close_in_reactor();
    }

    fn handle_error(&self) {
        let err = self.inner.lock().unwrap().stream.take_error();
        match err {
            Ok(Some(err)) => error!(conn = %self.name, %err, "socket error"),
            Ok(None) => error!(conn = %self.name, "error event without socket error"),
            Err(err) => error!(conn = %self.name, %err, "couldn't read socket error"),
        }
    }
}

/// Default connect callback: logs the connection going up or down.
pub fn default_on_connect(conn: &Arc<TcpConnection>) {
    debug!(
        local = %conn.local_addr(),
        peer = %conn.peer_addr(),
        up = conn.is_connected(),
        "connection state"
    );
}

/// Default message callback: discards whatever arrived.
pub fn default_on_message(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _ts: Instant) {
    buf.consume_all();
}
