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

//! Thin wrappers over non-blocking socket syscalls.
//!
//! Listening sockets are built through `socket2` so reuse options can be set
//! before `bind`, then handed to `mio` for registration. Per-connection
//! options go straight through `setsockopt`.

use std::io::Result;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

const BACKLOG: i32 = 1024;

/// Creates a bound, listening, non-blocking socket.
///
/// Address reuse is always enabled so restarts do not trip over
/// `TIME_WAIT`; port reuse is opt-in and allows several acceptors to share
/// one port.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Enables or disables `SO_KEEPALIVE` on an accepted stream.
pub fn set_keepalive(stream: &TcpStream, on: bool) {
    let opt: libc::c_int = libc::c_int::from(on);
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(opt).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(fd = stream.as_raw_fd(), "couldn't set SO_KEEPALIVE");
    }
}

/// True when `err` is the `EMFILE` fd-exhaustion errno.
pub(crate) fn is_fd_exhaustion(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EMFILE)
}
