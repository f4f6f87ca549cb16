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

//! Channel: the binding of one event source to one reactor.
//!
//! A [`Channel`] records the token and interest set under which a source
//! (connection stream, listener) is registered with its owner reactor's
//! demultiplexer. The reactor itself only keeps a weak handle to the
//! [`EventHandler`] behind the token; dispatch probes liveness first, so a
//! handler destroyed by an earlier callback in the same poll wave is simply
//! skipped.

use std::io::Result;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use mio::event::{Event, Source};
use mio::{Interest, Token};

use super::ReactorHandle;

bitflags! {
    /// Readiness and interest bits, a poller-independent subset of what the
    /// demultiplexer reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        /// Source has bytes to read (or a half-close to observe).
        const READABLE = 0b0001;
        /// Source can accept writes.
        const WRITABLE = 0b0010;
        /// Source is in an error state.
        const ERROR = 0b0100;
        /// Both directions were shut down by the peer.
        const HUP = 0b1000;
    }
}

impl Ready {
    /// Translates one demultiplexer event into readiness bits.
    pub(crate) fn from_event(event: &Event) -> Self {
        let mut ready = Self::empty();
        if event.is_readable() || event.is_read_closed() {
            ready |= Self::READABLE;
        }
        if event.is_writable() {
            ready |= Self::WRITABLE;
        }
        if event.is_error() {
            ready |= Self::ERROR;
        }
        if event.is_read_closed() && event.is_write_closed() {
            ready |= Self::HUP;
        }
        ready
    }

    fn interest(self) -> Option<Interest> {
        match (self.contains(Self::READABLE), self.contains(Self::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Per-source event callbacks, dispatched on the owner reactor's thread.
pub trait EventHandler: Send + Sync {
    /// The source became readable; `ts` is the demultiplexer return time.
    fn handle_read(&self, ts: Instant);

    /// The source became writable.
    fn handle_write(&self) {}

    /// The peer hung up without readable data left.
    fn handle_close(&self) {}

    /// The source reported an error condition.
    fn handle_error(&self) {}
}

/// Fires one handler callback per ready bit.
///
/// Close goes first so a hangup without readable bytes is not misread as a
/// fresh empty message, then error, read, write.
pub(crate) fn dispatch(handler: &Arc<dyn EventHandler>, ready: Ready, ts: Instant) {
    if ready.contains(Ready::HUP) && !ready.contains(Ready::READABLE) {
        handler.handle_close();
    }
    if ready.contains(Ready::ERROR) {
        handler.handle_error();
    }
    if ready.contains(Ready::READABLE) {
        handler.handle_read(ts);
    }
    if ready.contains(Ready::WRITABLE) {
        handler.handle_write();
    }
}

/// Registration lifecycle of a channel within its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    New,
    Registered,
    Removed,
}

/// Binding of one source and interest set to one reactor.
///
/// Owned by the object whose source it registers; interest changes route
/// through the owner reactor's registry and must happen on its thread.
#[derive(Debug)]
pub struct Channel {
    reactor: ReactorHandle,
    token: Option<Token>,
    interest: Ready,
    state: ChannelState,
    in_poller: bool,
}

impl Channel {
    /// Creates an unregistered channel owned by `reactor`.
    pub fn new(reactor: ReactorHandle) -> Self {
        Self {
            reactor,
            token: None,
            interest: Ready::empty(),
            state: ChannelState::New,
            in_poller: false,
        }
    }

    /// Registers `source` with the owner reactor under `token`.
    pub fn register<S: Source>(&mut self, source: &mut S, token: Token, interest: Ready) -> Result<()> {
        debug_assert_eq!(ChannelState::New, self.state);
        self.token = Some(token);
        self.state = ChannelState::Registered;
        self.set_interest(source, interest)
    }

    /// Updates the interest set, registering with or withdrawing from the
    /// demultiplexer as needed.
    pub fn set_interest<S: Source>(&mut self, source: &mut S, interest: Ready) -> Result<()> {
        debug_assert_eq!(ChannelState::Registered, self.state);
        let token = self.token.expect("channel registered without token");
        let registry = self.reactor.registry();
        match (self.in_poller, interest.interest()) {
            (false, Some(want)) => {
                registry.register(source, token, want)?;
                self.in_poller = true;
            }
            (true, Some(want)) => registry.reregister(source, token, want)?,
            (true, None) => {
                registry.deregister(source)?;
                self.in_poller = false;
            }
            (false, None) => {}
        }
        self.interest = interest;
        Ok(())
    }

    /// Withdraws the source from the demultiplexer and detaches the handler
    /// from the owner reactor. Must precede destruction of the source.
    pub fn remove<S: Source>(&mut self, source: &mut S) -> Result<()> {
        if self.in_poller {
            self.reactor.registry().deregister(source)?;
            self.in_poller = false;
        }
        if let Some(token) = self.token.take() {
            self.reactor.detach(token);
        }
        self.interest = Ready::empty();
        self.state = ChannelState::Removed;
        Ok(())
    }

    /// True while read interest is set.
    pub fn is_reading(&self) -> bool {
        self.interest.contains(Ready::READABLE)
    }

    /// True while write interest is set.
    pub fn is_writing(&self) -> bool {
        self.interest.contains(Ready::WRITABLE)
    }

    /// Token this channel is registered under, if any.
    pub fn token(&self) -> Option<Token> {
        self.token
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn empty_ready_maps_to_no_interest() {
        assert_eq!(None, Ready::empty().interest());
        assert!(Ready::READABLE.interest().unwrap().is_readable());
        let both = (Ready::READABLE | Ready::WRITABLE).interest().unwrap();
        assert!(both.is_readable() && both.is_writable());
    }
}
