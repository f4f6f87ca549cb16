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

//! Event demultiplexer.
//!
//! Wraps the platform poller behind a single capability: wait up to a
//! timeout, come back with `(token, readiness)` pairs. It owns no callbacks;
//! readiness-to-callback translation lives in the channel dispatch.

use std::io::{ErrorKind, Result};
use std::time::Duration;

use mio::{Events, Poll, Token};

use super::channel::Ready;

const EVENT_CAPACITY: usize = 1024;

/// Edge-triggered demultiplexer over the platform poller.
#[derive(Debug)]
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Blocks up to `timeout` and appends ready `(token, mask)` pairs.
    ///
    /// Signal interruption is reported as an empty wait, not an error.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(Token, Ready)>,
    ) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        for event in self.events.iter() {
            ready.push((event.token(), Ready::from_event(event)));
        }
        Ok(())
    }
}
