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

//! Reactor: one event loop on one thread.
//!
//! A [`Reactor`] owns a demultiplexer, a timer set, a channel table and a
//! pending-task queue, and is bound to the thread that constructed it. All
//! channel, connection and timer state it manages is touched only from that
//! thread; the pending-task queue is the single cross-thread hand-off, and a
//! wakeup registered in the demultiplexer makes newly enqueued tasks
//! observable even while the loop is blocked waiting.
//!
//! Each iteration waits in the demultiplexer (bounded by the head timer
//! deadline and [`POLL_TIMEOUT`]), dispatches ready channels, fires due
//! timers in `(deadline, id)` order, then swap-drains the task queue so a
//! task enqueued during dispatch still runs in the same iteration.

mod channel;
mod poller;
mod pool;
mod timers;

pub use channel::{Channel, EventHandler, Ready};
pub use pool::{ReactorInit, ReactorPool};
pub use timers::TimerId;

use std::fmt;
use std::io::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::{Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, trace};

use poller::Poller;
use timers::{TimerEntry, TimerSet};

/// Upper bound on one demultiplexer wait, so `quit()` is observed even
/// without wakeups.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

const WAKE_TOKEN: Token = Token(usize::MAX);

/// A unit of work executed on a specific reactor's owner thread.
pub type Task = Box<dyn FnOnce() + Send>;

struct ReactorShared {
    registry: Registry,
    waker: Waker,
    owner: ThreadId,
    quit: AtomicBool,
    draining_tasks: AtomicBool,
    pending: Mutex<Vec<Task>>,
    handlers: Mutex<Slab<Weak<dyn EventHandler>>>,
    timers: Mutex<TimerSet>,
    next_timer_id: AtomicU64,
}

impl fmt::Debug for ReactorShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorShared")
            .field("owner", &self.owner)
            .field("quit", &self.quit)
            .finish_non_exhaustive()
    }
}

/// An event loop bound to the thread that constructed it.
#[derive(Debug)]
pub struct Reactor {
    poller: Poller,
    shared: Arc<ReactorShared>,
    ready: Vec<(Token, Ready)>,
    iteration: u64,
}

impl Reactor {
    /// Creates a reactor owned by the current thread.
    pub fn new() -> Result<Self> {
        let poller = Poller::new()?;
        let registry = poller.poll().registry().try_clone()?;
        let waker = Waker::new(poller.poll().registry(), WAKE_TOKEN)?;
        let shared = Arc::new(ReactorShared {
            registry,
            waker,
            owner: thread::current().id(),
            quit: AtomicBool::new(false),
            draining_tasks: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            handlers: Mutex::new(Slab::new()),
            timers: Mutex::new(TimerSet::default()),
            next_timer_id: AtomicU64::new(0),
        });
        debug!(owner = ?shared.owner, "reactor created");
        Ok(Self {
            poller,
            shared,
            ready: Vec::new(),
            iteration: 0,
        })
    }

    /// A cloneable, thread-safe handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the event loop until [`ReactorHandle::quit`] is observed.
    ///
    /// # Panics
    /// Panics when called from any thread other than the one that
    /// constructed the reactor.
    pub fn run(&mut self) {
        assert_eq!(
            self.shared.owner,
            thread::current().id(),
            "Reactor::run called off its owner thread"
        );
        trace!("reactor start looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            self.iteration += 1;

            // Tasks enqueued before the loop blocked (no wakeup written for
            // owner-thread producers outside a drain) must not wait out a
            // full poll timeout.
            let timeout = if self.shared.pending.lock().unwrap().is_empty() {
                match self.shared.timers.lock().unwrap().next_deadline() {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .min(POLL_TIMEOUT),
                    None => POLL_TIMEOUT,
                }
            } else {
                Duration::ZERO
            };

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            if let Err(err) = self.poller.wait(Some(timeout), &mut ready) {
                error!(%err, "demultiplexer wait failed");
            }
            let ts = Instant::now();

            for &(token, mask) in &ready {
                if token == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(token, mask, ts);
            }
            self.ready = ready;

            self.fire_timers();
            self.drain_tasks();
        }

        trace!(iterations = self.iteration, "reactor stop looping");
    }

    fn dispatch(&self, token: Token, mask: Ready, ts: Instant) {
        let weak = {
            let handlers = self.shared.handlers.lock().unwrap();
            handlers.get(token.0).cloned()
        };
        let Some(weak) = weak else {
            trace!(token = token.0, "event for unknown channel");
            return;
        };
        match weak.upgrade() {
            Some(handler) => channel::dispatch(&handler, mask, ts),
            // Owner died mid-wave; drop the stale table entry.
            None => self.handle().detach(token),
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mut due = self.shared.timers.lock().unwrap().take_due(now);
        if due.is_empty() {
            return;
        }
        trace!(count = due.len(), "firing timers");
        for entry in &mut due {
            (entry.callback)();
        }
        self.shared.timers.lock().unwrap().finish_wave(due, now);
    }

    fn drain_tasks(&self) {
        self.shared.draining_tasks.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.draining_tasks.store(false, Ordering::Release);
    }
}

/// Thread-safe handle used to schedule work on a [`Reactor`].
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// True when the calling thread owns the reactor.
    pub fn is_in_reactor_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Stops the event loop. Thread-safe.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_reactor_thread() {
            self.wake();
        }
    }

    /// Runs `task` inline when called on the owner thread, otherwise
    /// enqueues it.
    pub fn run_in_reactor(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_reactor_thread() {
            task();
        } else {
            self.enqueue(task);
        }
    }

    /// Enqueues `task` for the next drain of the owner loop.
    ///
    /// The wakeup is written even when the owner thread itself enqueues
    /// while draining, otherwise a task queued by another task could sleep
    /// a full poll timeout.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_reactor_thread() || self.shared.draining_tasks.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Number of tasks waiting to be drained.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Schedules `callback` at `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(when, None, Box::new(callback))
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` every `period`, first firing one period from now.
    pub fn run_every(&self, period: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + period, Some(period), Box::new(callback))
    }

    /// Cancels a timer.
    ///
    /// Immediate on the owner thread; from other threads the cancellation is
    /// a task and thus eventually consistent. Cancelling a repeating timer
    /// from within its own callback prevents any further invocation.
    pub fn cancel(&self, id: TimerId) {
        let shared = self.shared.clone();
        self.run_in_reactor(move || {
            shared.timers.lock().unwrap().cancel(id);
        });
    }

    fn add_timer(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: timers::TimerCallback,
    ) -> TimerId {
        let id = self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        let entry = TimerEntry {
            id,
            when,
            interval,
            callback,
        };
        // Serialised on the owner thread; the next loop iteration re-arms
        // its wait from the new head.
        self.run_in_reactor(move || {
            shared.timers.lock().unwrap().insert(entry);
        });
        TimerId(id)
    }

    /// Adds `handler` to the channel table, yielding its token.
    ///
    /// Owner-thread only, like every channel mutation.
    pub(crate) fn attach(&self, handler: Weak<dyn EventHandler>) -> Token {
        debug_assert!(self.is_in_reactor_thread());
        Token(self.shared.handlers.lock().unwrap().insert(handler))
    }

    /// Drops a channel table entry.
    pub(crate) fn detach(&self, token: Token) {
        let mut handlers = self.shared.handlers.lock().unwrap();
        if handlers.contains(token.0) {
            handlers.remove(token.0);
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!(%err, "reactor wakeup failed");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::Reactor;

    #[test]
    fn run_in_reactor_is_inline_on_the_owner_thread() {
        let reactor = Reactor::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor.handle().run_in_reactor(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(1, hits.load(Ordering::SeqCst));
    }

    #[test]
    fn enqueue_defers_until_the_loop_drains() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let quitter = handle.clone();
        handle.enqueue(move || {
            h.fetch_add(1, Ordering::SeqCst);
            quitter.quit();
        });
        assert_eq!(0, hits.load(Ordering::SeqCst));
        assert_eq!(1, handle.queue_size());

        reactor.run();
        assert_eq!(1, hits.load(Ordering::SeqCst));
        assert_eq!(0, handle.queue_size());
    }

    #[test]
    fn quit_interrupts_a_blocked_wait() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let waiter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.quit();
        });
        reactor.run();
        waiter.join().unwrap();
    }
}
