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

//! Ordered timer set.
//!
//! Timers are keyed by `(deadline, id)` with a secondary by-id index for
//! cancellation; ids are assigned monotonically, so ties on the deadline
//! break FIFO by scheduling order. The owner reactor arms its demultiplexer
//! wait to the head deadline and drives waves through [`TimerSet::take_due`]
//! and [`TimerSet::finish_wave`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of a scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct TimerEntry {
    pub(crate) id: u64,
    pub(crate) when: Instant,
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: TimerCallback,
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("id", &self.id)
            .field("when", &self.when)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    by_id: HashMap<u64, Instant>,
    firing: bool,
    cancelled_in_wave: HashSet<u64>,
}

impl TimerSet {
    /// Inserts a timer; returns whether the head deadline moved earlier.
    pub(crate) fn insert(&mut self, entry: TimerEntry) -> bool {
        let earliest_changed = match self.timers.keys().next() {
            None => true,
            Some(&(head, _)) => entry.when < head,
        };
        self.by_id.insert(entry.id, entry.when);
        self.timers.insert((entry.when, entry.id), entry);
        earliest_changed
    }

    /// Removes the timer if it is still pending.
    ///
    /// During a firing wave the popped entries are no longer in the set;
    /// recording the id instead prevents a repeating timer from being
    /// re-inserted, which is what makes self-cancellation work.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        if let Some(when) = self.by_id.remove(&id.0) {
            self.timers.remove(&(when, id.0));
            true
        } else if self.firing {
            self.cancelled_in_wave.insert(id.0);
            false
        } else {
            false
        }
    }

    /// Deadline of the head timer, used to arm the demultiplexer wait.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|&(when, _)| when)
    }

    /// Pops every timer with `when <= now`, in `(when, id)` order, and opens
    /// a firing wave. Timers inserted while the wave runs wait for the next
    /// one even if already due.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(&(when, id)) = self.timers.keys().next() {
            if when > now {
                break;
            }
            let entry = self
                .timers
                .remove(&(when, id))
                .expect("head key fetched under the same borrow");
            self.by_id.remove(&id);
            due.push(entry);
        }
        if !due.is_empty() {
            self.firing = true;
            self.cancelled_in_wave.clear();
        }
        due
    }

    /// Closes a firing wave: re-inserts repeating timers that were not
    /// cancelled from within their own callback, rescheduled at
    /// `now + interval`.
    pub(crate) fn finish_wave(&mut self, fired: Vec<TimerEntry>, now: Instant) {
        for mut entry in fired {
            let repeat = entry.interval.is_some() && !self.cancelled_in_wave.contains(&entry.id);
            if repeat {
                entry.when = now + entry.interval.expect("repeat implies interval");
                self.insert(entry);
            }
        }
        self.firing = false;
        self.cancelled_in_wave.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.timers.len()
    }
}
