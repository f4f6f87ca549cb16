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

//! Pool of worker reactors, one per OS thread.
//!
//! Each worker constructs its [`Reactor`] on its own stack (fixing thread
//! ownership at construction), publishes a handle back over a channel, and
//! enters the loop. Connections are dealt out strictly round-robin.

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{debug, info};

use super::{Reactor, ReactorHandle};

/// Callback run on each worker thread right after its reactor is built.
pub type ReactorInit = Arc<dyn Fn(&ReactorHandle) + Send + Sync>;

/// Fixed-size pool of worker reactors fronted by a controller reactor.
pub struct ReactorPool {
    controller: ReactorHandle,
    name: String,
    workers: Vec<ReactorHandle>,
    threads: Vec<JoinHandle<()>>,
    cursor: AtomicUsize,
    started: bool,
}

impl fmt::Debug for ReactorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("started", &self.started)
            .finish()
    }
}

impl ReactorPool {
    /// Creates an empty pool dispatching to `controller` until started.
    pub fn new(controller: ReactorHandle, name: &str) -> Self {
        Self {
            controller,
            name: name.to_owned(),
            workers: Vec::new(),
            threads: Vec::new(),
            cursor: AtomicUsize::new(0),
            started: false,
        }
    }

    /// Spawns `count` worker threads and blocks until every worker has
    /// published its reactor handle.
    ///
    /// With `count == 0` all work stays on the controller reactor, and
    /// `init` (when set) runs with the controller handle, once.
    pub fn start(&mut self, count: usize, init: Option<ReactorInit>) -> Result<()> {
        assert!(!self.started, "reactor pool started twice");
        self.started = true;

        for i in 0..count {
            let thread_name = format!("{}-reactor-{i}", self.name);
            let (tx, rx) = bounded(1);
            let init = init.clone();
            let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
                let mut reactor = match Reactor::new() {
                    Ok(reactor) => reactor,
                    Err(err) => {
                        // Publication doubles as error propagation.
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let _ = tx.send(Ok(reactor.handle()));
                if let Some(init) = &init {
                    init(&reactor.handle());
                }
                reactor.run();
                debug!("worker reactor exited");
            })?;

            let published = rx
                .recv()
                .map_err(|_| Error::new(ErrorKind::Other, "worker reactor thread died"))??;
            info!(worker = %thread_name, "worker reactor started");
            self.workers.push(published);
            self.threads.push(handle);
        }

        if count == 0 {
            if let Some(init) = &init {
                init(&self.controller);
            }
        }
        Ok(())
    }

    /// Next reactor in round-robin order; the controller when the pool is
    /// empty.
    pub fn next(&self) -> ReactorHandle {
        if self.workers.is_empty() {
            return self.controller.clone();
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].clone()
    }

    /// Reactor picked by `hash`, stable for the pool's lifetime.
    pub fn for_hash(&self, hash: u64) -> ReactorHandle {
        if self.workers.is_empty() {
            return self.controller.clone();
        }
        self.workers[(hash % self.workers.len() as u64) as usize].clone()
    }

    /// Handles of all workers, or the controller for an empty pool.
    pub fn handles(&self) -> Vec<ReactorHandle> {
        if self.workers.is_empty() {
            vec![self.controller.clone()]
        } else {
            self.workers.clone()
        }
    }

    /// Quits every worker and joins its thread. Worker handles are invalid
    /// for scheduling new work afterwards.
    pub fn stop(&mut self) {
        for worker in &self.workers {
            worker.quit();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        self.workers.clear();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::reactor::Reactor;

    use super::ReactorPool;

    #[test]
    fn empty_pool_hands_out_the_controller() {
        let controller = Reactor::new().unwrap();
        let mut pool = ReactorPool::new(controller.handle(), "test");
        pool.start(0, None).unwrap();
        // No worker thread to quit; next() must keep returning a live handle.
        assert!(pool.next().is_in_reactor_thread());
        assert!(pool.for_hash(42).is_in_reactor_thread());
    }

    #[test]
    fn workers_publish_distinct_reactors_round_robin() {
        let controller = Reactor::new().unwrap();
        let mut pool = ReactorPool::new(controller.handle(), "test");

        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        pool.start(
            3,
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(3, inits.load(Ordering::SeqCst));

        // None of the workers run on this thread, and the rotation is fair.
        let a = pool.next();
        let b = pool.next();
        let c = pool.next();
        for handle in [&a, &b, &c] {
            assert!(!handle.is_in_reactor_thread());
        }
        assert_eq!(3, pool.handles().len());

        pool.stop();
    }
}
