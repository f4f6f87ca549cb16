//! Reactor task and timer behaviour, driven from outside the loop thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use snar::{Reactor, ReactorHandle, TimerId};

/// Builds a reactor on its own thread and hands back the handle.
fn spawn_reactor() -> (ReactorHandle, JoinHandle<()>) {
    let (tx, rx) = channel();
    let thread = std::thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor construction");
        tx.send(reactor.handle()).expect("publish handle");
        reactor.run();
    });
    (rx.recv().expect("reactor handle"), thread)
}

#[test]
fn tasks_from_one_thread_run_in_fifo_order() {
    let (handle, thread) = spawn_reactor();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let seen = seen.clone();
        handle.enqueue(move || seen.lock().unwrap().push(i));
    }
    let (tx, rx) = channel();
    handle.enqueue(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!((0..100).collect::<Vec<_>>(), *seen);

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn one_shot_timers_fire_in_deadline_order() {
    let (handle, thread) = spawn_reactor();
    let order = Arc::new(Mutex::new(Vec::new()));

    for delay in [30u64, 10, 20] {
        let order = order.clone();
        handle.run_after(Duration::from_millis(delay), move || {
            order.lock().unwrap().push(delay);
        });
    }
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(vec![10, 20, 30], *order.lock().unwrap());

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn run_after_fires_once_and_not_early() {
    let (handle, thread) = spawn_reactor();
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();

    let start = Instant::now();
    let counter = hits.clone();
    handle.run_after(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.send(Instant::now()).unwrap();
    });

    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Allow a little slack for the demultiplexer's timeout resolution.
    assert!(fired_at - start >= Duration::from_millis(45));

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(1, hits.load(Ordering::SeqCst));

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn run_every_keeps_its_period() {
    let (handle, thread) = spawn_reactor();
    let stamps = Arc::new(Mutex::new(Vec::new()));

    let recorder = stamps.clone();
    let id = handle.run_every(Duration::from_millis(30), move || {
        recorder.lock().unwrap().push(Instant::now());
    });
    std::thread::sleep(Duration::from_millis(200));
    handle.cancel(id);

    let stamps = stamps.lock().unwrap();
    assert!(
        (4..=8).contains(&stamps.len()),
        "expected ~6 invocations, got {}",
        stamps.len()
    );
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(20));
    }

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn cancelling_a_repeating_timer_from_its_own_callback_stops_it() {
    let (handle, thread) = spawn_reactor();
    let hits = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let counter = hits.clone();
    let slot = id_slot.clone();
    let canceller = handle.clone();
    let id = handle.run_every(Duration::from_millis(20), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let id = slot.lock().unwrap().expect("id published before first fire");
        canceller.cancel(id);
    });
    *id_slot.lock().unwrap() = Some(id);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(1, hits.load(Ordering::SeqCst));

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn cancel_before_the_deadline_suppresses_the_timer() {
    let (handle, thread) = spawn_reactor();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let id = handle.run_after(Duration::from_millis(100), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    handle.cancel(id);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(0, hits.load(Ordering::SeqCst));

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn quit_is_observed_without_any_wakeups() {
    let (handle, thread) = spawn_reactor();
    std::thread::sleep(Duration::from_millis(20));
    handle.quit();
    thread.join().unwrap();
}
