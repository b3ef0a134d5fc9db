//! Event loop post and stop semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use riptide::EventLoop;

/// Start a loop on its own thread and hand back a shared handle to it.
fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn same_thread_post_runs_inline() {
    let (event_loop, handle) = spawn_loop();
    let (tx, rx) = crossbeam_channel::bounded(1);

    let inner_loop = event_loop.clone();
    event_loop.post(move || {
        // posting from the loop thread must run synchronously inside post()
        let flag = Arc::new(AtomicBool::new(false));
        let flag_inner = flag.clone();
        inner_loop.post(move || flag_inner.store(true, Ordering::SeqCst));
        tx.send(flag.load(Ordering::SeqCst)).unwrap();
    });

    let ran_inline = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ran_inline);

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn cross_thread_post_wakes_the_selector() {
    let (event_loop, handle) = spawn_loop();
    let (tx, rx) = crossbeam_channel::bounded(1);

    // let the loop block in select first
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    event_loop.post(move || {
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // the select timeout is 8 seconds; anything this fast proves the wakeup fd
    assert!(start.elapsed() < Duration::from_secs(2));

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn cross_thread_posts_preserve_order() {
    let (event_loop, handle) = spawn_loop();
    let (tx, rx) = crossbeam_channel::unbounded();

    for i in 0..10 {
        let tx = tx.clone();
        event_loop.post(move || {
            tx.send(i).unwrap();
        });
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn stop_from_another_thread_returns_promptly() {
    let (event_loop, handle) = spawn_loop();

    // loop is idle, blocked in select
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    event_loop.stop();
    assert!(start.elapsed() < Duration::from_secs(2));
    handle.join().unwrap();
}

#[test]
fn queued_callbacks_are_dropped_after_stop() {
    let (event_loop, handle) = spawn_loop();
    event_loop.stop();
    handle.join().unwrap();

    // the loop is gone; posting must not panic or block
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = ran.clone();
    event_loop.post(move || ran_clone.store(true, Ordering::SeqCst));
    thread::sleep(Duration::from_millis(100));
    assert!(!ran.load(Ordering::SeqCst));
}
