//! Process-exit notification, driven end to end against a real child.
//!
//! This test runs without the libtest harness: SIGCHLD must be blocked
//! before any other thread exists, otherwise the kernel may deliver the
//! signal to an unblocked harness thread and the loop's signalfd never
//! sees it. The loop blocks SIGCHLD on its own thread at creation; running
//! single-threaded makes that sufficient.

use std::process::Command;
use std::rc::Rc;
use std::cell::Cell;
use std::time::{Duration, Instant};

use evio::{EventLoop, Options};

fn main() {
    let mut el = EventLoop::create(Options::default()).expect("create event loop");

    let mut child = Command::new("sh")
        .args(["-c", "exit 42"])
        .spawn()
        .expect("spawn child");

    let status = Rc::new(Cell::new(None::<i32>));
    let witness = Rc::clone(&status);
    el.start_process_exit(child.id() as i32, move |completion| {
        let exit = completion.take_outcome().expect("process exit outcome");
        witness.set(Some(exit.code));
    })
    .expect("start process exit");

    let started = Instant::now();
    el.run().expect("run");
    let elapsed = started.elapsed();

    assert_eq!(status.get(), Some(42), "child exit status");
    assert!(elapsed < Duration::from_secs(1), "reaper latency too high: {elapsed:?}");
    assert_eq!(el.num_active_handles(), 0);

    // The loop never reaps; the caller still owns the child.
    let waited = child.wait().expect("wait child");
    assert_eq!(waited.code(), Some(42));

    println!("process_exit: ok");
}
