//! End-to-end scenarios driving the loop against real kernel objects:
//! timers, TCP accept/receive, cross-thread wake-up coalescing,
//! cancellation and positional file reads.

use std::cell::{Cell, RefCell};
use std::io::Write as _;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use evio::{AddressFamily, ErrorKind, EventLoop, Options};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn new_loop() -> EventLoop {
    init_logging();
    EventLoop::create(Options::default()).expect("create event loop")
}

#[test]
fn timer_then_shutdown() {
    let mut el = new_loop();
    let fired = Rc::new(Cell::new(0u32));
    let witness = Rc::clone(&fired);
    let started = Instant::now();
    el.start_timeout(Duration::from_millis(100), move |completion| {
        assert!(completion.outcome().is_ok());
        witness.set(witness.get() + 1);
    })
    .expect("start timeout");

    el.run().expect("run");

    let elapsed = started.elapsed();
    assert_eq!(fired.get(), 1, "exactly one callback invocation");
    assert!(elapsed >= Duration::from_millis(100), "fired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired too late: {elapsed:?}");
    assert_eq!(el.num_active_handles(), 0);
}

#[test]
fn tcp_accept_then_receive() {
    let mut el = new_loop();

    // Listen on ::1, retrying the port range on EADDRINUSE.
    let mut bound = None;
    for port in 5050..=5059u16 {
        let fd = el
            .create_async_tcp_socket(AddressFamily::Ipv6)
            .expect("create socket");
        let socket = socket2::Socket::from(fd);
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port);
        match socket.bind(&addr.into()) {
            Ok(()) => {
                socket.listen(16).expect("listen");
                bound = Some((socket, port));
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => panic!("bind failed: {e}"),
        }
    }
    let (listener, port) = bound.expect("no free port in 5050..=5059");

    let accepted: Rc<RefCell<Option<OwnedFd>>> = Rc::new(RefCell::new(None));
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let accepted = Rc::clone(&accepted);
        let received = Rc::clone(&received);
        el.start_socket_accept(listener.as_raw_fd(), AddressFamily::Ipv6, move |completion| {
            let client = completion.take_outcome().expect("accept outcome").socket;
            let raw = client.as_raw_fd();
            *accepted.borrow_mut() = Some(client);
            let received = Rc::clone(&received);
            completion
                .event_loop()
                .start_socket_receive(raw, vec![0u8; 1], move |completion| {
                    let transfer = completion.take_outcome().expect("receive outcome");
                    received.borrow_mut().extend_from_slice(transfer.data());
                })
                .expect("start receive");
        })
        .expect("start accept");
    }

    // The client lives on another thread and stays open until we are done.
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let connector = std::thread::spawn(move || {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port);
        let mut stream = std::net::TcpStream::connect(addr).expect("connect");
        stream.write_all(&[0x7B]).expect("send one byte");
        let _ = done_rx.recv();
    });

    el.run().expect("run");

    assert!(accepted.borrow().is_some(), "accept callback delivered a socket");
    assert_eq!(*received.borrow(), vec![0x7B]);
    done_tx.send(()).expect("release connector");
    connector.join().expect("connector thread");
}

#[test]
fn wake_up_coalescing_across_threads() {
    const THREADS: usize = 8;
    const WAKES_PER_THREAD: usize = 1000;

    let mut el = new_loop();
    let callbacks = Rc::new(Cell::new(0usize));
    let witness = Rc::clone(&callbacks);
    let (id, handle) = el
        .start_wake_up(None, move |completion| {
            witness.set(witness.get() + 1);
            completion.reactivate_request(true);
        })
        .expect("start wake-up");

    let remaining = Arc::new(AtomicUsize::new(THREADS));
    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let handle = handle.clone();
        let remaining = Arc::clone(&remaining);
        workers.push(std::thread::spawn(move || {
            for _ in 0..WAKES_PER_THREAD {
                handle.wake_up().expect("wake");
            }
            remaining.fetch_sub(1, Ordering::AcqRel);
        }));
    }

    while remaining.load(Ordering::Acquire) > 0 {
        el.run_no_wait().expect("step");
        std::thread::yield_now();
    }
    for worker in workers {
        worker.join().expect("worker thread");
    }
    // Drain whatever arrived around the last step.
    for _ in 0..10 {
        el.run_no_wait().expect("step");
        if !handle.is_pending() {
            break;
        }
    }

    let count = callbacks.get();
    assert!(
        (1..=THREADS * WAKES_PER_THREAD).contains(&count),
        "callback count {count} out of range"
    );
    assert!(!handle.is_pending(), "pending must be clear after a quiet step");

    el.cancel(id).expect("cancel wake-up");
    el.run_no_wait().expect("drain cancellation");
    assert_eq!(el.num_active_handles(), 0);
}

#[test]
fn cancel_before_submit_returns_immediately() {
    let mut el = new_loop();
    let fired = Rc::new(Cell::new(false));
    let witness = Rc::clone(&fired);
    let id = el
        .start_timeout(Duration::from_millis(10_000), move |_| witness.set(true))
        .expect("start timeout");
    el.cancel(id).expect("cancel");

    let started = Instant::now();
    el.run().expect("run");
    assert!(started.elapsed() < Duration::from_secs(1), "run must not wait for the timer");
    assert!(!fired.get(), "cancelled callback must never fire");
    assert_eq!(el.num_active_handles(), 0);
}

#[test]
fn cancelled_receive_does_not_deliver() {
    let mut el = new_loop();
    let (a, b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    b.set_nonblocking(true).expect("nonblocking");
    let fired = Rc::new(Cell::new(false));
    let witness = Rc::clone(&fired);
    let id = el
        .start_socket_receive(b.as_raw_fd(), vec![0u8; 4], move |_| witness.set(true))
        .expect("start receive");
    // Activate the watcher, then cancel while data is in flight.
    el.run_no_wait().expect("stage");
    el.cancel(id).expect("cancel");
    (&a).write_all(&[1, 2, 3]).expect("write");
    el.run_no_wait().expect("drain cancellation");
    el.run_no_wait().expect("extra step");
    assert!(!fired.get(), "no callback after cancel returned");
    assert_eq!(el.num_active_handles(), 0);
}

#[test]
fn file_read_positional() {
    let mut el = new_loop();
    let path = std::env::temp_dir().join(format!("evio-e2e-read-{}", std::process::id()));
    std::fs::write(&path, (0u8..16).collect::<Vec<_>>()).expect("write fixture");
    let file = std::fs::File::open(&path).expect("open fixture");

    let data = Rc::new(RefCell::new(Vec::new()));
    let witness = Rc::clone(&data);
    el.start_file_read(file.as_raw_fd(), vec![0u8; 8], 4, move |completion| {
        let transfer = completion.take_outcome().expect("read outcome");
        witness.borrow_mut().extend_from_slice(transfer.data());
    })
    .expect("start read");

    el.run().expect("run");
    assert_eq!(*data.borrow(), (4u8..12).collect::<Vec<_>>());

    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_write_positional_then_read_back() {
    let mut el = new_loop();
    let path = std::env::temp_dir().join(format!("evio-e2e-write-{}", std::process::id()));
    std::fs::write(&path, vec![0u8; 8]).expect("write fixture");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .expect("open fixture");

    let written = Rc::new(Cell::new(0usize));
    let witness = Rc::clone(&written);
    el.start_file_write(file.as_raw_fd(), vec![0xEE; 4], 2, move |completion| {
        witness.set(completion.take_outcome().expect("write outcome").len);
    })
    .expect("start write");
    el.run().expect("run");
    assert_eq!(written.get(), 4);

    let on_disk = std::fs::read(&path).expect("read back");
    assert_eq!(on_disk, vec![0, 0, 0xEE, 0xEE, 0xEE, 0xEE, 0, 0]);

    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn echo_round_trip_with_send() {
    let mut el = new_loop();
    let (client, server) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    client.set_nonblocking(true).expect("nonblocking");
    server.set_nonblocking(true).expect("nonblocking");

    // Server side: receive, then send the same bytes back.
    {
        let server_fd = server.as_raw_fd();
        el.start_socket_receive(server_fd, vec![0u8; 16], move |completion| {
            let transfer = completion.take_outcome().expect("receive outcome");
            let payload = transfer.data().to_vec();
            completion
                .event_loop()
                .start_socket_send(server_fd, payload, |completion| {
                    assert!(completion.outcome().is_ok());
                })
                .expect("start send");
        })
        .expect("start receive");
    }

    (&client).write_all(b"ping").expect("client write");
    el.run().expect("run");

    let mut echoed = [0u8; 16];
    let n = {
        use std::io::Read as _;
        (&client).read(&mut echoed).expect("client read")
    };
    assert_eq!(&echoed[..n], b"ping");
}

#[test]
fn socket_close_request_closes_descriptor() {
    let mut el = new_loop();
    let (a, b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    let raw = {
        use std::os::fd::IntoRawFd;
        a.into_raw_fd()
    };
    let fired = Rc::new(Cell::new(false));
    let witness = Rc::clone(&fired);
    el.start_socket_close(raw, move |completion| {
        assert!(completion.outcome().is_ok());
        witness.set(true);
    })
    .expect("start close");
    el.run().expect("run");
    assert!(fired.get());

    // The peer observes end-of-stream, proving the fd is really closed.
    let mut buf = [0u8; 1];
    let n = {
        use std::io::Read as _;
        (&b).read(&mut buf).expect("peer read")
    };
    assert_eq!(n, 0);
}

#[test]
fn close_is_idempotent_and_detaches() {
    let mut el = new_loop();
    let fired = Rc::new(Cell::new(false));
    let witness = Rc::clone(&fired);
    el.start_timeout(Duration::from_secs(60), move |_| witness.set(true))
        .expect("start timeout");
    el.run_no_wait().expect("stage");
    assert_eq!(el.num_active_handles(), 1);

    el.close().expect("first close");
    assert_eq!(el.num_active_handles(), 0);
    el.close().expect("second close");
    assert!(!fired.get(), "no callbacks fire for requests pending at close");

    let err = el
        .start_timeout(Duration::from_millis(1), |_| {})
        .expect_err("closed loop rejects starts");
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}

#[test]
fn wake_up_handshake_with_event_object() {
    let mut el = new_loop();
    let gate = Arc::new(evio::EventObject::new());
    let fired = Rc::new(Cell::new(false));
    let witness = Rc::clone(&fired);
    let (_id, handle) = el
        .start_wake_up(Some(Arc::clone(&gate)), move |_| witness.set(true))
        .expect("start wake-up");

    let waker = {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            handle.wake_up().expect("wake");
            // Blocks until the loop thread ran the callback.
            gate.wait();
        })
    };

    while !fired.get() {
        el.run_once().expect("step");
    }
    waker.join().expect("waker thread");
    assert!(fired.get());
}
