//! Linux backend: epoll for readiness, signalfd for SIGCHLD, eventfd for
//! cross-thread wake-ups.
//!
//! epoll is a readiness facility: `setup` registers the descriptor with the
//! right event mask, and the actual syscall (`accept4`/`recv`/`send`/
//! `read`/`write`) runs in `complete` once readiness is known.
//!
//! Two kinds never produce a kernel event here and complete manually:
//!
//! - `SocketClose`/`FileClose` close the descriptor synchronously in
//!   `setup`.
//! - `FileRead`/`FileWrite` on *regular files*: epoll cannot poll those, so
//!   `activate` runs the I/O synchronously on the loop thread and schedules
//!   a manual completion. This blocks the loop on slow storage; a worker
//!   pool integration would lift the limitation.
//!
//! `ProcessExit` has no per-request kernel entity either: the backend owns
//! one signalfd subscribed to SIGCHLD (blocked on the loop thread at
//! creation), and the loop matches arriving pids against active requests.

#![allow(unsafe_code)]

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::posix::{
    close_fd, errno, execute_file_read, execute_file_write, execute_socket_receive,
    execute_socket_send,
};
use crate::backend::{RawEvent, Staged, SyncMode, SIGCHLD_TOKEN, WAKE_TOKEN};
use crate::clock;
use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{ApiType, Options};
use crate::request::{Payload, RequestFlags};

const EVENT_BATCH: usize = 1024;

/// Shared wake-up endpoint, an eventfd.
///
/// `notify` is safe from any thread; a saturated counter means a wake is
/// already pending, which is exactly the coalescing the loop wants.
#[derive(Debug)]
pub(crate) struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::last_os_error("eventfd"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Posts one notification.
    pub(crate) fn notify(&self) -> Result<()> {
        let one: u64 = 1;
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    ptr::addr_of!(one).cast(),
                    core::mem::size_of::<u64>(),
                )
            };
            if n == core::mem::size_of::<u64>() as isize {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                // Counter saturated: a notification is already pending.
                libc::EAGAIN => return Ok(()),
                _ => return Err(Error::last_os_error("eventfd write")),
            }
        }
    }

    /// Consumes pending notifications. Returns true if any were pending.
    pub(crate) fn drain(&self) -> bool {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                ptr::addr_of_mut!(value).cast(),
                core::mem::size_of::<u64>(),
            )
        };
        n == core::mem::size_of::<u64>() as isize && value > 0
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// The epoll kernel queue plus the shared watchers it owns.
#[derive(Debug)]
pub(crate) struct Backend {
    epoll: OwnedFd,
    notifier: Arc<Notifier>,
    signal_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    num_events: usize,
}

impl Backend {
    pub(crate) fn new(options: &Options) -> Result<Self> {
        if options.api_type == ApiType::ForceUseIoUring {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_context("io_uring backend is not available in this build"));
        }

        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(Error::last_os_error("epoll_create1"));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let notifier = Arc::new(Notifier::new()?);
        let signal_fd = create_sigchld_fd()?;

        let mut backend = Self {
            epoll,
            notifier,
            signal_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH],
            num_events: 0,
        };
        backend.add_watch(WAKE_TOKEN, backend.notifier.fd(), libc::EPOLLIN as u32)?;
        backend.add_watch(
            SIGCHLD_TOKEN,
            backend.signal_fd.as_raw_fd(),
            libc::EPOLLIN as u32,
        )?;
        Ok(backend)
    }

    pub(crate) fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    /// The kernel queue descriptor, for embedders driving auxiliary kernel
    /// objects themselves.
    pub(crate) fn loop_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Blocks in `epoll_wait`, bounded by the earliest timer (or not at
    /// all in `NoWait` mode). EINTR re-snaps the loop time and retries with
    /// a recomputed timeout.
    pub(crate) fn sync(
        &mut self,
        loop_time: &mut Instant,
        next_timer: Option<Instant>,
        mode: SyncMode,
    ) -> Result<()> {
        self.num_events = 0;
        loop {
            let timeout_ms: libc::c_int = match mode {
                SyncMode::NoWait => 0,
                SyncMode::ForcedForwardProgress => match next_timer {
                    Some(deadline) => {
                        clock::duration_to_ms_ceil(clock::wait_until(*loop_time, deadline))
                    }
                    None => -1,
                },
            };
            let res = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if res < 0 {
                if errno() == libc::EINTR {
                    *loop_time = clock::snap();
                    continue;
                }
                return Err(Error::last_os_error("epoll_wait"));
            }
            self.num_events = res as usize;
            return Ok(());
        }
    }

    pub(crate) fn num_events(&self) -> usize {
        self.num_events
    }

    /// Forgets the previous step's event batch. Called at the start of
    /// every step so a step that skips the kernel wait cannot re-dispatch
    /// stale events.
    pub(crate) fn reset_events(&mut self) {
        self.num_events = 0;
    }

    pub(crate) fn event(&self, idx: usize) -> RawEvent {
        let ev = &self.events[idx];
        RawEvent {
            token: ev.u64,
            data: 0,
        }
    }

    /// Checks the error bits of one event. `Ok(true)` means dispatch,
    /// `Ok(false)` means skip silently.
    pub(crate) fn validate_event(&self, idx: usize) -> Result<bool> {
        let bits = self.events[idx].events;
        if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            return Err(Error::new(ErrorKind::Kernel)
                .with_context("epoll reported EPOLLERR or EPOLLHUP"));
        }
        Ok(true)
    }

    /// Consumes pending wake-up notifications.
    pub(crate) fn drain_wake(&mut self) {
        self.notifier.drain();
    }

    /// Reads the next queued SIGCHLD, if any, as `(pid, exit status)`.
    pub(crate) fn next_sigchld(&mut self) -> Option<(libc::pid_t, i32)> {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let want = core::mem::size_of::<libc::signalfd_siginfo>();
        loop {
            let n = unsafe {
                libc::read(self.signal_fd.as_raw_fd(), info.as_mut_ptr().cast(), want)
            };
            if n == want as isize {
                let info = unsafe { info.assume_init() };
                if info.ssi_signo == libc::SIGCHLD as u32 {
                    return Some((info.ssi_pid as libc::pid_t, info.ssi_status));
                }
                continue;
            }
            if n < 0 && errno() == libc::EINTR {
                continue;
            }
            return None;
        }
    }

    // ------------------------------------------------------------------
    // Per-kind lifecycle operations
    // ------------------------------------------------------------------

    pub(crate) fn setup(
        &mut self,
        token: u64,
        flags: &mut RequestFlags,
        payload: &mut Payload,
    ) -> Result<Staged> {
        match payload {
            // No kernel entity: timers bound the kernel wait, wake-ups ride
            // the shared eventfd, process exits ride the shared signalfd.
            Payload::Timeout(_) | Payload::WakeUp(_) | Payload::ProcessExit(_) => Ok(Staged::Armed),

            Payload::SocketAccept(st) => {
                self.add_watch(token, st.socket, libc::EPOLLIN as u32)?;
                Ok(Staged::Armed)
            }
            Payload::SocketConnect(st) => {
                self.add_watch(token, st.socket, libc::EPOLLOUT as u32)?;
                Ok(Staged::Armed)
            }
            Payload::SocketSend(st) => {
                self.add_watch(token, st.socket, libc::EPOLLOUT as u32)?;
                Ok(Staged::Armed)
            }
            Payload::SocketReceive(st) => {
                self.add_watch(token, st.socket, (libc::EPOLLIN | libc::EPOLLRDHUP) as u32)?;
                Ok(Staged::Armed)
            }
            Payload::SocketClose(st) => {
                close_fd(st.socket)?;
                Ok(Staged::Manual)
            }
            Payload::FileRead(st) => {
                flags.remove(RequestFlags::REGULAR_FILE);
                if is_regular_file(st.file)? {
                    // epoll cannot poll regular files; activate runs the
                    // read synchronously and completes manually.
                    flags.insert(RequestFlags::REGULAR_FILE);
                    return Ok(Staged::Armed);
                }
                self.add_watch(token, st.file, libc::EPOLLIN as u32)?;
                Ok(Staged::Armed)
            }
            Payload::FileWrite(st) => {
                flags.remove(RequestFlags::REGULAR_FILE);
                if is_regular_file(st.file)? {
                    flags.insert(RequestFlags::REGULAR_FILE);
                    return Ok(Staged::Armed);
                }
                self.add_watch(token, st.file, libc::EPOLLOUT as u32)?;
                Ok(Staged::Armed)
            }
            Payload::FileClose(st) => {
                close_fd(st.file)?;
                Ok(Staged::Manual)
            }
            Payload::FilePoll(st) => {
                self.add_watch(token, st.file, libc::EPOLLIN as u32)?;
                Ok(Staged::Armed)
            }
        }
    }

    pub(crate) fn activate(
        &mut self,
        _token: u64,
        flags: &RequestFlags,
        payload: &mut Payload,
    ) -> Result<Staged> {
        match payload {
            Payload::SocketConnect(st) => {
                let addr = socket2::SockAddr::from(st.addr);
                let res = unsafe { libc::connect(st.socket, addr.as_ptr().cast(), addr.len()) };
                if res == 0 {
                    // Immediate success (loopback); the writability event
                    // still arrives and drives the completion.
                    return Ok(Staged::Armed);
                }
                match errno() {
                    libc::EINPROGRESS | libc::EAGAIN => Ok(Staged::Armed),
                    _ => Err(Error::last_os_error("connect")),
                }
            }
            Payload::FileRead(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    execute_file_read(st)?;
                    return Ok(Staged::Manual);
                }
                Ok(Staged::Armed)
            }
            Payload::FileWrite(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    execute_file_write(st)?;
                    return Ok(Staged::Manual);
                }
                Ok(Staged::Armed)
            }
            _ => Ok(Staged::Armed),
        }
    }

    /// Runs the actual syscall now that readiness is known, filling the
    /// payload's completion fields.
    pub(crate) fn complete(
        &mut self,
        _event: Option<RawEvent>,
        flags: &RequestFlags,
        payload: &mut Payload,
    ) -> Result<()> {
        match payload {
            Payload::Timeout(_) | Payload::WakeUp(_) => Ok(()),
            Payload::ProcessExit(st) => {
                // The exit code was matched out of the signalfd stream
                // before dispatch.
                if st.exit_code.is_some() {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::Internal)
                        .with_context("process exit completed without an exit status"))
                }
            }
            Payload::SocketAccept(st) => {
                let fd = unsafe {
                    libc::accept4(
                        st.socket,
                        ptr::null_mut(),
                        ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if fd < 0 {
                    return Err(Error::last_os_error("accept4"));
                }
                st.accepted = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                Ok(())
            }
            Payload::SocketConnect(st) => {
                let mut so_error: libc::c_int = 0;
                let mut len = core::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let res = unsafe {
                    libc::getsockopt(
                        st.socket,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        ptr::addr_of_mut!(so_error).cast(),
                        &mut len,
                    )
                };
                if res != 0 {
                    return Err(Error::last_os_error("getsockopt SO_ERROR"));
                }
                if so_error != 0 {
                    return Err(Error::new(ErrorKind::PeerClosed)
                        .with_context("connect failed")
                        .with_source(io::Error::from_raw_os_error(so_error)));
                }
                Ok(())
            }
            Payload::SocketSend(st) => execute_socket_send(st),
            Payload::SocketReceive(st) => execute_socket_receive(st),
            Payload::SocketClose(_) | Payload::FileClose(_) => Ok(()),
            Payload::FileRead(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    // Already read synchronously at activation.
                    Ok(())
                } else {
                    execute_file_read(st)
                }
            }
            Payload::FileWrite(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    Ok(())
                } else {
                    execute_file_write(st)
                }
            }
            Payload::FilePoll(_) => Ok(()),
        }
    }

    pub(crate) fn cancel(&mut self, flags: RequestFlags, payload: &Payload) -> Result<()> {
        self.remove_registration(flags, payload)
    }

    pub(crate) fn teardown(&mut self, flags: RequestFlags, payload: &Payload) -> Result<()> {
        self.remove_registration(flags, payload)
    }

    // ------------------------------------------------------------------

    fn add_watch(&mut self, token: u64, fd: RawFd, mask: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: token,
        };
        let res = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if res != 0 {
            return Err(Error::last_os_error("epoll_ctl ADD"));
        }
        Ok(())
    }

    /// Removes a watcher. EBADF and ENOENT are not errors: the descriptor
    /// may already be closed or never have been registered.
    fn remove_watch(&mut self, fd: RawFd) -> Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let res = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut event)
        };
        if res == 0 || matches!(errno(), libc::EBADF | libc::ENOENT) {
            return Ok(());
        }
        Err(Error::last_os_error("epoll_ctl DEL"))
    }

    fn remove_registration(&mut self, flags: RequestFlags, payload: &Payload) -> Result<()> {
        match payload {
            Payload::Timeout(_) | Payload::WakeUp(_) | Payload::ProcessExit(_) => Ok(()),
            Payload::SocketAccept(st) => self.remove_watch(st.socket),
            Payload::SocketConnect(st) => self.remove_watch(st.socket),
            Payload::SocketSend(st) => self.remove_watch(st.socket),
            Payload::SocketReceive(st) => self.remove_watch(st.socket),
            // Manual completions: the descriptor is already closed.
            Payload::SocketClose(_) | Payload::FileClose(_) => Ok(()),
            Payload::FileRead(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    Ok(())
                } else {
                    self.remove_watch(st.file)
                }
            }
            Payload::FileWrite(st) => {
                if flags.contains(RequestFlags::REGULAR_FILE) {
                    Ok(())
                } else {
                    self.remove_watch(st.file)
                }
            }
            Payload::FilePoll(st) => self.remove_watch(st.file),
        }
    }
}

fn create_sigchld_fd() -> Result<OwnedFd> {
    unsafe {
        let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(mask.as_mut_ptr());
        libc::sigaddset(mask.as_mut_ptr(), libc::SIGCHLD);
        let mask = mask.assume_init();
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) != 0 {
            return Err(Error::last_os_error("pthread_sigmask"));
        }
        let fd = libc::signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK);
        if fd < 0 {
            return Err(Error::last_os_error("signalfd"));
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

fn is_regular_file(fd: RawFd) -> Result<bool> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let res = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if res != 0 {
        return Err(Error::last_os_error("fstat"));
    }
    let st = unsafe { st.assume_init() };
    Ok(st.st_mode & libc::S_IFMT == libc::S_IFREG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_round_trip() {
        let notifier = Notifier::new().expect("notifier");
        assert!(!notifier.drain(), "fresh notifier has nothing pending");
        notifier.notify().expect("notify");
        notifier.notify().expect("second notify coalesces in the counter");
        assert!(notifier.drain());
        assert!(!notifier.drain());
    }

    #[test]
    fn regular_file_detection() {
        let file = std::fs::File::open("/proc/self/exe")
            .or_else(|_| std::fs::File::open("/etc/hostname"))
            .expect("some regular file");
        assert!(is_regular_file(file.as_raw_fd()).expect("fstat"));

        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        assert!(!is_regular_file(a.as_raw_fd()).expect("fstat"));
    }

    #[test]
    fn backend_rejects_forced_io_uring() {
        let options = Options {
            api_type: ApiType::ForceUseIoUring,
        };
        let err = Backend::new(&options).expect_err("must reject io_uring");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn watch_add_and_remove_is_idempotent() {
        let mut backend = Backend::new(&Options::default()).expect("backend");
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        backend
            .add_watch(42, a.as_raw_fd(), libc::EPOLLIN as u32)
            .expect("add");
        backend.remove_watch(a.as_raw_fd()).expect("remove");
        backend
            .remove_watch(a.as_raw_fd())
            .expect("second remove reports ENOENT as success");
    }
}
