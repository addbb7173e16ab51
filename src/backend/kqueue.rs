//! macOS/BSD backend: kqueue for readiness, a self-pipe for cross-thread
//! wake-ups, `EVFILT_PROC` for process exit.
//!
//! kqueue watches regular files with `EVFILT_READ`/`EVFILT_WRITE`, so file
//! I/O needs no manual-completion split here; only the `*Close` kinds
//! complete manually (the descriptor is closed synchronously in `setup`).
//!
//! Watcher changes are applied immediately with their own `kevent` call, so
//! the event batch array is used for reaping only.

#![allow(unsafe_code)]

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::posix::{
    close_fd, errno, execute_file_read, execute_file_write, execute_socket_receive,
    execute_socket_send,
};
use crate::backend::{RawEvent, Staged, SyncMode};
use crate::clock;
use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{ApiType, Options};
use crate::request::{Payload, RequestFlags};

const EVENT_BATCH: usize = 1024;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const PROC_EXIT_FFLAGS: u32 = libc::NOTE_EXIT | libc::NOTE_EXITSTATUS;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const PROC_EXIT_FFLAGS: u32 = libc::NOTE_EXIT;

/// Shared wake-up endpoint, a non-blocking self-pipe.
pub(crate) struct Notifier {
    read: OwnedFd,
    write: OwnedFd,
}

impl Notifier {
    pub(crate) fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::last_os_error("pipe"));
        }
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking_cloexec(read.as_raw_fd())?;
        set_nonblocking_cloexec(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    /// Posts one notification (a single byte).
    pub(crate) fn notify(&self) -> Result<()> {
        let byte = 0u8;
        loop {
            let n = unsafe { libc::write(self.write.as_raw_fd(), ptr::addr_of!(byte).cast(), 1) };
            if n == 1 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                // Pipe full: plenty of wake bytes already pending.
                libc::EAGAIN => return Ok(()),
                _ => return Err(Error::last_os_error("pipe write")),
            }
        }
    }

    /// Consumes pending notification bytes. Returns true if any were read.
    pub(crate) fn drain(&self) -> bool {
        let mut scratch = [0u8; 64];
        let mut any = false;
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if n > 0 {
                any = true;
                if n as usize == scratch.len() {
                    continue;
                }
            }
            if n < 0 && errno() == libc::EINTR {
                continue;
            }
            return any;
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// The kqueue kernel queue plus the shared wake watcher it owns.
pub(crate) struct Backend {
    kqueue: OwnedFd,
    notifier: Arc<Notifier>,
    events: Vec<libc::kevent>,
    num_events: usize,
}

impl Backend {
    pub(crate) fn new(options: &Options) -> Result<Self> {
        if options.api_type == ApiType::ForceUseIoUring {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_context("io_uring backend is not available in this build"));
        }

        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::last_os_error("kqueue"));
        }
        let kqueue = unsafe { OwnedFd::from_raw_fd(kq) };
        let notifier = Arc::new(Notifier::new()?);

        let mut backend = Self {
            kqueue,
            notifier,
            events: vec![unsafe { MaybeUninit::<libc::kevent>::zeroed().assume_init() }; EVENT_BATCH],
            num_events: 0,
        };
        backend.add_watch(
            crate::backend::WAKE_TOKEN,
            backend.notifier.fd() as libc::uintptr_t,
            libc::EVFILT_READ,
            0,
        )?;
        Ok(backend)
    }

    pub(crate) fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    pub(crate) fn loop_fd(&self) -> RawFd {
        self.kqueue.as_raw_fd()
    }

    pub(crate) fn sync(
        &mut self,
        loop_time: &mut Instant,
        next_timer: Option<Instant>,
        mode: SyncMode,
    ) -> Result<()> {
        self.num_events = 0;
        loop {
            let spec;
            let spec_ptr: *const libc::timespec = match mode {
                SyncMode::NoWait => {
                    spec = libc::timespec {
                        tv_sec: 0,
                        tv_nsec: 0,
                    };
                    &spec
                }
                SyncMode::ForcedForwardProgress => match next_timer {
                    Some(deadline) => {
                        spec = clock::duration_to_timespec(clock::wait_until(*loop_time, deadline));
                        &spec
                    }
                    None => ptr::null(),
                },
            };
            let res = unsafe {
                libc::kevent(
                    self.kqueue.as_raw_fd(),
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    spec_ptr,
                )
            };
            if res < 0 {
                if errno() == libc::EINTR {
                    *loop_time = clock::snap();
                    continue;
                }
                return Err(Error::last_os_error("kevent"));
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
            token: ev.udata as usize as u64,
            data: ev.data as i64,
        }
    }

    pub(crate) fn validate_event(&self, idx: usize) -> Result<bool> {
        let ev = &self.events[idx];
        if ev.flags & libc::EV_ERROR != 0 {
            return Err(Error::new(ErrorKind::Kernel).with_context("kqueue reported EV_ERROR"));
        }
        Ok(ev.flags & libc::EV_DELETE == 0)
    }

    pub(crate) fn drain_wake(&mut self) {
        self.notifier.drain();
    }

    /// SIGCHLD is a Linux signalfd concern; kqueue delivers process exits
    /// through per-request `EVFILT_PROC` watchers.
    pub(crate) fn next_sigchld(&mut self) -> Option<(libc::pid_t, i32)> {
        None
    }

    // ------------------------------------------------------------------
    // Per-kind lifecycle operations
    // ------------------------------------------------------------------

    pub(crate) fn setup(
        &mut self,
        token: u64,
        _flags: &mut RequestFlags,
        payload: &mut Payload,
    ) -> Result<Staged> {
        match payload {
            Payload::Timeout(_) | Payload::WakeUp(_) => Ok(Staged::Armed),
            Payload::ProcessExit(st) => {
                self.add_watch(
                    token,
                    st.pid as libc::uintptr_t,
                    libc::EVFILT_PROC,
                    PROC_EXIT_FFLAGS,
                )?;
                Ok(Staged::Armed)
            }
            Payload::SocketAccept(st) => {
                self.add_watch(token, st.socket as libc::uintptr_t, libc::EVFILT_READ, 0)?;
                Ok(Staged::Armed)
            }
            Payload::SocketConnect(st) => {
                self.add_watch(token, st.socket as libc::uintptr_t, libc::EVFILT_WRITE, 0)?;
                Ok(Staged::Armed)
            }
            Payload::SocketSend(st) => {
                self.add_watch(token, st.socket as libc::uintptr_t, libc::EVFILT_WRITE, 0)?;
                Ok(Staged::Armed)
            }
            Payload::SocketReceive(st) => {
                self.add_watch(token, st.socket as libc::uintptr_t, libc::EVFILT_READ, 0)?;
                Ok(Staged::Armed)
            }
            Payload::SocketClose(st) => {
                close_fd(st.socket)?;
                Ok(Staged::Manual)
            }
            Payload::FileRead(st) => {
                self.add_watch(token, st.file as libc::uintptr_t, libc::EVFILT_READ, 0)?;
                Ok(Staged::Armed)
            }
            Payload::FileWrite(st) => {
                self.add_watch(token, st.file as libc::uintptr_t, libc::EVFILT_WRITE, 0)?;
                Ok(Staged::Armed)
            }
            Payload::FileClose(st) => {
                close_fd(st.file)?;
                Ok(Staged::Manual)
            }
            Payload::FilePoll(st) => {
                self.add_watch(token, st.file as libc::uintptr_t, libc::EVFILT_READ, 0)?;
                Ok(Staged::Armed)
            }
        }
    }

    pub(crate) fn activate(
        &mut self,
        _token: u64,
        _flags: &RequestFlags,
        payload: &mut Payload,
    ) -> Result<Staged> {
        match payload {
            Payload::SocketConnect(st) => {
                let addr = socket2::SockAddr::from(st.addr);
                let res = unsafe { libc::connect(st.socket, addr.as_ptr().cast(), addr.len()) };
                if res == 0 {
                    return Ok(Staged::Armed);
                }
                match errno() {
                    libc::EINPROGRESS | libc::EAGAIN => Ok(Staged::Armed),
                    _ => Err(Error::last_os_error("connect")),
                }
            }
            _ => Ok(Staged::Armed),
        }
    }

    pub(crate) fn complete(
        &mut self,
        event: Option<RawEvent>,
        _flags: &RequestFlags,
        payload: &mut Payload,
    ) -> Result<()> {
        match payload {
            Payload::Timeout(_) | Payload::WakeUp(_) => Ok(()),
            Payload::ProcessExit(st) => {
                let event = event.ok_or_else(|| {
                    Error::new(ErrorKind::Internal)
                        .with_context("process exit completed without a kernel event")
                })?;
                let status = event.data as libc::c_int;
                st.exit_code = Some(if libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else {
                    status
                });
                Ok(())
            }
            Payload::SocketAccept(st) => {
                let fd = unsafe { libc::accept(st.socket, ptr::null_mut(), ptr::null_mut()) };
                if fd < 0 {
                    return Err(Error::last_os_error("accept"));
                }
                let accepted = unsafe { OwnedFd::from_raw_fd(fd) };
                set_nonblocking_cloexec(accepted.as_raw_fd())?;
                st.accepted = Some(accepted);
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
                        .with_source(std::io::Error::from_raw_os_error(so_error)));
                }
                Ok(())
            }
            Payload::SocketSend(st) => execute_socket_send(st),
            Payload::SocketReceive(st) => execute_socket_receive(st),
            Payload::SocketClose(_) | Payload::FileClose(_) => Ok(()),
            Payload::FileRead(st) => execute_file_read(st),
            Payload::FileWrite(st) => execute_file_write(st),
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

    fn add_watch(
        &mut self,
        token: u64,
        ident: libc::uintptr_t,
        filter: i16,
        fflags: u32,
    ) -> Result<()> {
        let change = libc::kevent {
            ident,
            filter,
            flags: libc::EV_ADD | libc::EV_ENABLE,
            fflags,
            data: 0,
            udata: token as usize as *mut libc::c_void,
        };
        self.apply_change(&change, "kevent EV_ADD")
    }

    /// Removes a watcher. EBADF and ENOENT are not errors.
    fn remove_watch(&mut self, ident: libc::uintptr_t, filter: i16) -> Result<()> {
        let change = libc::kevent {
            ident,
            filter,
            flags: libc::EV_DELETE,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        match self.apply_change(&change, "kevent EV_DELETE") {
            Ok(()) => Ok(()),
            Err(_) if matches!(errno(), libc::EBADF | libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn apply_change(&mut self, change: &libc::kevent, ctx: &'static str) -> Result<()> {
        loop {
            let res = unsafe {
                libc::kevent(
                    self.kqueue.as_raw_fd(),
                    change,
                    1,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            };
            if res == 0 {
                return Ok(());
            }
            if errno() == libc::EINTR {
                continue;
            }
            return Err(Error::last_os_error(ctx));
        }
    }

    fn remove_registration(&mut self, _flags: RequestFlags, payload: &Payload) -> Result<()> {
        match payload {
            Payload::Timeout(_) | Payload::WakeUp(_) => Ok(()),
            Payload::ProcessExit(st) => {
                self.remove_watch(st.pid as libc::uintptr_t, libc::EVFILT_PROC)
            }
            Payload::SocketAccept(st) => {
                self.remove_watch(st.socket as libc::uintptr_t, libc::EVFILT_READ)
            }
            Payload::SocketConnect(st) => {
                self.remove_watch(st.socket as libc::uintptr_t, libc::EVFILT_WRITE)
            }
            Payload::SocketSend(st) => {
                self.remove_watch(st.socket as libc::uintptr_t, libc::EVFILT_WRITE)
            }
            Payload::SocketReceive(st) => {
                self.remove_watch(st.socket as libc::uintptr_t, libc::EVFILT_READ)
            }
            Payload::SocketClose(_) | Payload::FileClose(_) => Ok(()),
            Payload::FileRead(st) => {
                self.remove_watch(st.file as libc::uintptr_t, libc::EVFILT_READ)
            }
            Payload::FileWrite(st) => {
                self.remove_watch(st.file as libc::uintptr_t, libc::EVFILT_WRITE)
            }
            Payload::FilePoll(st) => {
                self.remove_watch(st.file as libc::uintptr_t, libc::EVFILT_READ)
            }
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os_error("fcntl F_SETFL"));
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error("fcntl F_SETFD"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_round_trip() {
        let notifier = Notifier::new().expect("notifier");
        assert!(!notifier.drain());
        notifier.notify().expect("notify");
        notifier.notify().expect("second notify");
        assert!(notifier.drain());
        assert!(!notifier.drain());
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
            .add_watch(42, a.as_raw_fd() as libc::uintptr_t, libc::EVFILT_READ, 0)
            .expect("add");
        backend
            .remove_watch(a.as_raw_fd() as libc::uintptr_t, libc::EVFILT_READ)
            .expect("remove");
        backend
            .remove_watch(a.as_raw_fd() as libc::uintptr_t, libc::EVFILT_READ)
            .expect("second remove reports ENOENT as success");
    }
}
