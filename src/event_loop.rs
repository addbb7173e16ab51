//! The event loop: submission, activation, completion, cancellation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          EventLoop                               │
//! │  ┌──────────────┐   ┌───────────────┐   ┌─────────────────────┐  │
//! │  │ Request arena│   │ Submission /  │   │      Backend        │  │
//! │  │ (records,    │   │ manual queues │   │ (epoll / kqueue +   │  │
//! │  │  gen. ids)   │   │ + active sets │   │  wake endpoint)     │  │
//! │  └──────────────┘   └───────────────┘   └─────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One step ([`run_once`](EventLoop::run_once)) drains the submission
//! queue (kernel setup + activation per request), blocks in the kernel
//! wait bounded by the earliest timer, dispatches expired timers and fired
//! events to their completion handlers, runs the user callbacks, and
//! finally drains the manual-completion queue. Requests whose callback
//! asked for reactivation go back onto the submission queue and are
//! processed by the next step.
//!
//! # Threading
//!
//! The loop is single-threaded and cooperative: every request mutation and
//! every callback runs on the thread calling `run*`. The only thread-safe
//! entry point is [`crate::WakeUpHandle::wake_up`].

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::arena::{RequestArena, RequestId};
use crate::backend::{Backend, Staged, SyncMode, SIGCHLD_TOKEN, WAKE_TOKEN};
use crate::clock;
use crate::error::{Error, ErrorKind, Result};
use crate::request::{
    Accepted, Callback, Completion, ExitStatus, FileCloseState, FilePollState, FileReadState,
    FileWriteState, Payload, ProcessExitState, Record, RequestFlags, RequestKind, RequestState,
    SocketAcceptState, SocketCloseState, SocketConnectState, SocketReceiveState, SocketSendState,
    TimeoutState, Transferred, WakeUpState,
};
use crate::net::AddressFamily;
use crate::wake::{EventObject, WakeUpHandle};

static NEXT_LOOP_ID: AtomicU32 = AtomicU32::new(0);

/// Which kernel API [`EventLoop::create`] may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApiType {
    /// Pick the best available facility for the platform.
    #[default]
    Automatic,
    /// Require io_uring; creation fails with `Unsupported` on builds
    /// without it.
    ForceUseIoUring,
    /// Never use io_uring even where available.
    DisableIoUring,
}

/// Options for [`EventLoop::create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Kernel API selection.
    pub api_type: ApiType,
}

/// Per-kind FIFO sets of active requests.
#[derive(Default)]
struct ActiveSets {
    timeouts: Vec<RequestId>,
    wake_ups: Vec<RequestId>,
    process_exits: Vec<RequestId>,
    socket_accepts: Vec<RequestId>,
    socket_connects: Vec<RequestId>,
    socket_sends: Vec<RequestId>,
    socket_receives: Vec<RequestId>,
    socket_closes: Vec<RequestId>,
    file_reads: Vec<RequestId>,
    file_writes: Vec<RequestId>,
    file_closes: Vec<RequestId>,
    file_polls: Vec<RequestId>,
}

impl ActiveSets {
    fn list_mut(&mut self, kind: RequestKind) -> &mut Vec<RequestId> {
        match kind {
            RequestKind::LoopTimeout => &mut self.timeouts,
            RequestKind::LoopWakeUp => &mut self.wake_ups,
            RequestKind::ProcessExit => &mut self.process_exits,
            RequestKind::SocketAccept => &mut self.socket_accepts,
            RequestKind::SocketConnect => &mut self.socket_connects,
            RequestKind::SocketSend => &mut self.socket_sends,
            RequestKind::SocketReceive => &mut self.socket_receives,
            RequestKind::SocketClose => &mut self.socket_closes,
            RequestKind::FileRead => &mut self.file_reads,
            RequestKind::FileWrite => &mut self.file_writes,
            RequestKind::FileClose => &mut self.file_closes,
            RequestKind::FilePoll => &mut self.file_polls,
        }
    }

    fn total_len(&self) -> usize {
        self.timeouts.len()
            + self.wake_ups.len()
            + self.process_exits.len()
            + self.socket_accepts.len()
            + self.socket_connects.len()
            + self.socket_sends.len()
            + self.socket_receives.len()
            + self.socket_closes.len()
            + self.file_reads.len()
            + self.file_writes.len()
            + self.file_closes.len()
            + self.file_polls.len()
    }

    fn clear(&mut self) {
        self.timeouts.clear();
        self.wake_ups.clear();
        self.process_exits.clear();
        self.socket_accepts.clear();
        self.socket_connects.clear();
        self.socket_sends.clear();
        self.socket_receives.clear();
        self.socket_closes.clear();
        self.file_reads.clear();
        self.file_writes.clear();
        self.file_closes.clear();
        self.file_polls.clear();
    }
}

/// A callback-driven asynchronous I/O event loop.
///
/// Created with [`create`](Self::create), driven with
/// [`run`](Self::run)/[`run_once`](Self::run_once)/
/// [`run_no_wait`](Self::run_no_wait), released with
/// [`close`](Self::close) (or drop).
pub struct EventLoop {
    loop_id: u32,
    backend: Option<Backend>,
    requests: RequestArena<Record>,
    submissions: VecDeque<RequestId>,
    manual_completions: VecDeque<RequestId>,
    active: ActiveSets,
    num_active_handles: i32,
    num_externals: i32,
    loop_time: Instant,
}

impl EventLoop {
    /// Creates the loop's kernel objects (kernel queue, wake-up endpoint,
    /// and on Linux the SIGCHLD signalfd).
    pub fn create(options: Options) -> Result<Self> {
        let backend = Backend::new(&options)?;
        let loop_id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(loop_id, "event loop created");
        Ok(Self {
            loop_id,
            backend: Some(backend),
            requests: RequestArena::new(loop_id),
            submissions: VecDeque::new(),
            manual_completions: VecDeque::new(),
            active: ActiveSets::default(),
            num_active_handles: 0,
            num_externals: 0,
            loop_time: clock::snap(),
        })
    }

    /// Detaches every queued and active request and releases the kernel
    /// objects. No callbacks fire for still-pending requests. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let detached = self.requests.drain_all();
        if !detached.is_empty() {
            debug!(count = detached.len(), "close detached pending requests");
        }
        drop(detached);
        self.submissions.clear();
        self.manual_completions.clear();
        self.active.clear();
        self.num_active_handles = 0;
        self.num_externals = 0;
        self.backend = None;
        Ok(())
    }

    /// Runs steps until there are no more active handles, queued
    /// submissions or pending manual completions.
    pub fn run(&mut self) -> Result<()> {
        while self.total_active_handles() > 0
            || !self.submissions.is_empty()
            || !self.manual_completions.is_empty()
        {
            self.run_once()?;
        }
        Ok(())
    }

    /// Runs a single step, blocking until at least one event (bounded by
    /// the earliest timer).
    pub fn run_once(&mut self) -> Result<()> {
        self.run_step(SyncMode::ForcedForwardProgress)
    }

    /// Runs a single step without blocking; returns immediately if the
    /// kernel has nothing ready.
    pub fn run_no_wait(&mut self) -> Result<()> {
        self.run_step(SyncMode::NoWait)
    }

    /// Number of requests currently counted as active handles.
    #[must_use]
    pub const fn num_active_handles(&self) -> i32 {
        self.num_active_handles
    }

    /// Keeps [`run`](Self::run) alive for an event not managed by this
    /// loop.
    pub fn increase_active_count(&mut self) {
        self.num_externals += 1;
    }

    /// Releases an external keep-alive taken with
    /// [`increase_active_count`](Self::increase_active_count).
    pub fn decrease_active_count(&mut self) {
        self.num_externals -= 1;
    }

    /// The monotonic instant snapped at the start of the current step.
    #[must_use]
    pub const fn loop_time(&self) -> Instant {
        self.loop_time
    }

    /// The kernel queue descriptor, for embedders that drive auxiliary
    /// kernel objects against the same queue.
    pub fn loop_fd(&self) -> Result<RawFd> {
        Ok(self.backend_ref()?.loop_fd())
    }

    /// Attaches a diagnostic name to a pending request, surfaced in
    /// lifecycle tracing.
    pub fn set_debug_name(&mut self, id: RequestId, name: &'static str) -> Result<()> {
        self.check_same_loop(id)?;
        let record = self
            .requests
            .get_mut(id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidState).with_context("request is not active"))?;
        record.debug_name = Some(name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start operations
    // ------------------------------------------------------------------

    /// Starts a timeout invoked once `expiration` has passed.
    pub fn start_timeout(
        &mut self,
        expiration: Duration,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        self.update_time();
        let expires_at = self.loop_time + expiration;
        self.queue_submission(Payload::Timeout(TimeoutState {
            interval: expiration,
            expires_at,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts a wake-up request and returns a thread-safe handle for it.
    ///
    /// The callback runs on the loop thread after any thread calls
    /// [`WakeUpHandle::wake_up`]. If `event_object` is given, it is
    /// signaled right after the callback returns, letting the waking
    /// thread block until the callback has executed.
    pub fn start_wake_up(
        &mut self,
        event_object: Option<Arc<EventObject>>,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<(RequestId, WakeUpHandle)> {
        let notifier = self.backend_ref()?.notifier();
        let pending = Arc::new(AtomicBool::new(false));
        let handle = WakeUpHandle::new(Arc::clone(&pending), notifier);
        let id = self.queue_submission(Payload::WakeUp(WakeUpState {
            pending,
            event_object,
            callback: Some(Box::new(callback)),
        }))?;
        Ok((id, handle))
    }

    /// Starts a process-exit notification for the child with the given
    /// pid. The completion carries the child's exit status.
    pub fn start_process_exit(
        &mut self,
        pid: i32,
        callback: impl FnMut(&mut Completion<'_, ExitStatus>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        self.queue_submission(Payload::ProcessExit(ProcessExitState {
            pid: pid as libc::pid_t,
            exit_code: None,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts an accept on a listening socket created with async flags
    /// (see [`create_async_tcp_socket`](Self::create_async_tcp_socket)).
    pub fn start_socket_accept(
        &mut self,
        socket: RawFd,
        family: AddressFamily,
        callback: impl FnMut(&mut Completion<'_, Accepted>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(socket)?;
        self.queue_submission(Payload::SocketAccept(SocketAcceptState {
            socket,
            family,
            accepted: None,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts a connect to `addr` on a non-blocking socket.
    pub fn start_socket_connect(
        &mut self,
        socket: RawFd,
        addr: std::net::SocketAddr,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(socket)?;
        self.queue_submission(Payload::SocketConnect(SocketConnectState {
            socket,
            addr,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts sending `data` on a connected socket. The completion hands
    /// the buffer back with the number of bytes written.
    pub fn start_socket_send(
        &mut self,
        socket: RawFd,
        data: Vec<u8>,
        callback: impl FnMut(&mut Completion<'_, Transferred>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(socket)?;
        check_buffer(&data)?;
        self.queue_submission(Payload::SocketSend(SocketSendState {
            socket,
            buffer: data,
            sent: 0,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts receiving into `buffer` (its length is the read window). The
    /// completion's [`Transferred::data`] is the filled prefix; zero bytes
    /// after a connection means the peer closed and completes with
    /// `PeerClosed`.
    pub fn start_socket_receive(
        &mut self,
        socket: RawFd,
        buffer: Vec<u8>,
        callback: impl FnMut(&mut Completion<'_, Transferred>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(socket)?;
        check_buffer(&buffer)?;
        self.queue_submission(Payload::SocketReceive(SocketReceiveState {
            socket,
            buffer,
            received: 0,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts closing a socket. The descriptor is closed synchronously at
    /// submission time; the callback is delivered as a manual completion.
    pub fn start_socket_close(
        &mut self,
        socket: RawFd,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(socket)?;
        self.queue_submission(Payload::SocketClose(SocketCloseState {
            socket,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts a file read into `buffer`. `offset` zero reads at the
    /// current position; non-zero issues positional I/O.
    pub fn start_file_read(
        &mut self,
        file: RawFd,
        buffer: Vec<u8>,
        offset: u64,
        callback: impl FnMut(&mut Completion<'_, Transferred>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(file)?;
        check_buffer(&buffer)?;
        self.queue_submission(Payload::FileRead(FileReadState {
            file,
            buffer,
            offset,
            transferred: 0,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts a file write of `data` at `offset` (zero writes at the
    /// current position). The completion carries the bytes written.
    pub fn start_file_write(
        &mut self,
        file: RawFd,
        data: Vec<u8>,
        offset: u64,
        callback: impl FnMut(&mut Completion<'_, Transferred>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(file)?;
        check_buffer(&data)?;
        self.queue_submission(Payload::FileWrite(FileWriteState {
            file,
            buffer: data,
            offset,
            transferred: 0,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts closing a file descriptor; delivered as a manual completion.
    pub fn start_file_close(
        &mut self,
        file: RawFd,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(file)?;
        self.queue_submission(Payload::FileClose(FileCloseState {
            file,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Starts a readiness notification on a descriptor without
    /// transferring data.
    pub fn start_file_poll(
        &mut self,
        file: RawFd,
        callback: impl FnMut(&mut Completion<'_, ()>) + 'static,
    ) -> Result<RequestId> {
        self.ensure_open()?;
        check_handle(file)?;
        self.queue_submission(Payload::FilePoll(FilePollState {
            file,
            callback: Some(Box::new(callback)),
        }))
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Asks to stop a pending request.
    ///
    /// After this returns `Ok`, the request's callback will not be invoked
    /// for the current activation. Legal from the `Setup`, `Submitting`
    /// and `Active` states; anything else fails with `InvalidState`.
    pub fn cancel(&mut self, id: RequestId) -> Result<()> {
        self.check_same_loop(id)?;
        let Some(record) = self.requests.get(id) else {
            return Err(Error::new(ErrorKind::InvalidState)
                .with_context("trying to stop a request that is not active"));
        };
        let state = record.state;
        let manual = record.flags.contains(RequestFlags::MANUAL_COMPLETION);
        trace!(request = ?id, kind = %record.kind(), ?state, "cancel");
        match state {
            RequestState::Active => {
                self.remove_active_handle(id, RequestState::Cancelling);
                if manual {
                    // Manual completions would otherwise still deliver.
                    self.manual_completions.retain(|x| *x != id);
                }
                self.submissions.push_back(id);
                Ok(())
            }
            RequestState::Submitting => {
                if let Some(record) = self.requests.get_mut(id) {
                    record.state = RequestState::Teardown;
                }
                Ok(())
            }
            RequestState::Setup => {
                self.submissions.retain(|x| *x != id);
                self.requests.remove(id);
                Ok(())
            }
            RequestState::Teardown | RequestState::Cancelling => {
                Err(Error::new(ErrorKind::InvalidState)
                    .with_context("request is already being cancelled"))
            }
            RequestState::Free => Err(Error::new(ErrorKind::InvalidState)
                .with_context("trying to stop a request that is not active")),
        }
    }

    // ------------------------------------------------------------------
    // Step machinery
    // ------------------------------------------------------------------

    fn run_step(&mut self, mode: SyncMode) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        backend.reset_events();
        self.update_time();
        debug_assert_eq!(
            self.num_active_handles as usize,
            self.active.total_len(),
            "active-handle counter out of sync with per-kind lists"
        );

        while let Some(id) = self.submissions.pop_front() {
            if let Err(err) = self.stage_submission(id) {
                self.report_error(id, err);
            }
        }

        if self.total_active_handles() <= 0 && self.manual_completions.is_empty() {
            // Happens when the last active request was just cancelled.
            return Ok(());
        }

        if self.total_active_handles() > 0 {
            let next_timer = match mode {
                SyncMode::ForcedForwardProgress => self.find_earliest_timer(),
                SyncMode::NoWait => None,
            };
            let Some(backend) = self.backend.as_mut() else {
                return Ok(());
            };
            backend.sync(&mut self.loop_time, next_timer, mode)?;
            if let Some(deadline) = next_timer {
                self.execute_timers(deadline);
            }
        }

        self.run_step_execute_completions();
        self.run_step_execute_manual_completions();
        Ok(())
    }

    fn stage_submission(&mut self, id: RequestId) -> Result<()> {
        let Some(record) = self.requests.get(id) else {
            // Cancelled between queueing and staging; dropped silently.
            return Ok(());
        };
        match record.state {
            RequestState::Setup => {
                self.setup_async(id)?;
                self.activate_async(id)
            }
            RequestState::Submitting => self.activate_async(id),
            RequestState::Cancelling => {
                if let Err(err) = self.cancel_async(id).and_then(|()| self.teardown_async(id)) {
                    // Cancellation promised no further callbacks; log and
                    // drop the request regardless.
                    debug!(request = ?id, %err, "cancel cleanup failed");
                }
                self.requests.remove(id);
                Ok(())
            }
            RequestState::Teardown => {
                if let Err(err) = self.teardown_async(id) {
                    debug!(request = ?id, %err, "teardown failed");
                }
                self.requests.remove(id);
                Ok(())
            }
            RequestState::Free => Ok(()),
            RequestState::Active => Err(Error::new(ErrorKind::Internal)
                .with_context("submission queue contained an active request")),
        }
    }

    fn setup_async(&mut self, id: RequestId) -> Result<()> {
        let staged = {
            let Some(backend) = self.backend.as_mut() else {
                return Err(closed_error());
            };
            let Some(record) = self.requests.get_mut(id) else {
                return Err(internal_gone());
            };
            trace!(request = ?id, kind = %record.kind(), name = record.name(), "setup");
            let staged = backend.setup(id.token(), &mut record.flags, &mut record.payload)?;
            record.state = RequestState::Submitting;
            staged
        };
        if staged == Staged::Manual {
            self.schedule_manual_completion(id);
        }
        Ok(())
    }

    fn activate_async(&mut self, id: RequestId) -> Result<()> {
        let staged = {
            let Some(backend) = self.backend.as_mut() else {
                return Err(closed_error());
            };
            let Some(record) = self.requests.get_mut(id) else {
                return Err(internal_gone());
            };
            debug_assert_eq!(record.state, RequestState::Submitting);
            trace!(request = ?id, kind = %record.kind(), "activate");
            backend.activate(id.token(), &record.flags, &mut record.payload)?
        };
        if staged == Staged::Manual {
            self.schedule_manual_completion(id);
        }
        self.add_active_handle(id);
        Ok(())
    }

    fn cancel_async(&mut self, id: RequestId) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let Some(record) = self.requests.get(id) else {
            return Ok(());
        };
        trace!(request = ?id, kind = %record.kind(), "kernel cancel");
        backend.cancel(record.flags, &record.payload)
    }

    fn teardown_async(&mut self, id: RequestId) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let Some(record) = self.requests.get(id) else {
            return Ok(());
        };
        trace!(request = ?id, kind = %record.kind(), "teardown");
        backend.teardown(record.flags, &record.payload)
    }

    fn schedule_manual_completion(&mut self, id: RequestId) {
        if let Some(record) = self.requests.get_mut(id) {
            record.flags.insert(RequestFlags::MANUAL_COMPLETION);
        }
        self.manual_completions.push_back(id);
    }

    fn add_active_handle(&mut self, id: RequestId) {
        let Some(record) = self.requests.get_mut(id) else {
            return;
        };
        debug_assert_eq!(record.state, RequestState::Submitting);
        record.state = RequestState::Active;
        let kind = record.kind();
        if record.flags.contains(RequestFlags::MANUAL_COMPLETION) {
            // Manually completed requests are not counted as active
            // handles and sit on the manual queue instead of a kind list.
            return;
        }
        self.num_active_handles += 1;
        self.active.list_mut(kind).push(id);
    }

    fn remove_active_handle(&mut self, id: RequestId, next_state: RequestState) {
        let Some(record) = self.requests.get_mut(id) else {
            return;
        };
        debug_assert_eq!(record.state, RequestState::Active);
        record.state = next_state;
        let kind = record.kind();
        if record.flags.contains(RequestFlags::MANUAL_COMPLETION) {
            return;
        }
        self.num_active_handles -= 1;
        let list = self.active.list_mut(kind);
        if let Some(pos) = list.iter().position(|x| *x == id) {
            list.remove(pos);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn find_earliest_timer(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for &id in &self.active.timeouts {
            if let Some(record) = self.requests.get(id) {
                if let Payload::Timeout(st) = &record.payload {
                    if earliest.map_or(true, |e| e >= st.expires_at) {
                        earliest = Some(st.expires_at);
                    }
                }
            }
        }
        earliest
    }

    fn execute_timers(&mut self, next_timer: Instant) {
        let no_io = self.backend.as_ref().map_or(true, |b| b.num_events() == 0);
        let already_expired = self.loop_time >= next_timer;
        if !no_io && !already_expired {
            return;
        }
        if already_expired {
            self.update_time();
        } else {
            self.loop_time = next_timer;
        }
        self.invoke_expired_timers();
    }

    fn invoke_expired_timers(&mut self) {
        // Snapshot: callbacks may start new timers, which only fire from
        // the next step.
        let snapshot = self.active.timeouts.clone();
        for id in snapshot {
            let expired = matches!(
                self.requests.get(id).map(|r| &r.payload),
                Some(Payload::Timeout(st)) if self.loop_time >= st.expires_at
            );
            if expired {
                self.dispatch_timer(id);
            }
        }
    }

    fn dispatch_timer(&mut self, id: RequestId) {
        // Detach first: the callback observes the request already free and
        // may start it anew.
        self.remove_active_handle(id, RequestState::Free);
        let callback = match self.requests.get_mut(id).map(|r| &mut r.payload) {
            Some(Payload::Timeout(st)) => st.callback.take(),
            _ => None,
        };
        let Some(mut callback) = callback else {
            self.requests.remove(id);
            return;
        };
        trace!(request = ?id, "timer fired");
        let (reactivate, _) = self.deliver(id, &mut callback, Ok(()));
        if reactivate {
            let loop_time = self.loop_time;
            if let Some(record) = self.requests.get_mut(id) {
                if record.state == RequestState::Free {
                    if let Payload::Timeout(st) = &mut record.payload {
                        st.callback = Some(callback);
                        st.expires_at = loop_time + st.interval;
                    }
                    record.state = RequestState::Submitting;
                    self.submissions.push_back(id);
                    return;
                }
            }
        }
        self.requests.remove(id);
    }

    // ------------------------------------------------------------------
    // Wake-ups and process exits
    // ------------------------------------------------------------------

    fn execute_wake_ups(&mut self) {
        let snapshot = self.active.wake_ups.clone();
        for id in snapshot {
            let shared = match self.requests.get(id).map(|r| &r.payload) {
                Some(Payload::WakeUp(st)) => {
                    Some((Arc::clone(&st.pending), st.event_object.clone()))
                }
                _ => None,
            };
            let Some((pending, event_object)) = shared else {
                continue;
            };
            if !pending.load(Ordering::Acquire) {
                continue;
            }
            let callback = match self.requests.get_mut(id).map(|r| &mut r.payload) {
                Some(Payload::WakeUp(st)) => st.callback.take(),
                _ => None,
            };
            let Some(mut callback) = callback else {
                pending.store(false, Ordering::Release);
                continue;
            };
            trace!(request = ?id, "wake-up fired");
            let (reactivate, _) = self.deliver(id, &mut callback, Ok(()));
            if let Some(event_object) = &event_object {
                event_object.signal();
            }
            // Cleared after the callback, so wakes arriving meanwhile
            // coalesced into this delivery.
            pending.store(false, Ordering::Release);
            match self.requests.get(id).map(|r| r.state) {
                Some(RequestState::Active) if reactivate => {
                    if let Some(record) = self.requests.get_mut(id) {
                        if let Payload::WakeUp(st) = &mut record.payload {
                            st.callback = Some(callback);
                        }
                    }
                    self.remove_active_handle(id, RequestState::Submitting);
                    self.submissions.push_back(id);
                }
                Some(RequestState::Active) => self.teardown_and_vacate(id),
                _ => {}
            }
        }
    }

    fn execute_process_exits(&mut self) {
        loop {
            let Some((pid, status)) = self.backend.as_mut().and_then(Backend::next_sigchld)
            else {
                break;
            };
            let matching = self.active.process_exits.iter().copied().find(|&id| {
                matches!(
                    self.requests.get(id).map(|r| &r.payload),
                    Some(Payload::ProcessExit(st)) if st.pid == pid
                )
            });
            let Some(id) = matching else {
                // A child nobody is watching; ignore.
                continue;
            };
            if let Some(Payload::ProcessExit(st)) =
                self.requests.get_mut(id).map(|r| &mut r.payload)
            {
                st.exit_code = Some(status);
            }
            self.complete_and_eventually_reactivate(id, Ok(()));
        }
    }

    // ------------------------------------------------------------------
    // Completion dispatch
    // ------------------------------------------------------------------

    fn run_step_execute_completions(&mut self) {
        let count = self.backend.as_ref().map_or(0, Backend::num_events);
        for idx in 0..count {
            let Some(backend) = self.backend.as_ref() else {
                // A callback closed the loop mid-step.
                return;
            };
            let token = backend.event(idx).token;
            let validation = backend.validate_event(idx);

            if token == WAKE_TOKEN {
                if validation.is_ok() {
                    if let Some(backend) = self.backend.as_mut() {
                        backend.drain_wake();
                    }
                    self.execute_wake_ups();
                }
                continue;
            }
            if token == SIGCHLD_TOKEN {
                if validation.is_ok() {
                    self.execute_process_exits();
                }
                continue;
            }

            let Some(id) = self.requests.get_token(token) else {
                trace!(token, "stale kernel event");
                continue;
            };
            let continue_processing = match validation {
                Ok(cont) => cont,
                Err(err) => {
                    self.report_error(id, err);
                    continue;
                }
            };
            if !continue_processing {
                continue;
            }
            let state = {
                let Some(record) = self.requests.get_mut(id) else {
                    continue;
                };
                record.event_index = Some(idx);
                record.state
            };
            if state == RequestState::Active {
                self.complete_and_eventually_reactivate(id, Ok(()));
            }
            // Anything else is a completion racing a staged cancel; the
            // queued cancel owns the cleanup and the event is suppressed.
        }
    }

    fn run_step_execute_manual_completions(&mut self) {
        // Take the whole queue: entries re-scheduled while draining are
        // delivered no earlier than the next step.
        let mut queue = std::mem::take(&mut self.manual_completions);
        while let Some(id) = queue.pop_front() {
            self.complete_and_eventually_reactivate(id, Ok(()));
        }
    }

    fn backend_complete(&mut self, id: RequestId) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Err(closed_error());
        };
        let Some(record) = self.requests.get_mut(id) else {
            return Err(internal_gone());
        };
        let event = record.event_index.map(|idx| backend.event(idx));
        backend.complete(event, &record.flags, &mut record.payload)
    }

    fn complete_and_eventually_reactivate(&mut self, id: RequestId, base: Result<()>) {
        let Some(record) = self.requests.get(id) else {
            return;
        };
        if record.state != RequestState::Active {
            // A cancel raced this completion; suppress it.
            return;
        }
        let kind = record.kind();
        trace!(request = ?id, %kind, ok = base.is_ok(), "complete");

        let completed = match base {
            Ok(()) => self.backend_complete(id),
            Err(err) => Err(err),
        };

        match kind {
            RequestKind::LoopTimeout | RequestKind::LoopWakeUp => {
                // These complete through their dedicated paths; a kernel
                // completion for them is a loop bug.
                self.report_error(
                    id,
                    Error::new(ErrorKind::Internal)
                        .with_context("unexpected kernel completion for a loop-internal kind"),
                );
            }
            RequestKind::ProcessExit => {
                let outcome = completed.map(|()| {
                    let code = match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::ProcessExit(st)) => st.exit_code.take().unwrap_or_default(),
                        _ => 0,
                    };
                    ExitStatus { code }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::ProcessExit(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::ProcessExit(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
            RequestKind::SocketAccept => {
                let outcome = completed.and_then(|()| {
                    match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::SocketAccept(st)) => st
                            .accepted
                            .take()
                            .map(|socket| Accepted { socket })
                            .ok_or_else(|| {
                                Error::new(ErrorKind::Internal)
                                    .with_context("accept completed without a socket")
                            }),
                        _ => Err(internal_gone()),
                    }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::SocketAccept(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::SocketAccept(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
            RequestKind::SocketConnect => {
                self.finish(
                    id,
                    completed,
                    |p| match p {
                        Payload::SocketConnect(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::SocketConnect(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
            RequestKind::SocketSend => {
                let outcome = completed.map(|()| {
                    match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::SocketSend(st)) => Transferred {
                            buffer: std::mem::take(&mut st.buffer),
                            len: st.sent,
                        },
                        _ => Transferred::default(),
                    }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::SocketSend(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, leftover| {
                        if let Payload::SocketSend(st) = p {
                            st.callback = Some(cb);
                            st.sent = 0;
                            if let Some(Ok(t)) = leftover {
                                st.buffer = t.buffer;
                            }
                        }
                    },
                );
            }
            RequestKind::SocketReceive => {
                let outcome = completed.map(|()| {
                    match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::SocketReceive(st)) => Transferred {
                            buffer: std::mem::take(&mut st.buffer),
                            len: st.received,
                        },
                        _ => Transferred::default(),
                    }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::SocketReceive(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, leftover| {
                        if let Payload::SocketReceive(st) = p {
                            st.callback = Some(cb);
                            st.received = 0;
                            if let Some(Ok(t)) = leftover {
                                st.buffer = t.buffer;
                            }
                        }
                    },
                );
            }
            RequestKind::SocketClose => {
                self.finish(
                    id,
                    completed,
                    |p| match p {
                        Payload::SocketClose(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::SocketClose(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
            RequestKind::FileRead => {
                let outcome = completed.map(|()| {
                    match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::FileRead(st)) => Transferred {
                            buffer: std::mem::take(&mut st.buffer),
                            len: st.transferred,
                        },
                        _ => Transferred::default(),
                    }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::FileRead(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, leftover| {
                        if let Payload::FileRead(st) = p {
                            st.callback = Some(cb);
                            st.transferred = 0;
                            if let Some(Ok(t)) = leftover {
                                st.buffer = t.buffer;
                            }
                        }
                    },
                );
            }
            RequestKind::FileWrite => {
                let outcome = completed.map(|()| {
                    match self.requests.get_mut(id).map(|r| &mut r.payload) {
                        Some(Payload::FileWrite(st)) => Transferred {
                            buffer: std::mem::take(&mut st.buffer),
                            len: st.transferred,
                        },
                        _ => Transferred::default(),
                    }
                });
                self.finish(
                    id,
                    outcome,
                    |p| match p {
                        Payload::FileWrite(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, leftover| {
                        if let Payload::FileWrite(st) = p {
                            st.callback = Some(cb);
                            st.transferred = 0;
                            if let Some(Ok(t)) = leftover {
                                st.buffer = t.buffer;
                            }
                        }
                    },
                );
            }
            RequestKind::FileClose => {
                self.finish(
                    id,
                    completed,
                    |p| match p {
                        Payload::FileClose(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::FileClose(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
            RequestKind::FilePoll => {
                self.finish(
                    id,
                    completed,
                    |p| match p {
                        Payload::FilePoll(st) => st.callback.take(),
                        _ => None,
                    },
                    |p, cb, _| {
                        if let Payload::FilePoll(st) = p {
                            st.callback = Some(cb);
                        }
                    },
                );
            }
        }
    }

    /// Delivers an outcome through the request's callback and applies the
    /// reactivation decision.
    fn finish<O>(
        &mut self,
        id: RequestId,
        outcome: Result<O>,
        take: impl FnOnce(&mut Payload) -> Option<Callback<O>>,
        restore: impl FnOnce(&mut Payload, Callback<O>, Option<Result<O>>),
    ) {
        let callback = self.requests.get_mut(id).and_then(|r| take(&mut r.payload));
        let Some(mut callback) = callback else {
            self.teardown_and_vacate(id);
            return;
        };
        let (reactivate, leftover) = self.deliver(id, &mut callback, outcome);
        match self.requests.get(id).map(|r| r.state) {
            Some(RequestState::Active) if reactivate => {
                if let Some(record) = self.requests.get_mut(id) {
                    restore(&mut record.payload, callback, leftover);
                }
                self.remove_active_handle(id, RequestState::Submitting);
                if self.reactivation_inputs_valid(id) {
                    self.submissions.push_back(id);
                } else {
                    self.report_error(
                        id,
                        Error::new(ErrorKind::EmptyBuffer)
                            .with_context("reactivated request has no buffer left"),
                    );
                }
            }
            Some(RequestState::Active) => self.teardown_and_vacate(id),
            // Cancelled or closed during the callback; that path owns the
            // cleanup.
            _ => {}
        }
    }

    fn reactivation_inputs_valid(&self, id: RequestId) -> bool {
        match self.requests.get(id).map(|r| &r.payload) {
            Some(Payload::SocketSend(st)) => !st.buffer.is_empty(),
            Some(Payload::SocketReceive(st)) => !st.buffer.is_empty(),
            Some(Payload::FileRead(st)) => !st.buffer.is_empty(),
            Some(Payload::FileWrite(st)) => !st.buffer.is_empty(),
            _ => true,
        }
    }

    fn teardown_and_vacate(&mut self, id: RequestId) {
        if let Err(err) = self.teardown_async(id) {
            debug!(request = ?id, %err, "teardown failed");
        }
        self.remove_active_handle(id, RequestState::Free);
        self.requests.remove(id);
    }

    /// Invokes a callback with a completion object. Returns the
    /// reactivation decision and whatever outcome the callback left
    /// behind.
    fn deliver<O>(
        &mut self,
        id: RequestId,
        callback: &mut Callback<O>,
        outcome: Result<O>,
    ) -> (bool, Option<Result<O>>) {
        let mut completion = Completion {
            event_loop: self,
            request: id,
            outcome: Some(outcome),
            reactivate: false,
        };
        callback(&mut completion);
        let reactivate = completion.reactivate;
        let leftover = completion.outcome.take();
        (reactivate, leftover)
    }

    /// Reports an error by delivering it through the request's callback
    /// and detaching the request. Reactivation is not honored on this
    /// path.
    fn report_error(&mut self, id: RequestId, err: Error) {
        let Some(record) = self.requests.get(id) else {
            debug!(request = ?id, %err, "error for a vanished request");
            return;
        };
        let kind = record.kind();
        debug!(request = ?id, %kind, %err, "request failed");
        if record.state == RequestState::Active {
            self.remove_active_handle(id, RequestState::Free);
        }
        self.take_and_deliver_error(id, kind, err);
        self.requests.remove(id);
    }

    fn take_and_deliver_error(&mut self, id: RequestId, kind: RequestKind, err: Error) {
        let payload = match self.requests.get_mut(id) {
            Some(record) => &mut record.payload,
            None => return,
        };
        match kind {
            RequestKind::LoopTimeout => {
                if let Payload::Timeout(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::LoopWakeUp => {
                if let Payload::WakeUp(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::ProcessExit => {
                if let Payload::ProcessExit(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::SocketAccept => {
                if let Payload::SocketAccept(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::SocketConnect => {
                if let Payload::SocketConnect(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::SocketSend => {
                if let Payload::SocketSend(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::SocketReceive => {
                if let Payload::SocketReceive(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::SocketClose => {
                if let Payload::SocketClose(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::FileRead => {
                if let Payload::FileRead(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::FileWrite => {
                if let Payload::FileWrite(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::FileClose => {
                if let Payload::FileClose(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
            RequestKind::FilePoll => {
                if let Payload::FilePoll(st) = payload {
                    if let Some(mut cb) = st.callback.take() {
                        self.deliver(id, &mut cb, Err(err));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn queue_submission(&mut self, payload: Payload) -> Result<RequestId> {
        let kind = payload.kind();
        let id = self.requests.insert(Record::new(payload));
        self.submissions.push_back(id);
        trace!(request = ?id, %kind, "queue");
        Ok(id)
    }

    fn total_active_handles(&self) -> i32 {
        self.num_active_handles + self.num_externals
    }

    fn update_time(&mut self) {
        self.loop_time = clock::snap();
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.backend.is_some() {
            Ok(())
        } else {
            Err(closed_error())
        }
    }

    pub(crate) fn backend_ref(&self) -> Result<&Backend> {
        self.backend.as_ref().ok_or_else(closed_error)
    }

    fn check_same_loop(&self, id: RequestId) -> Result<()> {
        if id.loop_id == self.loop_id {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::WrongLoop)
                .with_context("request belongs to a different loop"))
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("loop_id", &self.loop_id)
            .field("open", &self.backend.is_some())
            .field("num_active_handles", &self.num_active_handles)
            .field("num_externals", &self.num_externals)
            .field("pending_submissions", &self.submissions.len())
            .finish_non_exhaustive()
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::InvalidHandle).with_context("event loop is closed")
}

fn internal_gone() -> Error {
    Error::new(ErrorKind::Internal).with_context("request record vanished mid-operation")
}

fn check_handle(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::new(ErrorKind::InvalidHandle).with_context("negative descriptor"));
    }
    Ok(())
}

fn check_buffer(buffer: &[u8]) -> Result<()> {
    if buffer.is_empty() {
        return Err(Error::new(ErrorKind::EmptyBuffer).with_context("zero sized buffer"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn new_loop() -> EventLoop {
        EventLoop::create(Options::default()).expect("create loop")
    }

    #[test]
    fn create_and_close_idempotent() {
        let mut el = new_loop();
        assert_eq!(el.num_active_handles(), 0);
        el.close().expect("first close");
        el.close().expect("second close");
        assert_eq!(el.num_active_handles(), 0);
    }

    #[test]
    fn run_with_nothing_pending_returns_immediately() {
        let mut el = new_loop();
        el.run().expect("run");
    }

    #[test]
    fn start_after_close_fails() {
        let mut el = new_loop();
        el.close().expect("close");
        let err = el
            .start_timeout(Duration::from_millis(1), |_| {})
            .expect_err("closed loop rejects starts");
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn empty_buffer_is_rejected_at_start() {
        let mut el = new_loop();
        let err = el
            .start_socket_receive(0, Vec::new(), |_| {})
            .expect_err("empty buffer");
        assert_eq!(err.kind(), ErrorKind::EmptyBuffer);
    }

    #[test]
    fn timer_fires_once_and_detaches() {
        let mut el = new_loop();
        let fired = Rc::new(Cell::new(0u32));
        let witness = Rc::clone(&fired);
        el.start_timeout(Duration::from_millis(10), move |completion| {
            assert!(completion.outcome().is_ok());
            witness.set(witness.get() + 1);
        })
        .expect("start timeout");
        el.run().expect("run");
        assert_eq!(fired.get(), 1);
        assert_eq!(el.num_active_handles(), 0);
    }

    #[test]
    fn timer_reactivation_fires_again() {
        let mut el = new_loop();
        let fired = Rc::new(Cell::new(0u32));
        let witness = Rc::clone(&fired);
        el.start_timeout(Duration::from_millis(1), move |completion| {
            witness.set(witness.get() + 1);
            completion.reactivate_request(witness.get() < 3);
        })
        .expect("start timeout");
        el.run().expect("run");
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn cancel_before_submit_never_fires() {
        let mut el = new_loop();
        let fired = Rc::new(Cell::new(false));
        let witness = Rc::clone(&fired);
        let id = el
            .start_timeout(Duration::from_secs(10), move |_| witness.set(true))
            .expect("start timeout");
        el.cancel(id).expect("cancel");
        el.run().expect("run returns immediately");
        assert!(!fired.get());
        assert_eq!(el.num_active_handles(), 0);
    }

    #[test]
    fn cancel_active_timer_never_fires() {
        let mut el = new_loop();
        let fired = Rc::new(Cell::new(false));
        let witness = Rc::clone(&fired);
        let id = el
            .start_timeout(Duration::from_secs(10), move |_| witness.set(true))
            .expect("start timeout");
        // One no-wait step moves the timer to the active list.
        el.run_no_wait().expect("stage");
        assert_eq!(el.num_active_handles(), 1);
        el.cancel(id).expect("cancel active");
        el.run().expect("drain the cancellation");
        assert!(!fired.get());
        assert_eq!(el.num_active_handles(), 0);
    }

    #[test]
    fn cancel_twice_fails() {
        let mut el = new_loop();
        let id = el
            .start_timeout(Duration::from_secs(10), |_| {})
            .expect("start timeout");
        el.run_no_wait().expect("stage");
        el.cancel(id).expect("first cancel");
        let err = el.cancel(id).expect_err("second cancel");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn cancel_with_foreign_id_is_wrong_loop() {
        let mut a = new_loop();
        let mut b = new_loop();
        let id = a
            .start_timeout(Duration::from_secs(10), |_| {})
            .expect("start timeout");
        let err = b.cancel(id).expect_err("foreign id");
        assert_eq!(err.kind(), ErrorKind::WrongLoop);
        a.close().expect("close");
    }

    #[test]
    fn external_count_keeps_run_alive_logically() {
        let mut el = new_loop();
        el.increase_active_count();
        assert_eq!(el.total_active_handles(), 1);
        el.decrease_active_count();
        assert_eq!(el.total_active_handles(), 0);
    }

    #[test]
    fn timers_fire_in_expiration_order() {
        let mut el = new_loop();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        for (label, ms) in [(2u8, 30u64), (1, 10), (3, 50)] {
            let order = Rc::clone(&order);
            el.start_timeout(Duration::from_millis(ms), move |_| {
                order.borrow_mut().push(label);
            })
            .expect("start timeout");
        }
        el.run().expect("run");
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn callback_may_start_another_request() {
        let mut el = new_loop();
        let second_fired = Rc::new(Cell::new(false));
        let witness = Rc::clone(&second_fired);
        el.start_timeout(Duration::from_millis(1), move |completion| {
            let witness = Rc::clone(&witness);
            completion
                .event_loop()
                .start_timeout(Duration::from_millis(1), move |_| witness.set(true))
                .expect("start from callback");
        })
        .expect("start timeout");
        el.run().expect("run");
        assert!(second_fired.get());
    }

    #[test]
    fn file_close_completes_manually() {
        let mut el = new_loop();
        let (a, b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        let fired = Rc::new(Cell::new(false));
        let witness = Rc::clone(&fired);
        let raw = {
            use std::os::fd::IntoRawFd;
            a.into_raw_fd()
        };
        el.start_file_close(raw, move |completion| {
            assert!(completion.outcome().is_ok());
            witness.set(true);
        })
        .expect("start close");
        el.run().expect("run");
        assert!(fired.get());
        drop(b);
    }
}
