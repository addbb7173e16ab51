//! Request records, kinds, states and completion objects.
//!
//! An async operation is a request for some I/O made to the loop. Every
//! request has an associated callback invoked when the request is
//! fulfilled; if `start_*` returns `Ok`, the callback runs exactly once per
//! activation, on success and on error alike (unless the callback asks for
//! reactivation, which counts as a new activation).
//!
//! # Lifecycle
//!
//! ```text
//! (start) ──▶ Setup ──▶ Submitting ──▶ Active ──▶ (complete) ──▶ Free
//!                │                       │              │
//!                │                       │              └─reactivate─▶ Submitting
//!                │                       └──cancel──▶ Cancelling ──▶ Free
//!                └──cancel before submit──▶ Free
//! ```
//!
//! `Free` is mostly represented by the record's slot being vacant; the
//! variant exists for the short window in which an expired timer's record is
//! already detached but its callback is still running.
//!
//! # Ownership
//!
//! Descriptors passed into socket and file operations are borrowed raw fds;
//! the loop never closes them except through an explicit `*Close` request.
//! Data buffers are moved into the request at `start` and handed back
//! through the completion's [`Transferred`] outcome.

use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arena::RequestId;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::net::AddressFamily;
use crate::wake::EventObject;

/// Kind of an async request (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Timer invoked after a relative expiration time has passed.
    LoopTimeout,
    /// Cross-thread wake-up notification.
    LoopWakeUp,
    /// Process exit notification.
    ProcessExit,
    /// Accept a connection on a listening socket.
    SocketAccept,
    /// Connect a socket to a remote endpoint.
    SocketConnect,
    /// Send bytes on a connected socket.
    SocketSend,
    /// Receive bytes from a connected socket.
    SocketReceive,
    /// Close a socket descriptor.
    SocketClose,
    /// Read bytes from a file descriptor.
    FileRead,
    /// Write bytes to a file descriptor.
    FileWrite,
    /// Close a file descriptor.
    FileClose,
    /// Readiness notification on a file descriptor, no data transfer.
    FilePoll,
}

impl RequestKind {
    /// Stable name used in lifecycle tracing.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LoopTimeout => "LoopTimeout",
            Self::LoopWakeUp => "LoopWakeUp",
            Self::ProcessExit => "ProcessExit",
            Self::SocketAccept => "SocketAccept",
            Self::SocketConnect => "SocketConnect",
            Self::SocketSend => "SocketSend",
            Self::SocketReceive => "SocketReceive",
            Self::SocketClose => "SocketClose",
            Self::FileRead => "FileRead",
            Self::FileWrite => "FileWrite",
            Self::FileClose => "FileClose",
            Self::FilePoll => "FilePoll",
        }
    }
}

impl core::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Detached; only observed transiently while a timer callback runs.
    Free,
    /// Queued on the submission queue, kernel setup not yet performed.
    Setup,
    /// Kernel setup done, activation pending or re-queued for rescheduling.
    Submitting,
    /// Monitored by the kernel (or queued for manual completion).
    Active,
    /// Cancel requested; queued so the next step runs kernel cancel.
    Cancelling,
    /// Final kernel cleanup pending.
    Teardown,
}

/// Per-request flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RequestFlags(u8);

impl RequestFlags {
    /// Completion is delivered through the manual-completion queue instead
    /// of a kernel event; the request does not count as an active handle.
    pub(crate) const MANUAL_COMPLETION: Self = Self(0b01);
    /// The descriptor is a regular file (epoll cannot poll those; I/O runs
    /// synchronously and completes manually).
    pub(crate) const REGULAR_FILE: Self = Self(0b10);

    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Boxed user callback invoked with the completion of a request.
pub(crate) type Callback<O> = Box<dyn FnMut(&mut Completion<'_, O>)>;

/// Exit information delivered by a `ProcessExit` completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// The child's exit code.
    pub code: i32,
}

/// Accepted connection delivered by a `SocketAccept` completion.
#[derive(Debug)]
pub struct Accepted {
    /// The connected client socket, non-blocking and close-on-exec.
    pub socket: OwnedFd,
}

/// Buffer handed back by send/receive/read/write completions.
///
/// `len` is the number of bytes actually transferred; for receives and
/// reads, [`data`](Self::data) is the prefix of the buffer that was filled.
#[derive(Debug, Default)]
pub struct Transferred {
    /// The buffer that was moved into the request at `start`.
    pub buffer: Vec<u8>,
    /// Number of bytes transferred.
    pub len: usize,
}

impl Transferred {
    /// The transferred prefix of the buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len.min(self.buffer.len())]
    }
}

/// Completion object passed to a request's callback.
///
/// Carries the operation outcome, grants access to the loop (so the
/// callback may start or cancel other requests), and carries the
/// reactivation switch: calling [`reactivate_request`] with `true` re-queues
/// the same request as if freshly started, without another `start_*` call.
///
/// [`reactivate_request`]: Self::reactivate_request
pub struct Completion<'l, O> {
    pub(crate) event_loop: &'l mut EventLoop,
    pub(crate) request: RequestId,
    pub(crate) outcome: Option<Result<O>>,
    pub(crate) reactivate: bool,
}

impl<O> Completion<'_, O> {
    /// The loop that delivered this completion.
    pub fn event_loop(&mut self) -> &mut EventLoop {
        self.event_loop
    }

    /// The id of the request this completion belongs to.
    ///
    /// The id is already detached at callback time: cancelling it fails
    /// with `InvalidState`, and it becomes valid again only through
    /// reactivation.
    #[must_use]
    pub const fn request(&self) -> RequestId {
        self.request
    }

    /// The operation outcome.
    ///
    /// # Panics
    ///
    /// Panics if the outcome has been moved out with
    /// [`take_outcome`](Self::take_outcome).
    #[must_use]
    pub fn outcome(&self) -> &Result<O> {
        self.outcome.as_ref().expect("completion outcome already taken")
    }

    /// Moves the outcome out of the completion.
    ///
    /// Taking an outcome that carries the request's buffer and *also*
    /// requesting reactivation leaves the request without a buffer; the
    /// next activation then fails with `EmptyBuffer` through the callback.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn take_outcome(&mut self) -> Result<O> {
        self.outcome.take().expect("completion outcome already taken")
    }

    /// Requests that the loop re-activate this request after the callback
    /// returns (default `false`).
    pub fn reactivate_request(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Timer payload.
pub(crate) struct TimeoutState {
    /// Original relative interval, re-applied on reactivation.
    pub interval: Duration,
    pub expires_at: Instant,
    pub callback: Option<Callback<()>>,
}

/// Wake-up payload. `pending` is shared with every [`crate::WakeUpHandle`]
/// clone and coalesces concurrent wake calls.
pub(crate) struct WakeUpState {
    pub pending: Arc<AtomicBool>,
    pub event_object: Option<Arc<EventObject>>,
    pub callback: Option<Callback<()>>,
}

pub(crate) struct ProcessExitState {
    pub pid: libc::pid_t,
    /// Filled by the backend when the exit notification arrives.
    pub exit_code: Option<i32>,
    pub callback: Option<Callback<ExitStatus>>,
}

pub(crate) struct SocketAcceptState {
    pub socket: RawFd,
    #[allow(dead_code)] // recorded for diagnostics; accept4 does not need it
    pub family: AddressFamily,
    /// Filled by the backend's completion.
    pub accepted: Option<OwnedFd>,
    pub callback: Option<Callback<Accepted>>,
}

pub(crate) struct SocketConnectState {
    pub socket: RawFd,
    pub addr: SocketAddr,
    pub callback: Option<Callback<()>>,
}

pub(crate) struct SocketSendState {
    pub socket: RawFd,
    pub buffer: Vec<u8>,
    pub sent: usize,
    pub callback: Option<Callback<Transferred>>,
}

pub(crate) struct SocketReceiveState {
    pub socket: RawFd,
    pub buffer: Vec<u8>,
    pub received: usize,
    pub callback: Option<Callback<Transferred>>,
}

pub(crate) struct SocketCloseState {
    pub socket: RawFd,
    pub callback: Option<Callback<()>>,
}

pub(crate) struct FileReadState {
    pub file: RawFd,
    pub buffer: Vec<u8>,
    /// `0` reads at the current position; non-zero issues positional I/O.
    pub offset: u64,
    /// Bytes read synchronously ahead of a manual completion.
    pub transferred: usize,
    pub callback: Option<Callback<Transferred>>,
}

pub(crate) struct FileWriteState {
    pub file: RawFd,
    pub buffer: Vec<u8>,
    pub offset: u64,
    pub transferred: usize,
    pub callback: Option<Callback<Transferred>>,
}

pub(crate) struct FileCloseState {
    pub file: RawFd,
    pub callback: Option<Callback<()>>,
}

pub(crate) struct FilePollState {
    pub file: RawFd,
    pub callback: Option<Callback<()>>,
}

/// Per-kind payload: the sealed sum the loop and the backends match on
/// exhaustively.
pub(crate) enum Payload {
    Timeout(TimeoutState),
    WakeUp(WakeUpState),
    ProcessExit(ProcessExitState),
    SocketAccept(SocketAcceptState),
    SocketConnect(SocketConnectState),
    SocketSend(SocketSendState),
    SocketReceive(SocketReceiveState),
    SocketClose(SocketCloseState),
    FileRead(FileReadState),
    FileWrite(FileWriteState),
    FileClose(FileCloseState),
    FilePoll(FilePollState),
}

impl Payload {
    pub(crate) const fn kind(&self) -> RequestKind {
        match self {
            Self::Timeout(_) => RequestKind::LoopTimeout,
            Self::WakeUp(_) => RequestKind::LoopWakeUp,
            Self::ProcessExit(_) => RequestKind::ProcessExit,
            Self::SocketAccept(_) => RequestKind::SocketAccept,
            Self::SocketConnect(_) => RequestKind::SocketConnect,
            Self::SocketSend(_) => RequestKind::SocketSend,
            Self::SocketReceive(_) => RequestKind::SocketReceive,
            Self::SocketClose(_) => RequestKind::SocketClose,
            Self::FileRead(_) => RequestKind::FileRead,
            Self::FileWrite(_) => RequestKind::FileWrite,
            Self::FileClose(_) => RequestKind::FileClose,
            Self::FilePoll(_) => RequestKind::FilePoll,
        }
    }
}

/// One request record, as stored in the loop's arena.
pub(crate) struct Record {
    pub state: RequestState,
    pub flags: RequestFlags,
    pub debug_name: Option<&'static str>,
    /// Index into the backend's last event batch; valid during completion.
    pub event_index: Option<usize>,
    pub payload: Payload,
}

impl Record {
    pub(crate) fn new(payload: Payload) -> Self {
        Self {
            state: RequestState::Setup,
            flags: RequestFlags::default(),
            debug_name: None,
            event_index: None,
            payload,
        }
    }

    pub(crate) const fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    pub(crate) fn name(&self) -> &'static str {
        self.debug_name.unwrap_or(self.kind().name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(RequestKind::LoopTimeout.name(), "LoopTimeout");
        assert_eq!(RequestKind::SocketReceive.to_string(), "SocketReceive");
        assert_eq!(RequestKind::FilePoll.name(), "FilePoll");
    }

    #[test]
    fn flags_insert_remove_contains() {
        let mut flags = RequestFlags::default();
        assert!(!flags.contains(RequestFlags::MANUAL_COMPLETION));
        flags.insert(RequestFlags::MANUAL_COMPLETION);
        flags.insert(RequestFlags::REGULAR_FILE);
        assert!(flags.contains(RequestFlags::MANUAL_COMPLETION));
        assert!(flags.contains(RequestFlags::REGULAR_FILE));
        flags.remove(RequestFlags::REGULAR_FILE);
        assert!(!flags.contains(RequestFlags::REGULAR_FILE));
        assert!(flags.contains(RequestFlags::MANUAL_COMPLETION));
    }

    #[test]
    fn transferred_data_is_the_filled_prefix() {
        let t = Transferred {
            buffer: vec![1, 2, 3, 4],
            len: 2,
        };
        assert_eq!(t.data(), &[1, 2]);
        let empty = Transferred::default();
        assert_eq!(empty.data(), &[] as &[u8]);
    }

    #[test]
    fn record_defaults_to_setup() {
        let record = Record::new(Payload::FilePoll(FilePollState {
            file: 0,
            callback: None,
        }));
        assert_eq!(record.state, RequestState::Setup);
        assert_eq!(record.kind(), RequestKind::FilePoll);
        assert_eq!(record.name(), "FilePoll");
    }
}
