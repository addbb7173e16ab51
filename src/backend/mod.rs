//! Platform backends for kernel event multiplexing.
//!
//! A backend owns the kernel queue descriptor and implements, per request
//! kind, up to five operations the loop drives through the request
//! lifecycle:
//!
//! | Operation | Readiness backend meaning |
//! |---|---|
//! | `setup` | register the descriptor with the right filter |
//! | `activate` | per-activation kick (non-blocking `connect`, sync file I/O) |
//! | `complete` | the readiness is known; issue the actual syscall |
//! | `cancel` | remove the watcher (idempotent) |
//! | `teardown` | final cleanup after completion or cancellation |
//!
//! `setup`/`activate` return a [`Staged`] disposition: `Armed` means the
//! kernel will report an event; `Manual` means the operation already
//! finished synchronously (close requests, regular-file I/O under epoll)
//! and the loop must deliver the completion through its manual-completion
//! queue.
//!
//! # Platform Backends
//!
//! | Platform | Backend | Module |
//! |----------|---------|--------|
//! | Linux | epoll + signalfd + eventfd | `epoll` |
//! | macOS/BSD | kqueue + self-pipe | `kqueue` |
//!
//! Both modules expose the same inherent API (`Backend`, `Notifier`); this
//! module selects one at compile time. The raw syscall surface is the only
//! place in the crate where `unsafe` is allowed.

use crate::arena::RESERVED_INDEX;

pub(crate) mod posix;

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::{Backend, Notifier};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::{Backend, Notifier};

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
compile_error!("evio requires an epoll or kqueue platform");

/// Kernel user-data word for the shared wake-up endpoint.
pub(crate) const WAKE_TOKEN: u64 = RESERVED_INDEX as u64;

/// Kernel user-data word for the shared SIGCHLD watcher (Linux signalfd).
pub(crate) const SIGCHLD_TOKEN: u64 = (1u64 << 32) | RESERVED_INDEX as u64;

/// How the kernel wait behaves for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// Poll with a zero timeout and return immediately.
    NoWait,
    /// Block until at least one event, bounded by the earliest timer.
    ForcedForwardProgress,
}

/// Disposition of a `setup`/`activate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staged {
    /// The kernel will deliver an event for this request.
    Armed,
    /// The operation already finished; schedule a manual completion.
    Manual,
}

/// Portable copy of one kernel event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    /// User-data word from the registration (packed request id or a
    /// reserved token).
    pub token: u64,
    /// Filter payload (kqueue `data`; exit status for `EVFILT_PROC`).
    #[allow(dead_code)] // read by the kqueue backend only
    pub data: i64,
}
