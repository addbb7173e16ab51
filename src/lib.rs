//! evio: a callback-driven asynchronous I/O event loop.
//!
//! # Overview
//!
//! An async operation is a request for some I/O made to the loop: timers,
//! cross-thread wake-ups, process-exit notifications, stream-socket
//! operations (accept/connect/send/receive/close) and file operations
//! (read/write/poll/close), multiplexed onto one kernel readiness
//! facility: epoll + signalfd on Linux, kqueue on macOS/BSD. Every request
//! has an associated callback invoked when the request is fulfilled, on
//! success and on error alike.
//!
//! # Core Guarantees
//!
//! - **At-most-once delivery**: each successful `start_*` leads to exactly
//!   one callback invocation, unless the callback reactivates the request
//!   (which counts as a new activation)
//! - **Cancellation safety**: after [`EventLoop::cancel`] returns `Ok`, the
//!   callback will not run for that activation
//! - **Wake-up coalescing**: any number of concurrent
//!   [`WakeUpHandle::wake_up`] calls between two steps collapse into one
//!   callback invocation
//! - **Caller-owned descriptors**: the loop never closes a descriptor it
//!   was handed, except through an explicit `*Close` request
//!
//! # Example
//!
//! ```no_run
//! use evio::{EventLoop, Options};
//! use std::time::Duration;
//!
//! let mut event_loop = EventLoop::create(Options::default())?;
//! event_loop.start_timeout(Duration::from_millis(100), |completion| {
//!     assert!(completion.outcome().is_ok());
//! })?;
//! event_loop.run()?;
//! # Ok::<(), evio::Error>(())
//! ```
//!
//! # Module Structure
//!
//! - [`error`]: error kinds and the crate [`Result`] alias
//! - `clock`: monotonic loop time and kernel timeout conversions
//! - `arena`: generational request storage behind [`RequestId`]
//! - [`request`]: request kinds, payloads and completion objects
//! - `wake`: [`WakeUpHandle`] and [`EventObject`]
//! - `backend`: the epoll/kqueue kernel queue (the only `unsafe` in the
//!   crate)
//! - [`event_loop`]: the orchestrator
//! - [`net`]: async socket creation and handle association
//!
//! # Threading
//!
//! The loop is single-threaded and cooperative. All callbacks run on the
//! thread driving `run*`. The only cross-thread entry point is
//! [`WakeUpHandle::wake_up`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

mod arena;
mod backend;
mod clock;
pub mod error;
pub mod event_loop;
pub mod net;
pub mod request;
mod wake;

pub use arena::RequestId;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event_loop::{ApiType, EventLoop, Options};
pub use net::AddressFamily;
pub use request::{Accepted, Completion, ExitStatus, RequestKind, Transferred};
pub use wake::{EventObject, WakeUpHandle};
