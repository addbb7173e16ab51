//! Socket creation and handle association.
//!
//! Sockets handed to the loop must be non-blocking.
//! [`EventLoop::create_async_tcp_socket`] creates a stream socket with the
//! right flags and registers it; `associate_*` register descriptors created
//! elsewhere. On the readiness backends (epoll, kqueue) association is a
//! no-op kept for portability: completion backends require descriptors to
//! be bound to the kernel queue before I/O can be submitted.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::EventLoop;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl From<AddressFamily> for Domain {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        }
    }
}

impl EventLoop {
    /// Creates a TCP socket of the given family with async-friendly flags
    /// (non-blocking, close-on-exec) and associates it with the loop.
    pub fn create_async_tcp_socket(&mut self, family: AddressFamily) -> Result<OwnedFd> {
        self.ensure_open()?;
        let socket = Socket::new(family.into(), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;
        let fd = OwnedFd::from(socket);
        self.associate_socket(fd.as_raw_fd())?;
        Ok(fd)
    }

    /// Associates a socket created externally with the loop.
    ///
    /// No-op on epoll/kqueue; the descriptor is registered per request.
    pub fn associate_socket(&mut self, socket: RawFd) -> Result<()> {
        self.ensure_open()?;
        validate_fd(socket)
    }

    /// Associates a file descriptor created externally with the loop.
    ///
    /// No-op on epoll/kqueue; the descriptor is registered per request.
    pub fn associate_file(&mut self, file: RawFd) -> Result<()> {
        self.ensure_open()?;
        validate_fd(file)
    }
}

fn validate_fd(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::new(ErrorKind::InvalidHandle).with_context("negative descriptor"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Options;

    #[test]
    fn created_socket_is_nonblocking() {
        let mut el = EventLoop::create(Options::default()).expect("loop");
        let fd = el
            .create_async_tcp_socket(AddressFamily::Ipv6)
            .expect("socket");
        let flags = unsafe_fcntl_getfl(fd.as_raw_fd());
        assert!(flags & libc::O_NONBLOCK != 0, "socket must be non-blocking");
    }

    #[test]
    fn associate_rejects_negative_fd() {
        let mut el = EventLoop::create(Options::default()).expect("loop");
        let err = el.associate_socket(-1).expect_err("negative fd");
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn associate_after_close_fails() {
        let mut el = EventLoop::create(Options::default()).expect("loop");
        el.close().expect("close");
        let err = el.associate_file(0).expect_err("closed loop");
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    fn unsafe_fcntl_getfl(fd: RawFd) -> libc::c_int {
        // Test-only peek at the descriptor flags.
        #[allow(unsafe_code)]
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        flags
    }
}
