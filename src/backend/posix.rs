//! Syscall executors shared by the readiness backends.
//!
//! These run once readiness is known (or, for regular files under epoll,
//! synchronously at activation). EINTR retries internally; EAGAIN after a
//! readiness report means the readiness was stale and completes with zero
//! bytes so the caller can re-arm.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;

use crate::error::{Error, ErrorKind, Result};
use crate::request::{FileReadState, FileWriteState, SocketReceiveState, SocketSendState};

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn close_fd(fd: RawFd) -> Result<()> {
    let res = unsafe { libc::close(fd) };
    if res != 0 {
        return Err(Error::last_os_error("close"));
    }
    Ok(())
}

pub(crate) fn execute_socket_send(st: &mut SocketSendState) -> Result<()> {
    let res = unsafe {
        libc::send(
            st.socket,
            st.buffer.as_ptr().cast(),
            st.buffer.len(),
            SEND_FLAGS,
        )
    };
    if res < 0 {
        return match errno() {
            // Readiness was stale; report zero bytes so the caller can
            // re-arm.
            libc::EAGAIN => {
                st.sent = 0;
                Ok(())
            }
            _ => Err(Error::last_os_error("send")),
        };
    }
    st.sent = res as usize;
    if st.sent != st.buffer.len() {
        return Err(Error::new(ErrorKind::Kernel).with_context("send wrote only part of the data"));
    }
    Ok(())
}

pub(crate) fn execute_socket_receive(st: &mut SocketReceiveState) -> Result<()> {
    loop {
        let res =
            unsafe { libc::recv(st.socket, st.buffer.as_mut_ptr().cast(), st.buffer.len(), 0) };
        if res > 0 {
            st.received = res as usize;
            return Ok(());
        }
        if res == 0 {
            return Err(
                Error::new(ErrorKind::PeerClosed).with_context("receive returned zero bytes")
            );
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {
                st.received = 0;
                return Ok(());
            }
            _ => return Err(Error::last_os_error("recv")),
        }
    }
}

pub(crate) fn execute_file_read(st: &mut FileReadState) -> Result<()> {
    loop {
        let res = if st.offset == 0 {
            unsafe { libc::read(st.file, st.buffer.as_mut_ptr().cast(), st.buffer.len()) }
        } else {
            unsafe {
                libc::pread(
                    st.file,
                    st.buffer.as_mut_ptr().cast(),
                    st.buffer.len(),
                    st.offset as libc::off_t,
                )
            }
        };
        if res >= 0 {
            st.transferred = res as usize;
            return Ok(());
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {
                st.transferred = 0;
                return Ok(());
            }
            _ => return Err(Error::last_os_error("read")),
        }
    }
}

pub(crate) fn execute_file_write(st: &mut FileWriteState) -> Result<()> {
    loop {
        let res = if st.offset == 0 {
            unsafe { libc::write(st.file, st.buffer.as_ptr().cast(), st.buffer.len()) }
        } else {
            unsafe {
                libc::pwrite(
                    st.file,
                    st.buffer.as_ptr().cast(),
                    st.buffer.len(),
                    st.offset as libc::off_t,
                )
            }
        };
        if res >= 0 {
            st.transferred = res as usize;
            return Ok(());
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {
                st.transferred = 0;
                return Ok(());
            }
            _ => return Err(Error::last_os_error("write")),
        }
    }
}
