// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! eventfd wrapper.
//!
//! Eventfds are the notification currency of the whole system: the NIC's
//! MSI-X vectors get bound to them through the driver, contexts hand one to
//! the slow path for wakeups, and the slow path exposes one that
//! applications kick after posting requests. They are plain counters, no
//! payload: a signal means "go look at your rings".

use super::{Result, ShmError};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Owned nonblocking eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a fresh nonblocking eventfd with counter zero.
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall; the result is checked.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ShmError::EventFd(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Adopt a descriptor received over `SCM_RIGHTS`. Takes ownership.
    #[must_use]
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Give up ownership of the descriptor (for handing it across a
    /// channel or socket).
    #[must_use]
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }

    /// Duplicate the descriptor (for handing it to another owner).
    pub fn try_clone(&self) -> Result<Self> {
        // SAFETY: fd is valid for the lifetime of self.
        let fd = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(ShmError::EventFd(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Add one to the counter, waking any poller.
    pub fn signal(&self) -> Result<()> {
        let val: u64 = 1;
        // SAFETY: fd valid, buffer is 8 bytes as eventfd requires.
        let ret = unsafe {
            libc::write(
                self.fd,
                std::ptr::addr_of!(val).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret != std::mem::size_of::<u64>() as isize {
            return Err(ShmError::EventFd(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Read and reset the counter. Returns the accumulated count, zero if
    /// nothing was pending.
    pub fn drain(&self) -> Result<u64> {
        let mut val: u64 = 0;
        // SAFETY: fd valid, buffer is 8 bytes.
        let ret = unsafe {
            libc::read(
                self.fd,
                std::ptr::addr_of_mut!(val).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret == std::mem::size_of::<u64>() as isize {
            return Ok(val);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        Err(ShmError::EventFd(err))
    }

    /// Block until the counter is nonzero or the timeout expires. Returns
    /// `true` when signaled. Does not drain.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.map_or(-1i32, |t| t.as_millis().min(i32::MAX as u128) as i32);
        // SAFETY: pfd points at one valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            return Err(ShmError::EventFd(io::Error::last_os_error()));
        }
        Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
