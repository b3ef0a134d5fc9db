//! Thin wrapper over the kernel's readiness-notification facility.

use std::io;
use std::os::unix::io::RawFd;

use crate::time::Timestamp;

/// Interest/ready bit: the fd has (or wants) readable data.
pub const OP_READ: u8 = 0b001;
/// Interest/ready bit: the fd has (or wants) writable space.
pub const OP_WRITE: u8 = 0b010;
/// Ready-only bit: the kernel reported an error condition on the fd.
pub const OP_ERROR: u8 = 0b100;

pub(crate) fn ops_to_string(ops: u8) -> &'static str {
    match (ops & OP_READ != 0, ops & OP_WRITE != 0, ops & OP_ERROR != 0) {
        (true, true, _) => "read|write",
        (true, false, false) => "read",
        (false, true, false) => "write",
        (true, false, true) => "read|error",
        (false, true, true) => "write|error",
        (false, false, true) => "error",
        (false, false, false) => "none",
    }
}

/// The selector's record of a ready fd after a poll.
#[derive(Debug, Clone, Copy)]
pub struct SelectionKey {
    fd: RawFd,
    ready: u8,
}

impl SelectionKey {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn ready_ops(&self) -> u8 {
        self.ready
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.ready & OP_READ != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.ready & OP_WRITE != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.ready & OP_ERROR != 0
    }
}

/// Level-triggered epoll instance with a reusable event buffer.
///
/// The epoll token is the fd itself: a fd is registered through at most one
/// Channel per selector, so the mapping is injective.
pub struct Selector {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Selector {
            epfd,
            events: Vec::with_capacity(1024),
        })
    }

    fn epoll_flags(ops: u8) -> u32 {
        let mut flags = 0u32;
        if ops & OP_READ != 0 {
            flags |= libc::EPOLLIN as u32;
        }
        if ops & OP_WRITE != 0 {
            flags |= libc::EPOLLOUT as u32;
        }
        flags
    }

    /// Add `fd` to the interest set.
    pub fn register(&mut self, fd: RawFd, ops: u8) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, ops)
    }

    /// Replace the interest mask of an already-registered `fd`.
    pub fn reregister(&mut self, fd: RawFd, ops: u8) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, ops)
    }

    /// Drop `fd` from the interest set. Errors are ignored: the fd may
    /// already be closed, which removes it implicitly.
    pub fn deregister(&mut self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, ops: u8) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::epoll_flags(ops),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block up to `timeout_ms` for readiness, fill `out_keys` with the fds
    /// whose ready mask is non-empty, and return the current time.
    ///
    /// `out_keys` is cleared on entry. `EINTR` is retried internally.
    pub fn select(
        &mut self,
        timeout_ms: i32,
        out_keys: &mut Vec<SelectionKey>,
    ) -> io::Result<Timestamp> {
        out_keys.clear();
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.capacity() as libc::c_int,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { self.events.set_len(n as usize) };
            for ev in &self.events {
                let fd = ev.u64 as RawFd;
                let mut ready = 0u8;
                if ev.events & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0 {
                    ready |= OP_READ;
                }
                if ev.events & libc::EPOLLOUT as u32 != 0 {
                    ready |= OP_WRITE;
                }
                if ev.events & libc::EPOLLERR as u32 != 0 {
                    ready |= OP_ERROR;
                }
                if ready != 0 {
                    out_keys.push(SelectionKey { fd, ready });
                }
            }
            return Ok(Timestamp::current_time());
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_times_out_with_no_fds() {
        let mut selector = Selector::new().unwrap();
        let mut keys = Vec::new();
        let before = Timestamp::current_time();
        let after = selector.select(20, &mut keys).unwrap();
        assert!(keys.is_empty());
        assert!(after >= before);
    }

    #[test]
    fn eventfd_becomes_readable() {
        let mut selector = Selector::new().unwrap();
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        selector.register(efd, OP_READ).unwrap();

        let mut keys = Vec::new();
        selector.select(0, &mut keys).unwrap();
        assert!(keys.is_empty());

        let one: u64 = 1;
        unsafe { libc::write(efd, &one as *const u64 as *const libc::c_void, 8) };
        selector.select(1000, &mut keys).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].fd(), efd);
        assert!(keys[0].is_readable());
        assert!(!keys[0].is_writable());

        selector.deregister(efd);
        unsafe { libc::close(efd) };
    }
}
