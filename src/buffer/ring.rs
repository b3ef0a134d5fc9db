//! Growable ring buffer with direct scatter I/O.

use std::os::unix::io::RawFd;

use tracing::warn;

/// Growth warning threshold. The buffer keeps growing past this rather than
/// dropping bytes, but a connection queuing this much egress is almost
/// certainly stuck behind a dead peer.
const GROWTH_WARNING: usize = 1 << 30;

/// A circular byte buffer.
///
/// Capacity is always a power of two; `head` and `tail` are free-running
/// counters and storage indexing masks them with `capacity - 1`. `put` grows
/// the buffer by repeated doubling, preserving contents and logical order.
pub struct CircularBuffer {
    storage: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl CircularBuffer {
    /// Create a buffer whose capacity is `capacity` rounded up to a power of
    /// two.
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(1);
        CircularBuffer {
            storage: vec![0u8; cap].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Stored byte count.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes available to read. Alias of `len`.
    #[inline]
    pub fn readable(&self) -> usize {
        self.len()
    }

    /// Bytes that fit without growing.
    #[inline]
    pub fn writable(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Discard all stored bytes.
    pub fn clear(&mut self) {
        self.head = self.tail;
    }

    /// Append `src`, doubling the capacity until it fits.
    pub fn put(&mut self, src: &[u8]) {
        if src.len() > self.writable() {
            self.grow(self.len() + src.len());
        }
        let cap = self.storage.len();
        let t = self.tail & (cap - 1);
        let first = src.len().min(cap - t);
        self.storage[t..t + first].copy_from_slice(&src[..first]);
        self.storage[..src.len() - first].copy_from_slice(&src[first..]);
        self.tail = self.tail.wrapping_add(src.len());
    }

    /// Copy out up to `dst.len()` bytes and advance the head.
    /// Returns the number of bytes copied.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.head = self.head.wrapping_add(n);
        n
    }

    /// Copy out up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        if n == 0 {
            return 0;
        }
        let (a, b) = self.segments();
        let first = n.min(a.len());
        dst[..first].copy_from_slice(&a[..first]);
        if n > first {
            dst[first..n].copy_from_slice(&b[..n - first]);
        }
        n
    }

    /// The stored bytes as up to two slices in logical order; the second is
    /// the wrapped remainder and may be empty.
    pub fn segments(&self) -> (&[u8], &[u8]) {
        let len = self.len();
        if len == 0 {
            return (&[], &[]);
        }
        let cap = self.storage.len();
        let h = self.head & (cap - 1);
        let first = len.min(cap - h);
        (&self.storage[h..h + first], &self.storage[..len - first])
    }

    /// Write the stored bytes to `fd` with a single gathering `writev`,
    /// advancing the head by whatever the kernel took.
    ///
    /// Returns the byte count on success, 0 when the socket would block, and
    /// a negative value on a fatal write error. `EINTR` is retried.
    pub fn write_to_fd(&mut self, fd: RawFd) -> isize {
        if self.is_empty() {
            return 0;
        }
        let (a, b) = self.segments();
        let iov = [
            libc::iovec {
                iov_base: a.as_ptr() as *mut libc::c_void,
                iov_len: a.len(),
            },
            libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            },
        ];
        let iovcnt: libc::c_int = if b.is_empty() { 1 } else { 2 };
        loop {
            let n = unsafe { libc::writev(fd, iov.as_ptr(), iovcnt) };
            if n >= 0 {
                self.head = self.head.wrapping_add(n as usize);
                return n as isize;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return 0,
                _ => return -1,
            }
        }
    }

    fn grow(&mut self, needed: usize) {
        let mut new_cap = self.storage.len();
        while new_cap < needed {
            new_cap *= 2;
        }
        if new_cap > GROWTH_WARNING {
            warn!(bytes = new_cap, "circular buffer grew past the warning threshold");
        }
        let len = self.len();
        let mut new_storage = vec![0u8; new_cap].into_boxed_slice();
        {
            let (a, b) = self.segments();
            new_storage[..a.len()].copy_from_slice(a);
            new_storage[a.len()..a.len() + b.len()].copy_from_slice(b);
        }
        self.storage = new_storage;
        self.head = 0;
        self.tail = len;
    }
}
