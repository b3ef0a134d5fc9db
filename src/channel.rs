//! Per-fd interest management and readiness callback dispatch.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::event_loop::EventLoop;
use crate::selector::{SelectionKey, OP_READ, OP_WRITE};
use crate::time::Timestamp;

/// Callback invoked when a channel's fd becomes ready for an operation.
pub type SelectionCallback = Box<dyn FnMut(Timestamp, &SelectionKey) + Send>;

/// A file descriptor attached to an event loop's selector, with its current
/// interest mask and the callbacks to run on readiness.
///
/// Interest changes must happen on the loop's owner thread; callers on other
/// threads post a work item instead.
pub struct Channel {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    ops: Mutex<u8>,
    registered: Mutex<bool>,
    read_callback: Mutex<Option<SelectionCallback>>,
    write_callback: Mutex<Option<SelectionCallback>>,
    error_callback: Mutex<Option<SelectionCallback>>,
}

impl Channel {
    pub(crate) fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        let channel = Arc::new(Channel {
            fd,
            event_loop: Arc::downgrade(event_loop),
            ops: Mutex::new(0),
            registered: Mutex::new(false),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        });
        event_loop.add_channel(&channel);
        channel
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Install the read callback and add read interest.
    pub fn enable_reading(&self, callback: SelectionCallback) {
        *self.read_callback.lock() = Some(callback);
        self.set_ops(|ops| ops | OP_READ);
    }

    pub fn set_write_callback(&self, callback: SelectionCallback) {
        *self.write_callback.lock() = Some(callback);
    }

    pub fn set_error_callback(&self, callback: SelectionCallback) {
        *self.error_callback.lock() = Some(callback);
    }

    pub fn enable_writing(&self) {
        self.set_ops(|ops| ops | OP_WRITE);
    }

    pub fn disable_reading(&self) {
        self.set_ops(|ops| ops & !OP_READ);
    }

    pub fn disable_writing(&self) {
        self.set_ops(|ops| ops & !OP_WRITE);
    }

    pub fn disable_all(&self) {
        self.set_ops(|_| 0);
    }

    pub fn is_writing(&self) -> bool {
        *self.ops.lock() & OP_WRITE != 0
    }

    fn set_ops(&self, f: impl FnOnce(u8) -> u8) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        if !event_loop.is_in_loop_thread() {
            warn!(fd = self.fd, "channel interest changed off the loop thread");
        }
        let new_ops = {
            let mut ops = self.ops.lock();
            *ops = f(*ops);
            *ops
        };
        let mut registered = self.registered.lock();
        *registered = event_loop.apply_interest(self.fd, new_ops, *registered);
    }

    /// Drop this channel from the owning loop's channel table.
    pub(crate) fn remove_from_loop(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self.fd);
        }
    }

    pub(crate) fn handle_read(&self, timestamp: Timestamp, key: &SelectionKey) {
        self.dispatch(&self.read_callback, timestamp, key);
    }

    pub(crate) fn handle_write(&self, timestamp: Timestamp, key: &SelectionKey) {
        self.dispatch(&self.write_callback, timestamp, key);
    }

    pub(crate) fn handle_error(&self, timestamp: Timestamp, key: &SelectionKey) {
        self.dispatch(&self.error_callback, timestamp, key);
    }

    // The callback is taken out of its slot for the duration of the call so
    // it can change this channel's interest without re-entering a lock.
    fn dispatch(
        &self,
        slot: &Mutex<Option<SelectionCallback>>,
        timestamp: Timestamp,
        key: &SelectionKey,
    ) {
        let callback = slot.lock().take();
        if let Some(mut callback) = callback {
            callback(timestamp, key);
            let mut slot = slot.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}
