//! The reactor: readiness multiplexing plus cross-thread work items.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::buffer::ByteBuffer;
use crate::channel::Channel;
use crate::connection::{
    Connection, ConnectionCallback, EstablishedCallback, ReadMessageCallback,
};
use crate::selector::{ops_to_string, SelectionKey, Selector};
use crate::time::Timestamp;
use crate::wheel::TimingWheel;

/// A work item posted onto a loop.
pub type Callback = Box<dyn FnOnce() + Send>;

const SELECT_TIMEOUT_MS: i32 = 8000;
const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;

/// A single-threaded event loop.
///
/// The loop is bound to the thread that constructed it; `run` must be called
/// there, and every channel-interest or connection-state mutation happens on
/// that thread. The only cross-thread surfaces are `post` (work items woken
/// through an eventfd) and `stop` (which joins on the running latch).
pub struct EventLoop {
    self_weak: Weak<EventLoop>,
    owner: ThreadId,
    is_quit: AtomicBool,
    selector: Mutex<Selector>,
    wakeup_fd: RawFd,
    pending: Mutex<Vec<Callback>>,
    running: Mutex<()>,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
    pub(crate) connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
    pub(crate) recv_buffer: Mutex<ByteBuffer>,
    pub(crate) timing_wheel: Mutex<Option<Arc<TimingWheel>>>,
    read_message_callback: Mutex<Option<ReadMessageCallback>>,
    connection_closed_callback: Mutex<Option<ConnectionCallback>>,
    error_callback: Mutex<Option<ConnectionCallback>>,
    established_callback: Mutex<Option<EstablishedCallback>>,
}

impl EventLoop {
    /// Create a loop bound to the current thread.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let selector = Selector::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let event_loop = Arc::new_cyclic(|weak| EventLoop {
            self_weak: weak.clone(),
            owner: thread::current().id(),
            is_quit: AtomicBool::new(false),
            selector: Mutex::new(selector),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(()),
            channels: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            recv_buffer: Mutex::new(ByteBuffer::new(DEFAULT_RECV_BUFFER_SIZE)),
            timing_wheel: Mutex::new(None),
            read_message_callback: Mutex::new(None),
            connection_closed_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            established_callback: Mutex::new(None),
        });

        // The wakeup channel only drains the eventfd counter; waking the
        // selector is the entire point.
        let wakeup_channel = Channel::new(&event_loop, wakeup_fd);
        wakeup_channel.enable_reading(Box::new(move |_timestamp, _key| {
            let mut counter: u64 = 0;
            let n = unsafe {
                libc::read(wakeup_fd, &mut counter as *mut u64 as *mut libc::c_void, 8)
            };
            if n < 0 {
                error!("wakeup eventfd read failed: {}", io::Error::last_os_error());
            }
        }));

        Ok(event_loop)
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Resize the shared ingress buffer. Call before `run`.
    pub fn allocate_receive_buffer(&self, size: usize) {
        *self.recv_buffer.lock() = ByteBuffer::new(size);
    }

    /// Enable idle expiry: connections quiet for `timeout_secs` are closed.
    /// Must be called on the loop thread, before `run`.
    pub fn set_idle_timeout(&self, timeout_secs: u64) -> io::Result<()> {
        let Some(this) = self.self_weak.upgrade() else {
            return Ok(());
        };
        let wheel = TimingWheel::new(&this, timeout_secs as usize)?;
        *self.timing_wheel.lock() = Some(wheel);
        Ok(())
    }

    /// Run the loop until `stop`. Blocks the calling thread, which must be
    /// the thread that created the loop.
    pub fn run(&self) {
        if !self.is_in_loop_thread() {
            warn!("run() called off the owning thread");
        }
        let _running = self.running.lock();
        let mut active_keys: Vec<SelectionKey> = Vec::with_capacity(128);

        while !self.is_quit.load(Ordering::Acquire) {
            let timestamp = match self.selector.lock().select(SELECT_TIMEOUT_MS, &mut active_keys)
            {
                Ok(timestamp) => timestamp,
                Err(e) => {
                    error!("select failed: {e}");
                    continue;
                }
            };

            for key in &active_keys {
                let channel = self.channels.lock().get(&key.fd()).cloned();
                let Some(channel) = channel else {
                    continue;
                };
                trace!(fd = key.fd(), ops = ops_to_string(key.ready_ops()), "dispatch");
                if key.is_readable() {
                    channel.handle_read(timestamp, key);
                }
                if key.is_writable() {
                    channel.handle_write(timestamp, key);
                }
                if key.is_error() {
                    channel.handle_error(timestamp, key);
                }
            }

            let callbacks = std::mem::take(&mut *self.pending.lock());
            for callback in callbacks {
                callback();
            }
        }
        info!("event loop exiting");
    }

    /// Run `callback` on the loop thread: inline when called from it,
    /// otherwise queued and woken through the wakeup fd.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            callback();
        } else {
            self.pending.lock().push(Box::new(callback));
            self.wake_up();
        }
    }

    /// Ask the loop to exit. From any other thread this blocks until `run`
    /// returns; from the loop thread it only sets the flag (the current
    /// iteration finishes first).
    pub fn stop(&self) {
        self.is_quit.store(true, Ordering::Release);
        if self.is_in_loop_thread() {
            return;
        }
        self.wake_up();
        drop(self.running.lock());
    }

    fn wake_up(&self) {
        if self.is_in_loop_thread() {
            return;
        }
        let one: u64 = 1;
        let n = unsafe {
            libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if n < 0 {
            error!("wakeup eventfd write failed: {}", io::Error::last_os_error());
        }
    }

    pub(crate) fn add_channel(&self, channel: &Arc<Channel>) {
        self.channels.lock().insert(channel.fd(), channel.clone());
    }

    pub(crate) fn remove_channel(&self, fd: RawFd) {
        self.channels.lock().remove(&fd);
    }

    /// Apply an interest mask to the selector; returns the new registration
    /// state for the fd.
    pub(crate) fn apply_interest(&self, fd: RawFd, ops: u8, registered: bool) -> bool {
        let mut selector = self.selector.lock();
        if ops == 0 {
            if registered {
                selector.deregister(fd);
            }
            false
        } else if registered {
            if let Err(e) = selector.reregister(fd, ops) {
                error!(fd, "reregister failed: {e}");
            }
            true
        } else {
            match selector.register(fd, ops) {
                Ok(()) => true,
                Err(e) => {
                    error!(fd, "register failed: {e}");
                    false
                }
            }
        }
    }

    pub(crate) fn contains_connection(&self, fd: RawFd) -> bool {
        self.connections.lock().contains_key(&fd)
    }

    /// Look up an installed connection by fd.
    pub fn connection(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.lock().get(&fd).cloned()
    }

    /// Drop the connection and channel table entries for `fd`. The
    /// connection's destructor runs (and closes the fd) when the last strong
    /// handle goes away.
    pub fn remove_connection(&self, fd: RawFd) {
        self.connections.lock().remove(&fd);
        self.remove_channel(fd);
    }

    pub fn set_read_message_callback(&self, callback: ReadMessageCallback) {
        *self.read_message_callback.lock() = Some(callback);
    }

    pub fn set_connection_closed_callback(&self, callback: ConnectionCallback) {
        *self.connection_closed_callback.lock() = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ConnectionCallback) {
        *self.error_callback.lock() = Some(callback);
    }

    pub fn set_established_callback(&self, callback: EstablishedCallback) {
        *self.established_callback.lock() = Some(callback);
    }

    /// Install a freshly accepted or connected fd as a Connection on this
    /// loop, wiring in the loop's default callbacks.
    ///
    /// The established callback may veto the connection; the fd is then
    /// closed without further callbacks.
    pub fn on_new_connection(
        &self,
        fd: RawFd,
        timestamp: Timestamp,
        local: SocketAddr,
        peer: SocketAddr,
    ) {
        let Some(this) = self.self_weak.upgrade() else {
            unsafe { libc::close(fd) };
            return;
        };

        let connection = Connection::new(fd, &this, local, peer);
        let read_cb = self.read_message_callback.lock().clone();
        if let Some(callback) = read_cb {
            connection.set_read_message_callback(callback);
        }
        let closed_cb = self.connection_closed_callback.lock().clone();
        if let Some(callback) = closed_cb {
            connection.set_connection_closed_callback(callback);
        }
        let error_cb = self.error_callback.lock().clone();
        if let Some(callback) = error_cb {
            connection.set_error_callback(callback);
        }

        let established = self.established_callback.lock().clone();
        if let Some(callback) = established {
            if !callback(&connection, timestamp) {
                info!(fd, "connection rejected by established callback");
                return; // dropping the connection closes the fd
            }
        }

        self.post(move || {
            connection.accept();
            this.connections.lock().insert(connection.fd(), connection.clone());
            connection.set_default_timeout();
            trace!(fd = connection.fd(), peer = %connection.peer_addr(), "new connection");
        });
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
        info!("event loop dropped");
    }
}
