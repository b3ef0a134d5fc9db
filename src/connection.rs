//! Per-socket state machine: buffered ingress, egress ring, close protocol.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer::{ByteBuffer, CircularBuffer};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;
use crate::wheel::ConnectionEntry;

/// Delivered a read-mode buffer holding the bytes just received.
pub type ReadMessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut ByteBuffer, Timestamp) + Send + Sync>;
/// Fired on connection teardown (exactly once) and on errors (before the
/// corresponding close).
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>, Timestamp) + Send + Sync>;
/// Fired for a new connection before it is installed; returning false rejects
/// it and closes the fd.
pub type EstablishedCallback = Arc<dyn Fn(&Arc<Connection>, Timestamp) -> bool + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Receiving,
    /// Peer is gone but queued egress bytes are still draining.
    Disconnecting,
    Closed,
}

/// A TCP connection pinned to one event loop.
///
/// Strong handles are held by the loop's fd map and by in-flight posted
/// callbacks; the timing wheel holds weak handles only. When the last strong
/// handle drops, the destructor closes the fd.
pub struct Connection {
    self_weak: Weak<Connection>,
    fd: RawFd,
    local: SocketAddr,
    peer: SocketAddr,
    event_loop: Weak<EventLoop>,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<State>,
    buffer_out: Mutex<Option<CircularBuffer>>,
    wheel_entry: Mutex<Weak<ConnectionEntry>>,
    read_message_callback: Mutex<Option<ReadMessageCallback>>,
    connection_closed_callback: Mutex<Option<ConnectionCallback>>,
    error_callback: Mutex<Option<ConnectionCallback>>,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        event_loop: &Arc<EventLoop>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Arc<Connection> {
        Arc::new_cyclic(|weak| Connection {
            self_weak: weak.clone(),
            fd,
            local,
            peer,
            event_loop: Arc::downgrade(event_loop),
            channel: Mutex::new(None),
            state: Mutex::new(State::New),
            buffer_out: Mutex::new(None),
            wheel_entry: Mutex::new(Weak::new()),
            read_message_callback: Mutex::new(None),
            connection_closed_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
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

    /// Register read interest and arm the readiness handlers. Must run on
    /// the loop thread; transitions New -> Receiving.
    pub fn accept(&self) {
        {
            let state = self.state.lock();
            if *state != State::New {
                error!(fd = self.fd, state = ?*state, "accept() on a non-new connection");
            }
        }
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };

        let channel = Channel::new(&event_loop, self.fd);

        let conn = self.self_weak.clone();
        channel.set_write_callback(Box::new(move |timestamp, _key| {
            if let Some(conn) = conn.upgrade() {
                conn.handle_write(timestamp);
            }
        }));

        let conn = self.self_weak.clone();
        channel.set_error_callback(Box::new(move |_timestamp, _key| {
            if let Some(conn) = conn.upgrade() {
                conn.force_close();
            }
        }));

        *self.channel.lock() = Some(channel.clone());

        let conn = self.self_weak.clone();
        channel.enable_reading(Box::new(move |timestamp, _key| {
            if let Some(conn) = conn.upgrade() {
                conn.handle_read(timestamp);
            }
        }));

        *self.state.lock() = State::Receiving;
    }

    fn handle_read(&self, timestamp: Timestamp) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let mut buffer = event_loop.recv_buffer.lock();
        buffer.clear();
        let n = {
            let spare = buffer.spare_mut();
            unsafe { libc::read(self.fd, spare.as_mut_ptr() as *mut libc::c_void, spare.len()) }
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if let Some(libc::EAGAIN) | Some(libc::EINTR) = err.raw_os_error() {
                return;
            }
            drop(buffer);
            if err.raw_os_error() == Some(libc::ECONNRESET) {
                debug!(fd = self.fd, "connection reset by peer");
            } else {
                error!(fd = self.fd, "read failed: {err}");
            }
            let error_cb = self.error_callback.lock().clone();
            if let Some(callback) = error_cb {
                callback(&this, timestamp);
            }
            self.force_close();
        } else if n == 0 {
            // peer shut down its write side
            drop(buffer);
            if let Some(channel) = self.channel() {
                channel.disable_reading();
            }
            self.close();
        } else {
            buffer.set_position(n as usize);
            buffer.flip();
            self.refresh_idle();
            let read_cb = self.read_message_callback.lock().clone();
            if let Some(callback) = read_cb {
                callback(&this, &mut buffer, timestamp);
            }
        }
    }

    /// Queue `data` for transmission. Returns false if the connection is
    /// already closed.
    ///
    /// From the loop thread the bytes go straight into the egress buffer;
    /// from any other thread they are copied and posted as a work item, so
    /// per-caller ordering is preserved.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(event_loop) = self.event_loop.upgrade() else {
            return false;
        };
        if event_loop.is_in_loop_thread() {
            self.do_write(data);
        } else {
            let Some(this) = self.self_weak.upgrade() else {
                return false;
            };
            let owned = data.to_vec();
            event_loop.post(move || this.do_write(&owned));
        }
        true
    }

    fn do_write(&self, data: &[u8]) {
        if self.is_closed() {
            self.force_close();
            return;
        }
        {
            let mut buffer_out = self.buffer_out.lock();
            let buffer =
                buffer_out.get_or_insert_with(|| CircularBuffer::with_capacity(data.len()));
            buffer.put(data);
        }
        if let Some(channel) = self.channel() {
            channel.enable_writing();
        }
        self.refresh_idle();
    }

    fn handle_write(&self, timestamp: Timestamp) {
        if self.is_closed() {
            // stale writable dispatch: the read handler closed us this iteration
            return;
        }
        let (total, drained) = {
            let mut buffer_out = self.buffer_out.lock();
            let Some(buffer) = buffer_out.as_mut() else {
                error!(fd = self.fd, "writable event with no egress buffer");
                std::process::abort();
            };
            if buffer.is_empty() {
                error!(fd = self.fd, "writable event with an empty egress buffer");
                std::process::abort();
            }
            let total = buffer.write_to_fd(self.fd);
            (total, buffer.is_empty())
        };

        if total < 0 {
            let error_cb = self.error_callback.lock().clone();
            if let Some(this) = self.self_weak.upgrade() {
                if let Some(callback) = error_cb {
                    callback(&this, timestamp);
                }
            }
            self.force_close();
        } else if total == 0 {
            self.force_close();
        } else if drained {
            if let Some(channel) = self.channel() {
                channel.disable_writing();
            }
            if self.state() == State::Disconnecting {
                self.close();
            }
        }
    }

    pub fn has_bytes_to_write(&self) -> bool {
        self.buffer_out
            .lock()
            .as_ref()
            .map(|buffer| !buffer.is_empty())
            .unwrap_or(false)
    }

    /// Graceful close: tear down once all queued egress bytes have drained.
    pub fn close(&self) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let Some(conn) = self.self_weak.upgrade() else {
            return;
        };
        event_loop.post(move || {
            if conn.is_closed() {
                return; // a racing force_close already tore us down
            }
            if conn.has_bytes_to_write() {
                *conn.state.lock() = State::Disconnecting;
                return;
            }
            *conn.state.lock() = State::Closed;
            if let Some(event_loop) = conn.event_loop.upgrade() {
                let closed_cb = conn.connection_closed_callback.lock().clone();
                if let Some(callback) = closed_cb {
                    callback(&conn, Timestamp::current_time());
                }
                event_loop.remove_connection(conn.fd);
            }
        });
    }

    /// Abrupt close: discard queued egress bytes and tear down now.
    ///
    /// Teardown is at-most-once: the closed callback and map removal only
    /// happen if the connection is still installed, however many racing
    /// paths (read error, write error, idle expiry) request it.
    pub fn force_close(&self) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let Some(conn) = self.self_weak.upgrade() else {
            return;
        };
        event_loop.post(move || {
            *conn.state.lock() = State::Closed;
            if let Some(buffer) = conn.buffer_out.lock().as_mut() {
                buffer.clear();
            }
            if let Some(channel) = conn.channel() {
                channel.disable_all();
            }
            let Some(event_loop) = conn.event_loop.upgrade() else {
                return;
            };
            if event_loop.contains_connection(conn.fd) {
                let closed_cb = conn.connection_closed_callback.lock().clone();
                if let Some(callback) = closed_cb {
                    callback(&conn, Timestamp::current_time());
                }
                event_loop.remove_connection(conn.fd);
            }
        });
    }

    /// Enroll this connection in the owning loop's timing wheel.
    pub fn set_default_timeout(&self) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let wheel = event_loop.timing_wheel.lock().clone();
        if let Some(wheel) = wheel {
            wheel.attach(&this);
        }
    }

    pub(crate) fn set_wheel_entry(&self, entry: Weak<ConnectionEntry>) {
        *self.wheel_entry.lock() = entry;
    }

    // O(1) deadline refresh: re-insert our wheel entry at the newest bucket.
    fn refresh_idle(&self) {
        let entry = self.wheel_entry.lock().upgrade();
        let Some(entry) = entry else {
            return;
        };
        let Some(event_loop) = self.event_loop.upgrade() else {
            return;
        };
        let wheel = event_loop.timing_wheel.lock().clone();
        if let Some(wheel) = wheel {
            wheel.refresh(entry);
        }
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(fd = self.fd, "connection dropped");
        unsafe {
            libc::close(self.fd);
        }
    }
}
