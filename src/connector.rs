//! Client-side non-blocking connect with timed retry.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;
use crate::timer::Timer;

/// Receives the connected fd once the handshake completes. Installing it as
/// a Connection is the caller's choice (`EventLoop::on_new_connection` is the
/// usual path).
pub type ConnectedCallback = Box<dyn FnMut(RawFd, Timestamp) + Send>;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
}

/// Drives the client-side connect handshake.
///
/// A non-blocking `connect` is issued; `EINPROGRESS` registers writable
/// interest, and the writable event consults `SO_ERROR`: zero hands the fd to
/// the connected callback, nonzero closes the socket and schedules a retry
/// with exponential backoff capped at 30 seconds.
pub struct Connector {
    self_weak: Weak<Connector>,
    event_loop: Arc<EventLoop>,
    peer: SocketAddr,
    state: Mutex<State>,
    socket: Mutex<Option<Socket>>,
    channel: Mutex<Option<Arc<Channel>>>,
    retry_delay: Mutex<Duration>,
    retry_timer: Mutex<Option<Arc<Timer>>>,
    connected_callback: Mutex<Option<ConnectedCallback>>,
}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>, peer: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            self_weak: weak.clone(),
            event_loop: event_loop.clone(),
            peer,
            state: Mutex::new(State::Disconnected),
            socket: Mutex::new(None),
            channel: Mutex::new(None),
            retry_delay: Mutex::new(INIT_RETRY_DELAY),
            retry_timer: Mutex::new(None),
            connected_callback: Mutex::new(None),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        *self.connected_callback.lock() = Some(callback);
    }

    /// Start connecting. Safe to call from any thread; the work runs on the
    /// loop.
    pub fn connect(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        self.event_loop.post(move || this.do_connect());
    }

    fn do_connect(&self) {
        {
            let state = self.state.lock();
            if matches!(*state, State::Connecting | State::Connected) {
                return;
            }
        }
        let domain = match self.peer {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(e) => {
                error!("socket creation failed: {e}");
                self.schedule_retry();
                return;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            error!("set_nonblocking failed: {e}");
            self.schedule_retry();
            return;
        }
        match socket.connect(&self.peer.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => {
                warn!(peer = %self.peer, "connect failed: {e}");
                self.schedule_retry();
                return;
            }
        }

        *self.state.lock() = State::Connecting;
        let fd = socket.as_raw_fd();
        *self.socket.lock() = Some(socket);

        let channel = Channel::new(&self.event_loop, fd);
        let connector = self.self_weak.clone();
        channel.set_write_callback(Box::new(move |timestamp, _key| {
            if let Some(connector) = connector.upgrade() {
                connector.handle_write(timestamp);
            }
        }));
        // the error event resolves through the same SO_ERROR check
        let connector = self.self_weak.clone();
        channel.set_error_callback(Box::new(move |timestamp, _key| {
            if let Some(connector) = connector.upgrade() {
                connector.handle_write(timestamp);
            }
        }));
        *self.channel.lock() = Some(channel.clone());
        channel.enable_writing();
    }

    fn handle_write(&self, timestamp: Timestamp) {
        {
            let state = self.state.lock();
            if *state != State::Connecting {
                return;
            }
        }
        // the interest channel is done either way: the fd moves on or dies
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove_from_loop();
        }
        let socket = self.socket.lock().take();
        let Some(socket) = socket else {
            return;
        };

        match so_error(socket.as_raw_fd()) {
            0 => {
                *self.state.lock() = State::Connected;
                *self.retry_delay.lock() = INIT_RETRY_DELAY;
                info!(peer = %self.peer, "connected");
                let fd = socket.into_raw_fd(); // ownership moves to the callback
                let callback = self.connected_callback.lock().take();
                if let Some(mut callback) = callback {
                    callback(fd, timestamp);
                    let mut slot = self.connected_callback.lock();
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                } else {
                    unsafe { libc::close(fd) };
                }
            }
            errno => {
                warn!(
                    peer = %self.peer,
                    "connect failed: {}",
                    io::Error::from_raw_os_error(errno)
                );
                drop(socket); // retry starts over with a fresh socket
                *self.state.lock() = State::Disconnected;
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&self) {
        *self.state.lock() = State::Retrying;
        let delay = {
            let mut retry_delay = self.retry_delay.lock();
            let delay = *retry_delay;
            *retry_delay = (*retry_delay * 2).min(MAX_RETRY_DELAY);
            delay
        };
        info!(peer = %self.peer, ?delay, "scheduling connect retry");
        let connector = self.self_weak.clone();
        let timer = Timer::after(
            &self.event_loop,
            delay,
            Box::new(move || {
                if let Some(connector) = connector.upgrade() {
                    *connector.state.lock() = State::Disconnected;
                    connector.do_connect();
                }
            }),
        );
        match timer {
            Ok(timer) => *self.retry_timer.lock() = Some(timer),
            Err(e) => error!("failed to arm retry timer: {e}"),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove_from_loop();
        }
        // dropping the socket and retry timer closes their fds
    }
}

fn so_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    }
    err
}
