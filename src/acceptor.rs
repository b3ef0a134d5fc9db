//! Listening socket: accept loop and new-connection dispatch.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::addr;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// Receives each accepted fd with its peer address, the listener's local
/// address, and the dispatch timestamp.
pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr, SocketAddr, Timestamp) + Send>;

/// A non-blocking listener registered for read interest on an event loop.
///
/// On readiness it drains `accept4` until the kernel has nothing left,
/// invoking the new-connection callback per fd. `EMFILE` is survived with the
/// reserved-slot trick: a spare `/dev/null` fd is closed to make room, the
/// pending connection is accepted and immediately closed, and the spare is
/// reopened.
pub struct Acceptor {
    self_weak: Weak<Acceptor>,
    socket: Socket,
    local: SocketAddr,
    channel: Arc<Channel>,
    idle_fd: Mutex<RawFd>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Bind and listen on `addr`. The channel is created but read interest
    /// is not registered until `listen` is called.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        addr: SocketAddr,
        backlog: i32,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            let optval: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_REUSEPORT,
                    &optval as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))?;

        let idle_fd = open_dev_null()?;
        let channel = Channel::new(event_loop, socket.as_raw_fd());

        Ok(Arc::new_cyclic(|weak| Acceptor {
            self_weak: weak.clone(),
            socket,
            local,
            channel,
            idle_fd: Mutex::new(idle_fd),
            new_connection_callback: Mutex::new(None),
        }))
    }

    /// The bound address (with the OS-assigned port when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock() = Some(callback);
    }

    /// Register read interest on the owning loop. Must run on the loop
    /// thread.
    pub fn listen(&self) {
        let acceptor = self.self_weak.clone();
        self.channel.enable_reading(Box::new(move |timestamp, _key| {
            if let Some(acceptor) = acceptor.upgrade() {
                acceptor.handle_accept(timestamp);
            }
        }));
        info!(addr = %self.local, "listening");
    }

    fn handle_accept(&self, timestamp: Timestamp) {
        let listen_fd = self.socket.as_raw_fd();
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if fd >= 0 {
                let peer = match addr::decode_sockaddr(&storage) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("accepted socket with undecodable peer address: {e}");
                        unsafe { libc::close(fd) };
                        continue;
                    }
                };
                let callback = self.new_connection_callback.lock().take();
                if let Some(mut callback) = callback {
                    callback(fd, peer, self.local, timestamp);
                    let mut slot = self.new_connection_callback.lock();
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                } else {
                    unsafe { libc::close(fd) };
                }
                continue;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) => {
                    warn!("accept: file descriptor limit reached, shedding one connection");
                    let mut idle = self.idle_fd.lock();
                    unsafe { libc::close(*idle) };
                    let victim = unsafe {
                        libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut())
                    };
                    if victim >= 0 {
                        unsafe { libc::close(victim) };
                    }
                    *idle = open_dev_null().unwrap_or(-1);
                    continue;
                }
                _ => {
                    error!("accept failed: {err}");
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove_from_loop();
        let idle = *self.idle_fd.lock();
        if idle >= 0 {
            unsafe { libc::close(idle) };
        }
        // the Socket closes the listen fd on drop
    }
}

fn open_dev_null() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
