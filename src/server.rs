//! Acceptor plus a pool of worker loops with round-robin dispatch.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::connection::{ConnectionCallback, EstablishedCallback, ReadMessageCallback};
use crate::error::Error;
use crate::event_loop::EventLoop;

/// A multi-loop TCP server.
///
/// One main loop owns the acceptor; `worker.threads` additional loops each
/// run on their own thread with their own ingress buffer and timing wheel.
/// Accepted fds are handed round-robin to a worker (or served by the main
/// loop when there are no workers) by posting the install onto that loop.
///
/// Construct and `run` on the same thread; `stop` from any other thread.
pub struct TcpServer {
    main_loop: Arc<EventLoop>,
    addr: SocketAddr,
    config: Config,
    workers: Mutex<Vec<Arc<EventLoop>>>,
    worker_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    read_message_callback: Mutex<Option<ReadMessageCallback>>,
    connection_closed_callback: Mutex<Option<ConnectionCallback>>,
    error_callback: Mutex<Option<ConnectionCallback>>,
    established_callback: Mutex<Option<EstablishedCallback>>,
}

impl TcpServer {
    /// Create a server that will listen on `addr`. The main loop is bound to
    /// the calling thread.
    pub fn new(addr: &str, config: Config) -> Result<TcpServer, Error> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
        let main_loop = EventLoop::new()?;
        Ok(TcpServer {
            main_loop,
            addr,
            config,
            workers: Mutex::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
            acceptor: Mutex::new(None),
            read_message_callback: Mutex::new(None),
            connection_closed_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            established_callback: Mutex::new(None),
        })
    }

    pub fn main_loop(&self) -> &Arc<EventLoop> {
        &self.main_loop
    }

    /// The bound address, available once `run` has created the acceptor.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().map(|acceptor| acceptor.local_addr())
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

    /// Start the workers and the acceptor, then run the main loop on the
    /// calling thread until `stop`.
    pub fn run(&self) -> Result<(), Error> {
        self.configure_loop(&self.main_loop)?;
        self.spawn_workers()?;

        let acceptor = Acceptor::new(
            &self.main_loop,
            self.addr,
            self.config.backlog,
            self.config.reuse_port,
        )?;
        *self.acceptor.lock() = Some(acceptor.clone());

        let workers = self.workers.lock().clone();
        let main_loop = self.main_loop.clone();
        let tcp_nodelay = self.config.tcp_nodelay;
        let mut next = 0usize;
        acceptor.set_new_connection_callback(Box::new(move |fd, peer, local, timestamp| {
            if tcp_nodelay {
                set_nodelay(fd);
            }
            let target = if workers.is_empty() {
                main_loop.clone()
            } else {
                let target = workers[next % workers.len()].clone();
                next += 1;
                target
            };
            let install = target.clone();
            target.post(move || install.on_new_connection(fd, timestamp, local, peer));
        }));
        acceptor.listen();

        self.main_loop.run();
        Ok(())
    }

    /// Stop every worker loop, join the worker threads, then stop the main
    /// loop. Call from a thread other than the one running the server.
    pub fn stop(&self) {
        for worker in self.workers.lock().iter() {
            worker.stop();
        }
        for handle in self.worker_handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        self.main_loop.stop();
        info!("server stopped");
    }

    fn configure_loop(&self, event_loop: &Arc<EventLoop>) -> Result<(), Error> {
        event_loop.allocate_receive_buffer(self.config.recv_buffer_size);
        let read_cb = self.read_message_callback.lock().clone();
        if let Some(callback) = read_cb {
            event_loop.set_read_message_callback(callback);
        }
        let closed_cb = self.connection_closed_callback.lock().clone();
        if let Some(callback) = closed_cb {
            event_loop.set_connection_closed_callback(callback);
        }
        let error_cb = self.error_callback.lock().clone();
        if let Some(callback) = error_cb {
            event_loop.set_error_callback(callback);
        }
        let established_cb = self.established_callback.lock().clone();
        if let Some(callback) = established_cb {
            event_loop.set_established_callback(callback);
        }
        // with workers the main loop only accepts; the wheels live on the workers
        if self.config.idle_timeout_secs > 0 && self.config.worker.threads == 0 {
            event_loop.set_idle_timeout(self.config.idle_timeout_secs)?;
        }
        Ok(())
    }

    fn spawn_workers(&self) -> Result<(), Error> {
        let threads = self.config.worker.threads;
        if threads == 0 {
            return Ok(());
        }
        let (tx, rx) = crossbeam_channel::bounded::<io::Result<Arc<EventLoop>>>(threads);

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let tx = tx.clone();
            let recv_buffer_size = self.config.recv_buffer_size;
            let idle_timeout_secs = self.config.idle_timeout_secs;
            let read_cb = self.read_message_callback.lock().clone();
            let closed_cb = self.connection_closed_callback.lock().clone();
            let error_cb = self.error_callback.lock().clone();
            let established_cb = self.established_callback.lock().clone();

            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{worker_id}"))
                .spawn(move || {
                    let event_loop = match EventLoop::new() {
                        Ok(event_loop) => event_loop,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    event_loop.allocate_receive_buffer(recv_buffer_size);
                    if let Some(callback) = read_cb {
                        event_loop.set_read_message_callback(callback);
                    }
                    if let Some(callback) = closed_cb {
                        event_loop.set_connection_closed_callback(callback);
                    }
                    if let Some(callback) = error_cb {
                        event_loop.set_error_callback(callback);
                    }
                    if let Some(callback) = established_cb {
                        event_loop.set_established_callback(callback);
                    }
                    if idle_timeout_secs > 0 {
                        if let Err(e) = event_loop.set_idle_timeout(idle_timeout_secs) {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                    let _ = tx.send(Ok(event_loop.clone()));
                    event_loop.run();
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }
        drop(tx);

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            match rx.recv() {
                Ok(Ok(event_loop)) => workers.push(event_loop),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "worker failed to start",
                    )))
                }
            }
        }
        *self.workers.lock() = workers;
        *self.worker_handles.lock() = handles;
        Ok(())
    }
}

fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
