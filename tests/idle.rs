//! Timing-wheel idle expiry.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use riptide::{Config, TcpServer};

fn idle_config() -> Config {
    let mut config = Config::default();
    config.idle_timeout_secs = 2;
    config
}

fn start_server(config: Config) -> (Arc<TcpServer>, std::net::SocketAddr, thread::JoinHandle<()>, Arc<AtomicUsize>) {
    let closed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::bounded(1);

    let closed_cb = closed.clone();
    let handle = thread::spawn(move || {
        let server = Arc::new(TcpServer::new("127.0.0.1:0", config).unwrap());
        server.set_read_message_callback(Arc::new(|conn, buffer, _timestamp| {
            conn.write(buffer.as_slice());
        }));
        server.set_connection_closed_callback(Arc::new(move |_conn, _timestamp| {
            closed_cb.fetch_add(1, Ordering::SeqCst);
        }));
        tx.send(server.clone()).unwrap();
        server.run().unwrap();
    });
    let server: Arc<TcpServer> = rx.recv().unwrap();
    let addr = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
    };
    (server, addr, handle, closed)
}

#[test]
fn idle_connection_is_expired() {
    let (server, addr, handle, closed) = start_server(idle_config());

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(6))).unwrap();

    // send nothing; the wheel should close us within the timeout window
    let start = Instant::now();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "expected EOF from idle expiry, got data");
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "idle expiry took too long"
    );
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn activity_refreshes_the_deadline() {
    let (server, addr, handle, closed) = start_server(idle_config());

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // keep writing for well past the idle timeout; each byte is echoed back
    let start = Instant::now();
    let mut buf = [0u8; 1];
    while start.elapsed() < Duration::from_secs(4) {
        client.write_all(b"k").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"k");
        thread::sleep(Duration::from_millis(300));
    }
    // the connection outlived several timeout windows
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    // now go quiet and let the wheel take it
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    server.stop();
    handle.join().unwrap();
}
