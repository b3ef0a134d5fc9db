//! Timing wheel for idle-connection expiry.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::connection::Connection;
use crate::event_loop::EventLoop;
use crate::timer::Timer;

/// One-shot handle to a connection inside the wheel.
///
/// Buckets hold these by `Arc`; a connection may appear in several buckets at
/// once, and only the drop of the *last* bucket reference fires. The drop
/// upgrades the weak connection handle and force-closes it, so a connection
/// that is already gone costs nothing.
pub struct ConnectionEntry {
    connection: Weak<Connection>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            trace!(fd = connection.fd(), "idle timeout expired");
            connection.force_close();
        }
    }
}

/// A fixed ring of per-second buckets of connection entries.
///
/// A repeating 1-second timer pops the oldest bucket and pushes an empty one;
/// refreshing a connection's deadline is an O(1) push into the newest bucket.
pub struct TimingWheel {
    buckets: Mutex<VecDeque<Vec<Arc<ConnectionEntry>>>>,
    timer: Mutex<Option<Arc<Timer>>>,
}

impl TimingWheel {
    /// Build a wheel of `timeout_secs` buckets on `event_loop`. Must be
    /// called on the loop thread.
    pub fn new(event_loop: &Arc<EventLoop>, timeout_secs: usize) -> io::Result<Arc<TimingWheel>> {
        assert!(timeout_secs > 0, "idle timeout must be at least one second");
        let mut buckets = VecDeque::with_capacity(timeout_secs);
        for _ in 0..timeout_secs {
            buckets.push_back(Vec::new());
        }
        let wheel = Arc::new(TimingWheel {
            buckets: Mutex::new(buckets),
            timer: Mutex::new(None),
        });

        let weak = Arc::downgrade(&wheel);
        let timer = Timer::repeating(
            event_loop,
            Duration::from_secs(1),
            Box::new(move || {
                if let Some(wheel) = weak.upgrade() {
                    wheel.tick();
                }
            }),
        )?;
        *wheel.timer.lock() = Some(timer);
        Ok(wheel)
    }

    /// Enroll a connection: create its entry, hand the connection a weak
    /// reference to it, and drop it into the newest bucket.
    pub(crate) fn attach(&self, connection: &Arc<Connection>) {
        let entry = Arc::new(ConnectionEntry {
            connection: Arc::downgrade(connection),
        });
        connection.set_wheel_entry(Arc::downgrade(&entry));
        if let Some(bucket) = self.buckets.lock().back_mut() {
            bucket.push(entry);
        }
    }

    /// Push an existing entry into the newest bucket, extending its life by
    /// the full timeout. Stale copies in older buckets expire harmlessly.
    pub(crate) fn refresh(&self, entry: Arc<ConnectionEntry>) {
        if let Some(bucket) = self.buckets.lock().back_mut() {
            bucket.push(entry);
        }
    }

    fn tick(&self) {
        let expired = {
            let mut buckets = self.buckets.lock();
            let expired = buckets.pop_front().unwrap_or_default();
            buckets.push_back(Vec::new());
            expired
        };
        // entry destructors (and any force_close they trigger) run here,
        // outside the bucket lock
        drop(expired);
    }
}
