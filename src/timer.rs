//! timerfd-backed timers, delivered as loop channels.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Callback invoked on timer expiry.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// A one-shot or repeating timer owned by an event loop.
///
/// The timerfd is registered as a read-interest channel; its readiness
/// callback drains the expiration counter and runs the user callback.
/// One-shot timers deregister themselves after firing.
pub struct Timer {
    fd: RawFd,
    channel: Arc<Channel>,
}

impl Timer {
    /// Fire `callback` every `interval`, starting one `interval` from now.
    pub fn repeating(
        event_loop: &Arc<EventLoop>,
        interval: Duration,
        callback: TimerCallback,
    ) -> io::Result<Arc<Timer>> {
        Self::arm(event_loop, interval, true, callback)
    }

    /// Fire `callback` once, `delay` from now.
    pub fn after(
        event_loop: &Arc<EventLoop>,
        delay: Duration,
        callback: TimerCallback,
    ) -> io::Result<Arc<Timer>> {
        Self::arm(event_loop, delay, false, callback)
    }

    fn arm(
        event_loop: &Arc<EventLoop>,
        period: Duration,
        periodic: bool,
        mut callback: TimerCallback,
    ) -> io::Result<Arc<Timer>> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // a zeroed it_value would disarm the timer outright
        let mut value = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        };
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }
        let spec = libc::itimerspec {
            it_interval: if periodic {
                value
            } else {
                libc::timespec { tv_sec: 0, tv_nsec: 0 }
            },
            it_value: value,
        };
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let channel = Channel::new(event_loop, fd);
        let timer = Arc::new(Timer {
            fd,
            channel: channel.clone(),
        });

        let weak = Arc::downgrade(&timer);
        channel.enable_reading(Box::new(move |_timestamp, _key| {
            let Some(timer) = weak.upgrade() else {
                return;
            };
            let mut expirations: u64 = 0;
            let n = unsafe {
                libc::read(
                    timer.fd,
                    &mut expirations as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            if n < 0 {
                return; // spurious wakeup
            }
            callback();
            if !periodic {
                timer.disarm();
            }
        }));

        Ok(timer)
    }

    fn disarm(&self) {
        self.channel.disable_all();
        self.channel.remove_from_loop();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove_from_loop();
        unsafe {
            libc::close(self.fd);
        }
    }
}
